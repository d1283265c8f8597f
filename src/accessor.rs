//! Per-register accessor: the caller-facing handle for reading and writing
//! one register, synchronously or via subscription.
//!
//! Grounded in `original_source/include/OPC-UA-BackendRegisterAccessor.h`
//! (`doReadTransferSynchronously`, `doPostRead`, `doWriteTransfer`,
//! `handleError`, the destructor's `unsubscribe`) and
//! `src/SubscriptionManager.cc`'s fan-out contract into a per-accessor
//! notification queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use opcua::types::Variant;
use tracing::warn;

use crate::codec::{build_array_variant, variant_elements, AccessorValue};
use crate::connection::Connection;
use crate::error::{BackendError, BackendResult};
use crate::subscription::{AccessorId, NotificationSink, SubscriptionManager};
use crate::types::{DataValue, RegisterInfo};
use crate::version_map::{self, VersionNumber};

const NOTIFICATION_QUEUE_CAPACITY: usize = 3;

/// One entry delivered through an accessor's notification queue: a value, an
/// exception pushed by the subscription manager, or the distinguished
/// interrupt sentinel (spec.md §4.6, "Interrupt").
enum QueueEntry {
    Value(DataValue),
    Exception(BackendError),
    Interrupt,
}

/// Bounded, overwrite-oldest notification queue (spec.md §3: "notifications
/// (bounded queue, capacity 3)").
struct NotificationQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    condvar: Condvar,
}

impl NotificationQueue {
    fn new() -> Self {
        NotificationQueue {
            entries: Mutex::new(VecDeque::with_capacity(NOTIFICATION_QUEUE_CAPACITY)),
            condvar: Condvar::new(),
        }
    }

    fn push(&self, entry: QueueEntry) {
        let mut entries = self.entries.lock().expect("notification queue poisoned");
        if entries.len() == NOTIFICATION_QUEUE_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
        self.condvar.notify_one();
    }

    /// Blocks until an entry is available. There is no timeout: the only
    /// ways to unblock a waiting reader are a new value, an exception, or an
    /// explicit `interrupt()` (spec.md §5, "Suspension points").
    fn blocking_pop(&self) -> QueueEntry {
        let mut entries = self.entries.lock().expect("notification queue poisoned");
        while entries.is_empty() {
            entries = self.condvar.wait(entries).expect("notification queue poisoned");
        }
        entries.pop_front().expect("queue non-empty under lock")
    }
}

/// Outcome of a blocking `read()` on a subscribed accessor: either fresh data
/// was decoded, or the wait was interrupted without producing data.
pub enum ReadOutcome {
    Updated(VersionNumber),
    Interrupted,
}

/// A caller-facing handle onto `numberOfWords` elements of one register,
/// starting at `offsetInRegister`. Generic over the user-facing value type
/// `T` (one of the primitives implementing [`AccessorValue`]).
pub struct Accessor<T: AccessorValue> {
    path: String,
    register_info: Arc<RegisterInfo>,
    connection: Arc<Connection>,
    subscription_manager: Option<Arc<SubscriptionManager>>,
    number_of_words: usize,
    offset_in_register: usize,
    is_partial: bool,
    subscribed: AtomicBool,
    accessor_id: Mutex<Option<AccessorId>>,
    /// L3: protects the decode step and the initial-value handoff.
    data_update_mutex: Mutex<()>,
    buffer: Mutex<Vec<T>>,
    last_data_value: Mutex<DataValue>,
    current_version: Mutex<VersionNumber>,
    queue: NotificationQueue,
}

impl<T: AccessorValue> Accessor<T> {
    /// Constructs and, if `wait_for_new_data` is set on the register and a
    /// subscription manager is supplied, subscribes this accessor to data
    /// changes. `subscription_manager` is `None` exactly when the caller
    /// opted out of asynchronous notification for this register.
    ///
    /// Forbids the `raw` access mode (spec.md §4.6: "Forbid the 'raw'
    /// access-mode flag").
    pub fn new(
        path: String,
        register_info: Arc<RegisterInfo>,
        connection: Arc<Connection>,
        subscription_manager: Option<Arc<SubscriptionManager>>,
        number_of_words: usize,
        offset_in_register: usize,
    ) -> BackendResult<Arc<Self>> {
        if register_info.access_modes.raw {
            return Err(BackendError::logic(format!(
                "register '{path}' was opened with the unsupported 'raw' access mode"
            )));
        }

        // Open question #2 (spec.md §9): a strict sub-range always forces
        // `is_partial`, regardless of whether the requested length equals
        // the register's full length.
        let is_partial = offset_in_register > 0 || number_of_words != register_info.array_length;

        let initial_version = version_map::get_version(0);
        let accessor = Arc::new(Accessor {
            path,
            register_info,
            connection,
            subscription_manager,
            number_of_words,
            offset_in_register,
            is_partial,
            subscribed: AtomicBool::new(false),
            accessor_id: Mutex::new(None),
            data_update_mutex: Mutex::new(()),
            buffer: Mutex::new(vec![T::default_value(); number_of_words]),
            last_data_value: Mutex::new(DataValue::empty()),
            current_version: Mutex::new(initial_version),
            queue: NotificationQueue::new(),
        });

        if accessor.register_info.access_modes.wait_for_new_data {
            if let Some(manager) = accessor.subscription_manager.clone() {
                let sink: Arc<dyn NotificationSink> = Arc::clone(&accessor) as Arc<dyn NotificationSink>;
                let id = manager.subscribe(&accessor.register_info.browse_name, accessor.register_info.node_id.clone(), sink)?;
                *accessor.accessor_id.lock().expect("accessor id mutex poisoned") = Some(id);
                accessor.subscribed.store(true, Ordering::SeqCst);

                if manager.is_async_read_active() {
                    manager.ensure_running();
                    std::thread::sleep(Duration::from_millis(
                        u64::from(accessor.connection.publishing_interval_ms) * 2,
                    ));
                }
            }
        }

        Ok(accessor)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn register_info(&self) -> &RegisterInfo {
        &self.register_info
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn current_version(&self) -> VersionNumber {
        *self.current_version.lock().expect("version mutex poisoned")
    }

    /// Interrupts a pending blocking `read()`, causing it to return
    /// [`ReadOutcome::Interrupted`] without touching the buffer.
    pub fn interrupt(&self) {
        self.queue.push(QueueEntry::Interrupt);
    }

    /// Reads the current values. If subscribed, blocks on the notification
    /// queue for the next value, exception, or interrupt; otherwise performs
    /// a synchronous read against the live connection.
    pub fn read(&self) -> BackendResult<ReadOutcome> {
        if self.subscribed.load(Ordering::SeqCst) {
            match self.queue.blocking_pop() {
                QueueEntry::Interrupt => Ok(ReadOutcome::Interrupted),
                QueueEntry::Exception(err) => Err(err),
                QueueEntry::Value(value) => {
                    let _guard = self.data_update_mutex.lock().expect("data update mutex poisoned");
                    *self.last_data_value.lock().expect("data value mutex poisoned") = value;
                    self.do_post_read(true).map(ReadOutcome::Updated)
                }
            }
        } else {
            self.do_read_transfer_synchronously()?;
            let _guard = self.data_update_mutex.lock().expect("data update mutex poisoned");
            self.do_post_read(true).map(ReadOutcome::Updated)
        }
    }

    /// Copies the most recently decoded buffer out. Call after a successful
    /// `read()`.
    pub fn buffer(&self) -> Vec<T> {
        self.buffer.lock().expect("buffer mutex poisoned").clone()
    }

    /// `doReadTransferSynchronously`: reads the node's value attribute under
    /// `clientMutex`, stamping the source timestamp with "now" since a
    /// synchronous read has no server-assigned timestamp to reuse.
    fn do_read_transfer_synchronously(&self) -> BackendResult<()> {
        let index_range = self.register_info.index_range.as_deref();
        let result = {
            let _guard = self.connection.client_mutex.lock().expect("client mutex poisoned");
            self.connection.client().read_value(&self.register_info.node_id, index_range)
        };
        match result {
            Ok(mut value) => {
                value.source_timestamp = version_map::now_as_ua_datetime();
                *self.last_data_value.lock().expect("data value mutex poisoned") = value;
                Ok(())
            }
            Err(e) => Err(self.handle_error(&e.to_string())),
        }
    }

    /// `doPostRead(hasNewData)`: decodes `[offsetInRegister, offsetInRegister
    /// + numberOfWords)` of the wire value into the user buffer and mints a
    /// [`VersionNumber`] from the source timestamp.
    fn do_post_read(&self, has_new_data: bool) -> BackendResult<VersionNumber> {
        if !has_new_data {
            return Ok(self.current_version());
        }
        let last = self.last_data_value.lock().expect("data value mutex poisoned");
        if !last.has_value {
            return Err(BackendError::runtime(format!(
                "register '{}' has no data available",
                self.path
            )));
        }
        let elements = variant_elements(&last.variant);
        let mut buffer = self.buffer.lock().expect("buffer mutex poisoned");
        for i in 0..self.number_of_words {
            let source_index = self.offset_in_register + i;
            let element = elements.get(source_index).ok_or_else(|| {
                BackendError::runtime(format!(
                    "register '{}' wire value has {} element(s), expected at least {}",
                    self.path,
                    elements.len(),
                    source_index + 1
                ))
            })?;
            buffer[i] = T::decode(element).map_err(|e| BackendError::runtime(e.0))?;
        }
        let version = version_map::get_version(last.source_timestamp);
        *self.current_version.lock().expect("version mutex poisoned") = version;
        Ok(version)
    }

    /// `doWriteTransfer(versionNumber)`: if `isPartial`, the read and the
    /// write share a single `clientMutex` critical section (spec.md §9 open
    /// question #1) so no other writer can interleave between the
    /// read-modify and the write.
    pub fn write(&self, values: &[T], version: VersionNumber) -> BackendResult<()> {
        if self.register_info.read_only {
            return Err(BackendError::logic(format!(
                "register '{}' is read-only",
                self.path
            )));
        }
        if values.len() != self.number_of_words {
            return Err(BackendError::logic(format!(
                "register '{}' expects {} element(s), got {}",
                self.path,
                self.number_of_words,
                values.len()
            )));
        }

        let array_length = self.register_info.array_length;
        let guard = self.connection.client_mutex.lock().expect("client mutex poisoned");

        let mut elements = if self.is_partial {
            let index_range = self.register_info.index_range.as_deref();
            match self.connection.client().read_value(&self.register_info.node_id, index_range) {
                Ok(value) => variant_elements(&value.variant),
                Err(e) => {
                    drop(guard);
                    return Err(self.handle_error(&e.to_string()));
                }
            }
        } else {
            vec![Variant::Empty; array_length]
        };
        if elements.len() < array_length {
            elements.resize(array_length, Variant::Empty);
        }

        for (i, value) in values.iter().enumerate() {
            let encoded = value
                .encode(self.register_info.type_code)
                .map_err(|e| BackendError::logic(e.0))?;
            elements[self.offset_in_register + i] = encoded;
        }

        let wire_value = if array_length == 1 {
            elements.into_iter().next().unwrap_or(Variant::Empty)
        } else {
            match build_array_variant(elements, self.register_info.type_code) {
                Ok(v) => v,
                Err(e) => {
                    drop(guard);
                    return Err(e);
                }
            }
        };

        let index_range = self.register_info.index_range.as_deref();
        let write_result = self
            .connection
            .client()
            .write_value(&self.register_info.node_id, wire_value, index_range);
        drop(guard);

        match write_result {
            Ok(()) => {
                *self.current_version.lock().expect("version mutex poisoned") = version;
                Ok(())
            }
            Err(BackendError::Logic(msg)) => {
                if let Some(manager) = &self.subscription_manager {
                    manager.set_external_error(&self.register_info.browse_name);
                }
                Err(BackendError::logic(format!(
                    "variable '{}' is not writable: {msg}",
                    self.path
                )))
            }
            Err(e) => Err(self.handle_error(&e.to_string())),
        }
    }

    /// `handleError(status)`: marks an external error on the subscription
    /// manager (if any), closes the connection, and returns a `RuntimeError`
    /// carrying the node and status.
    fn handle_error(&self, message: &str) -> BackendError {
        warn!(node = %self.register_info.node_id, error = message, "transfer failed");
        if let Some(manager) = &self.subscription_manager {
            manager.set_external_error(&self.register_info.browse_name);
        }
        self.connection.close();
        BackendError::runtime(format!(
            "transfer failed for node {}: {message}",
            self.register_info.node_id
        ))
    }
}

impl<T: AccessorValue> NotificationSink for Accessor<T> {
    fn push_value(&self, value: DataValue) {
        self.queue.push(QueueEntry::Value(value));
    }

    fn push_exception(&self, err: BackendError) {
        self.queue.push(QueueEntry::Exception(err));
    }

    fn index_range(&self) -> Option<String> {
        self.register_info.index_range.clone()
    }
}

impl<T: AccessorValue> Drop for Accessor<T> {
    fn drop(&mut self) {
        if self.subscribed.load(Ordering::SeqCst) {
            if let (Some(manager), Some(id)) = (
                &self.subscription_manager,
                self.accessor_id.lock().expect("accessor id mutex poisoned").take(),
            ) {
                manager.unsubscribe(&self.register_info.browse_name, id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendParameters;
    use crate::native::fake::FakeClient;
    use crate::native::OpcUaClientOps as _;
    use crate::types::{AccessModeFlags, DataDescriptor, NodeId, TypeCode};
    use std::collections::HashMap as Map;

    fn params() -> BackendParameters {
        let mut map = Map::new();
        map.insert("port".to_string(), "4840".to_string());
        BackendParameters::from_map("localhost", &map).unwrap()
    }

    fn connected_connection() -> (Arc<Connection>, Arc<FakeClient>) {
        let fake = Arc::new(FakeClient::new());
        fake.connect().unwrap();
        let conn = Arc::new(Connection::new(Box::new(Arc::clone(&fake)), &params()));
        (conn, fake)
    }

    fn register(node_id: NodeId, read_only: bool, array_length: usize) -> Arc<RegisterInfo> {
        let mut access_modes = AccessModeFlags::default();
        access_modes.wait_for_new_data = true;
        Arc::new(RegisterInfo {
            path: "scalar/int32".to_string(),
            node_id,
            browse_name: "scalar/int32".to_string(),
            type_code: TypeCode::I32,
            array_length,
            read_only,
            index_range: None,
            description: String::new(),
            access_modes,
            data_descriptor: DataDescriptor::for_type_code(TypeCode::I32),
        })
    }

    #[test]
    fn synchronous_read_decodes_into_buffer() {
        let (conn, fake) = connected_connection();
        let node = NodeId::Numeric { namespace: 2, id: 1 };
        fake.set_value(
            &node,
            DataValue {
                variant: opcua::types::Variant::Int32(42),
                source_timestamp: 1,
                status: opcua::types::StatusCode::Good,
                has_value: true,
            },
        );
        let reg = register(node, false, 1);
        let accessor: Arc<Accessor<i32>> = Accessor::new("scalar/int32".to_string(), reg, conn, None, 1, 0).unwrap();
        assert!(!accessor.is_subscribed());
        match accessor.read().unwrap() {
            ReadOutcome::Updated(_) => {}
            ReadOutcome::Interrupted => panic!("unexpected interrupt"),
        }
        assert_eq!(accessor.buffer(), vec![42]);
    }

    #[test]
    fn write_to_read_only_register_is_a_logic_error() {
        let (conn, _fake) = connected_connection();
        let node = NodeId::Numeric { namespace: 2, id: 1 };
        let reg = register(node, true, 1);
        let accessor: Arc<Accessor<i32>> = Accessor::new("scalar/int32".to_string(), reg, conn, None, 1, 0).unwrap();
        let err = accessor.write(&[1], accessor.current_version()).unwrap_err();
        assert!(err.is_logic());
    }

    #[test]
    fn raw_access_mode_is_rejected_at_construction() {
        let (conn, _fake) = connected_connection();
        let node = NodeId::Numeric { namespace: 2, id: 1 };
        let mut reg = (*register(node, false, 1)).clone();
        reg.access_modes.raw = true;
        let err = Accessor::<i32>::new("scalar/int32".to_string(), Arc::new(reg), conn, None, 1, 0).unwrap_err();
        assert!(err.is_logic());
    }

    #[test]
    fn partial_write_forces_read_modify_write() {
        let (conn, fake) = connected_connection();
        let node = NodeId::Numeric { namespace: 2, id: 1 };
        fake.set_value(
            &node,
            DataValue {
                variant: crate::codec::build_array_variant(
                    vec![opcua::types::Variant::Int32(1), opcua::types::Variant::Int32(2), opcua::types::Variant::Int32(3)],
                    TypeCode::I32,
                )
                .unwrap(),
                source_timestamp: 1,
                status: opcua::types::StatusCode::Good,
                has_value: true,
            },
        );
        let reg = register(node.clone(), false, 3);
        // Only accessing 1 element at offset 1 of a 3-element register: partial.
        let accessor: Arc<Accessor<i32>> = Accessor::new("scalar/int32".to_string(), reg, conn, None, 1, 1).unwrap();
        accessor.write(&[99], accessor.current_version()).unwrap();
        let updated = fake.values.lock().unwrap().get(&node.to_string()).cloned().unwrap();
        let decoded: Vec<i32> = variant_elements(&updated.variant)
            .iter()
            .map(|v| crate::codec::decode_numeric(v).unwrap())
            .collect();
        assert_eq!(decoded, vec![1, 99, 3]);
    }

    #[test]
    fn interrupt_unblocks_a_subscribed_reader() {
        let (conn, fake) = connected_connection();
        let node = NodeId::Numeric { namespace: 2, id: 1 };
        let manager = Arc::new(SubscriptionManager::new(Arc::clone(&conn)));
        let reg = register(node, false, 1);
        let accessor: Arc<Accessor<i32>> =
            Accessor::new("scalar/int32".to_string(), reg, conn, Some(manager), 1, 0).unwrap();
        assert!(accessor.is_subscribed());
        let accessor_for_thread = Arc::clone(&accessor);
        let handle = std::thread::spawn(move || accessor_for_thread.read().map(|_| ()).is_ok());
        std::thread::sleep(Duration::from_millis(20));
        accessor.interrupt();
        let _ = handle.join();
        let _ = fake.connected.lock().unwrap();
    }
}
