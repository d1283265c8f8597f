//! Composition root: owns the `Connection`, the `Catalogue`, and a lazily
//! created `SubscriptionManager`; implements `open`/`close`/
//! `activateAsyncRead`/`setException` and the register-accessor factory.
//!
//! Grounded in `original_source/src/OPC-UA-Backend.cc` and
//! `include/OPC-UA-Backend.h`. The out-of-scope collaborators (mapfile disk
//! I/O, the XML catalogue cache, CLI/parameter parsing) hand this module
//! already-parsed data: a `BackendParameters`, an optional
//! `Vec<mapfile::MapEntry>`, or a previously loaded `catalogue::cache::CatalogueDocument`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use tracing::{info, warn};

use crate::catalogue::mapfile::MapEntry;
use crate::catalogue::Catalogue;
use crate::codec::AccessorValue;
use crate::config::{BackendParameters, RootNode};
use crate::connection::Connection;
use crate::error::{BackendError, BackendResult};
use crate::native::OpcUaClientOps;
use crate::subscription::SubscriptionManager;
use crate::types::NodeId;
use crate::{accessor::Accessor, catalogue};

fn next_handle() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Process-wide map from a `Backend`'s opaque handle to the instance itself,
/// standing in for the native-handle -> Backend map spec.md §4.4/§9 describes
/// ("the native library's C callbacks accept only a typed handle ... lookup
/// in the callback and dispatch to the owning instance"). A live caller
/// wires [`dispatch_state_change`] / [`dispatch_subscription_inactive`] to
/// the native client's state-change and inactivity callbacks, passing the
/// `Backend`'s `handle()` through as the opaque context.
fn registry() -> &'static Mutex<HashMap<u64, Weak<Backend>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u64, Weak<Backend>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Routes a channel/session state-change callback to the owning `Backend`.
/// On `session_activated && channel_open`, marks the backend functional;
/// otherwise marks it non-functional and, if it is currently `opened`, pushes
/// an exception through every subscribed accessor (spec.md §4.7).
pub fn dispatch_state_change(handle: u64, channel_open: bool, session_activated: bool) {
    if let Some(backend) = registry().lock().expect("backend registry poisoned").get(&handle).and_then(Weak::upgrade) {
        backend.on_state_change(channel_open, session_activated);
    } else {
        warn!(handle, "state-change callback for an unknown/dropped backend handle");
    }
}

/// Routes a subscription-inactivity callback to the owning `Backend`. Same
/// effect as a bad state-change callback, plus it forces the connection
/// closed so the next `open()` reconnects cleanly (spec.md §4.7).
pub fn dispatch_subscription_inactive(handle: u64) {
    if let Some(backend) = registry().lock().expect("backend registry poisoned").get(&handle).and_then(Weak::upgrade) {
        backend.on_subscription_inactive();
    } else {
        warn!(handle, "inactivity callback for an unknown/dropped backend handle");
    }
}

/// Composition root for one OPC UA register-access backend instance.
pub struct Backend {
    handle: u64,
    connection: Arc<Connection>,
    catalogue: Mutex<Catalogue>,
    subscription_manager: Mutex<Option<Arc<SubscriptionManager>>>,
    map_entries: Option<Vec<MapEntry>>,
    root: Option<RootNode>,
    opened: AtomicBool,
    is_functional: AtomicBool,
    /// L4: serializes `activate_async_read` against concurrent callers
    /// through a logical-name-mapping layer (spec.md §4.7).
    async_read_mutex: Mutex<()>,
}

impl Backend {
    /// Builds a `Backend` around an already-constructed native client seam
    /// and the parsed parameter/mapfile surface. Registers the instance in
    /// the process-wide handle registry so native state callbacks can find
    /// it; deregistered on `Drop`.
    pub fn new(
        client: Box<dyn OpcUaClientOps>,
        params: BackendParameters,
        map_entries: Option<Vec<MapEntry>>,
    ) -> Arc<Self> {
        let root = params.root_node.clone();
        let connection = Arc::new(Connection::new(client, &params));
        let handle = next_handle();
        let backend = Arc::new(Backend {
            handle,
            connection,
            catalogue: Mutex::new(Catalogue::empty()),
            subscription_manager: Mutex::new(None),
            map_entries,
            root,
            opened: AtomicBool::new(false),
            is_functional: AtomicBool::new(false),
            async_read_mutex: Mutex::new(()),
        });
        registry().lock().expect("backend registry poisoned").insert(handle, Arc::downgrade(&backend));
        backend
    }

    /// Opaque handle a caller wiring up native callbacks should thread
    /// through as the callback context (spec.md §4.4).
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn is_functional(&self) -> bool {
        self.is_functional.load(Ordering::SeqCst)
    }

    pub fn catalogue_snapshot(&self) -> Catalogue {
        self.catalogue.lock().expect("catalogue mutex poisoned").clone()
    }

    fn ensure_subscription_manager(&self) -> Arc<SubscriptionManager> {
        let mut guard = self.subscription_manager.lock().expect("subscription manager mutex poisoned");
        if let Some(mgr) = guard.as_ref() {
            return Arc::clone(mgr);
        }
        let mgr = Arc::new(SubscriptionManager::new(Arc::clone(&self.connection)));
        *guard = Some(Arc::clone(&mgr));
        mgr
    }

    /// `open()`: (re)connects if not already functional and connected, fills
    /// the catalogue once, then polls `isConnected` for up to 100ms in 20ms
    /// steps before giving up (spec.md §4.7).
    pub fn open(&self) -> BackendResult<()> {
        if !self.is_functional.load(Ordering::SeqCst) || !self.connection.is_connected() {
            if let Some(mgr) = self.subscription_manager.lock().expect("subscription manager mutex poisoned").as_ref() {
                mgr.stop_client_thread();
            }
            self.do_connect()?;
        }

        if self.catalogue.lock().expect("catalogue mutex poisoned").is_empty() {
            self.fill_catalogue()?;
        }

        self.opened.store(true, Ordering::SeqCst);

        for _ in 0..5 {
            if self.connection.is_connected() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        if !self.connection.is_connected() {
            return Err(BackendError::runtime("timed out waiting for the OPC UA session to become active"));
        }
        Ok(())
    }

    /// `connect()`: resets the client, reconnects, then re-arms the
    /// subscription if one already exists (spec.md §4.7).
    fn do_connect(&self) -> BackendResult<()> {
        self.reset_client();
        self.connection.connect()?;
        self.is_functional.store(true, Ordering::SeqCst);
        let mgr = self.subscription_manager.lock().expect("subscription manager mutex poisoned").clone();
        if let Some(mgr) = mgr {
            mgr.prepare()?;
        }
        Ok(())
    }

    /// `resetClient()`: deactivates the subscription manager, resets all
    /// monitored items to unmonitored, and closes the connection.
    fn reset_client(&self) {
        if let Some(mgr) = self.subscription_manager.lock().expect("subscription manager mutex poisoned").as_ref() {
            mgr.deactivate();
            mgr.reset_monitored_items();
        }
        self.connection.close();
    }

    /// `close()`: marks the backend closed and non-functional, resets the
    /// client, then closes the connection.
    pub fn close(&self) {
        self.opened.store(false, Ordering::SeqCst);
        self.is_functional.store(false, Ordering::SeqCst);
        self.reset_client();
        self.connection.close();
        info!(server = %self.connection.server_address, "backend closed");
    }

    /// `activateAsyncRead()`: guarded by `async_read_mutex` (L4). Lazily
    /// creates the subscription manager, activates it, and ensures the
    /// publish-loop thread is running, sleeping 2x the publishing interval
    /// to let initial values arrive (spec.md §4.7).
    pub fn activate_async_read(&self) -> BackendResult<()> {
        let _guard = self.async_read_mutex.lock().expect("async read mutex poisoned");
        if !self.opened.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mgr = self.ensure_subscription_manager();
        mgr.activate()?;
        if !mgr.is_thread_running() {
            mgr.start();
            std::thread::sleep(Duration::from_millis(u64::from(self.connection.publishing_interval_ms) * 2));
        }
        Ok(())
    }

    /// `setExceptionImpl()`: pushes an exception through every subscribed
    /// accessor and deactivates the subscription. Note: the subscription
    /// manager's own lock discipline (items-mutex before `client_mutex`,
    /// and never synchronously re-entering `client_mutex` from inside a
    /// held `client_mutex` critical section) means this must *not* wrap the
    /// call in `connection.client_mutex` the way spec.md §4.7 literally
    /// reads - `deactivate()` itself takes `client_mutex` when no
    /// publish-loop thread is running, and `std::sync::Mutex` is not
    /// reentrant. See DESIGN.md for this deliberate divergence.
    pub fn set_exception(&self, message: &str) {
        if let Some(mgr) = self.subscription_manager.lock().expect("subscription manager mutex poisoned").clone() {
            mgr.deactivate_all_and_push_exception(message);
        }
    }

    fn on_state_change(&self, channel_open: bool, session_activated: bool) {
        if channel_open && session_activated {
            self.is_functional.store(true, Ordering::SeqCst);
            return;
        }
        self.is_functional.store(false, Ordering::SeqCst);
        if self.opened.load(Ordering::SeqCst) {
            self.set_exception("Client session is not open any more");
        }
    }

    fn on_subscription_inactive(&self) {
        self.on_state_change(false, false);
        self.connection.close();
    }

    /// Resolves the root node and, for a named root, the string used to
    /// strip the common path prefix off browsed registers. A numeric root
    /// has no browse name available through the metadata seam used here, so
    /// no path stripping is applied for it - a pragmatic simplification,
    /// recorded in DESIGN.md.
    fn resolve_root(&self) -> Option<(NodeId, Option<String>)> {
        match self.root.as_ref()? {
            RootNode::Numeric { namespace, id } => Some((NodeId::Numeric { namespace: *namespace, id: *id }, None)),
            RootNode::Named { namespace, name } => {
                Some((NodeId::String { namespace: *namespace, id: name.clone() }, Some(name.clone())))
            }
        }
    }

    /// `fillCatalogue()`: server browse (rooted or not) or mapfile entries,
    /// whichever the construction parameters selected (spec.md §4.3).
    fn fill_catalogue(&self) -> BackendResult<()> {
        let client = self.connection.client();
        let built = if let Some(entries) = &self.map_entries {
            Catalogue::from_mapfile_entries(client, entries)
        } else if let Some((root_node, root_name)) = self.resolve_root() {
            catalogue::Catalogue::from_server_browse_rooted(client, &root_node, root_name.as_deref().unwrap_or(""))?
        } else {
            Catalogue::from_server_browse(client)?
        };
        info!(registers = built.len(), "catalogue filled");
        *self.catalogue.lock().expect("catalogue mutex poisoned") = built;
        Ok(())
    }

    /// `getRegisterAccessor<UserType>()`: looks up `path`, validates the
    /// requested element count/offset against the register's array length,
    /// and constructs the correctly-parameterized `Accessor<UserType>`.
    /// `number_of_words == 0` means "all elements"; `number_of_words == 0 &&
    /// offset_in_register > 0` is rejected (spec.md §4.7).
    pub fn get_register_accessor<T: AccessorValue>(
        &self,
        path: &str,
        number_of_words: usize,
        offset_in_register: usize,
    ) -> BackendResult<Arc<Accessor<T>>> {
        let register_info = {
            let catalogue = self.catalogue.lock().expect("catalogue mutex poisoned");
            catalogue
                .lookup(path)
                .cloned()
                .ok_or_else(|| BackendError::logic(format!("unknown register '{path}'")))?
        };

        if number_of_words == 0 && offset_in_register > 0 {
            return Err(BackendError::logic(format!(
                "register '{path}': offset {offset_in_register} given with numberOfWords=0 is not allowed"
            )));
        }
        let resolved_words = if number_of_words == 0 { register_info.array_length } else { number_of_words };
        if resolved_words + offset_in_register > register_info.array_length {
            return Err(BackendError::logic(format!(
                "register '{path}': requested {resolved_words} element(s) at offset {offset_in_register} exceeds its length {}",
                register_info.array_length
            )));
        }

        let subscription_manager =
            if register_info.access_modes.wait_for_new_data { Some(self.ensure_subscription_manager()) } else { None };

        Accessor::new(
            path.to_string(),
            Arc::new(register_info),
            Arc::clone(&self.connection),
            subscription_manager,
            resolved_words,
            offset_in_register,
        )
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        registry().lock().expect("backend registry poisoned").remove(&self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::fake::FakeClient;
    use crate::types::{AccessModeFlags, DataDescriptor, RegisterInfo, TypeCode};
    use std::collections::HashMap as Map;

    fn params() -> BackendParameters {
        let mut map = Map::new();
        map.insert("port".to_string(), "4840".to_string());
        BackendParameters::from_map("localhost", &map).unwrap()
    }

    fn register(node: NodeId, read_only: bool, array_length: usize) -> RegisterInfo {
        let mut access_modes = AccessModeFlags::default();
        access_modes.wait_for_new_data = true;
        RegisterInfo {
            path: "scalar/int32".to_string(),
            node_id: node,
            browse_name: "scalar/int32".to_string(),
            type_code: TypeCode::I32,
            array_length,
            read_only,
            index_range: None,
            description: String::new(),
            access_modes,
            data_descriptor: DataDescriptor::for_type_code(TypeCode::I32),
        }
    }

    #[test]
    fn open_connects_and_marks_functional() {
        let fake = Arc::new(FakeClient::new());
        let backend = Backend::new(Box::new(Arc::clone(&fake)), params(), Some(Vec::new()));
        backend.open().unwrap();
        assert!(backend.is_functional());
        assert!(backend.is_opened());
    }

    #[test]
    fn open_fails_when_connect_fails() {
        let fake = Arc::new(FakeClient::new());
        fake.set_fail_connect(true);
        let backend = Backend::new(Box::new(Arc::clone(&fake)), params(), Some(Vec::new()));
        let err = backend.open().unwrap_err();
        assert!(err.is_runtime());
    }

    #[test]
    fn get_register_accessor_rejects_unknown_path() {
        let fake = Arc::new(FakeClient::new());
        let backend = Backend::new(Box::new(Arc::clone(&fake)), params(), Some(Vec::new()));
        backend.open().unwrap();
        let err = backend.get_register_accessor::<i32>("missing/path", 1, 0).unwrap_err();
        assert!(err.is_logic());
    }

    #[test]
    fn get_register_accessor_rejects_offset_without_explicit_length() {
        let fake = Arc::new(FakeClient::new());
        let node = NodeId::Numeric { namespace: 2, id: 1 };
        let backend = Backend::new(
            Box::new(Arc::clone(&fake)),
            params(),
            None,
        );
        backend.open().unwrap();
        *backend.catalogue.lock().unwrap() = Catalogue::from_registers(vec![register(node, false, 4)]);
        let err = backend.get_register_accessor::<i32>("scalar/int32", 0, 1).unwrap_err();
        assert!(err.is_logic());
    }

    #[test]
    fn get_register_accessor_rejects_out_of_range_request() {
        let fake = Arc::new(FakeClient::new());
        let node = NodeId::Numeric { namespace: 2, id: 1 };
        let backend = Backend::new(Box::new(Arc::clone(&fake)), params(), None);
        backend.open().unwrap();
        *backend.catalogue.lock().unwrap() = Catalogue::from_registers(vec![register(node, false, 4)]);
        let err = backend.get_register_accessor::<i32>("scalar/int32", 3, 2).unwrap_err();
        assert!(err.is_logic());
    }

    #[test]
    fn zero_words_means_full_register() {
        let fake = Arc::new(FakeClient::new());
        let node = NodeId::Numeric { namespace: 2, id: 1 };
        fake.set_value(
            &node,
            crate::types::DataValue {
                variant: crate::codec::build_array_variant(
                    vec![opcua::types::Variant::Int32(1), opcua::types::Variant::Int32(2)],
                    TypeCode::I32,
                )
                .unwrap(),
                source_timestamp: 1,
                status: opcua::types::StatusCode::Good,
                has_value: true,
            },
        );
        let backend = Backend::new(Box::new(Arc::clone(&fake)), params(), None);
        backend.open().unwrap();
        *backend.catalogue.lock().unwrap() = Catalogue::from_registers(vec![register(node, false, 2)]);
        let accessor = backend.get_register_accessor::<i32>("scalar/int32", 0, 0).unwrap();
        accessor.read().ok();
        assert_eq!(accessor.buffer(), vec![1, 2]);
    }

    #[test]
    fn set_exception_pushes_through_subscribed_accessor() {
        let fake = Arc::new(FakeClient::new());
        let node = NodeId::Numeric { namespace: 2, id: 1 };
        let backend = Backend::new(Box::new(Arc::clone(&fake)), params(), None);
        backend.open().unwrap();
        *backend.catalogue.lock().unwrap() = Catalogue::from_registers(vec![register(node, false, 1)]);
        backend.activate_async_read().unwrap();
        let accessor = backend.get_register_accessor::<i32>("scalar/int32", 1, 0).unwrap();
        assert!(accessor.is_subscribed());
        backend.set_exception("server outage");
        let err = accessor.read().unwrap_err();
        assert!(err.is_runtime());
    }

    #[test]
    fn on_state_change_to_inactive_pushes_exception_when_opened() {
        let fake = Arc::new(FakeClient::new());
        let node = NodeId::Numeric { namespace: 2, id: 1 };
        let backend = Backend::new(Box::new(Arc::clone(&fake)), params(), None);
        backend.open().unwrap();
        *backend.catalogue.lock().unwrap() = Catalogue::from_registers(vec![register(node, false, 1)]);
        backend.activate_async_read().unwrap();
        let accessor = backend.get_register_accessor::<i32>("scalar/int32", 1, 0).unwrap();
        dispatch_state_change(backend.handle(), false, false);
        assert!(!backend.is_functional());
        let err = accessor.read().unwrap_err();
        assert!(err.is_runtime());
    }
}
