//! Subscription lifecycle and the publish-loop thread.
//!
//! Grounded in `original_source/src/SubscriptionManager.cc`. The native
//! callback-based `responseHandler` is replaced with an explicit drain:
//! the publish-loop thread calls `run_iterate` and then asks the native
//! client for notifications queued since the last iteration, dispatching
//! them to the accessors registered for each monitored item. This keeps the
//! same effect — data change -> fan out to every accessor subscribed to the
//! node — without depending on a C callback ABI.
//!
//! Lock order: `state` (L2, items + subscription map) is always acquired
//! before `connection.client_mutex` (L1), never the reverse. The one
//! exception mirrors the original exactly: `deactivate()` must never take
//! `client_mutex` while the publish-loop thread might be blocked holding it
//! inside `run_iterate` on the same thread that would call back into
//! `deactivate` — so a deferred-removal flag is set instead, and the
//! publish-loop thread itself performs the removal once it has dropped out
//! of its own iterate loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::error::{BackendError, BackendResult};
use crate::types::{DataValue, NodeId};

/// Receives data updates and exceptions for one monitored node. Implemented
/// by `Accessor` (`src/accessor.rs`); kept as a trait here so the
/// subscription manager does not need to know about the generic accessor
/// type.
pub trait NotificationSink: Send + Sync {
    fn push_value(&self, value: DataValue);
    fn push_exception(&self, err: BackendError);
    fn index_range(&self) -> Option<String> {
        None
    }
}

/// Opaque handle identifying one accessor's registration with a
/// `MonitorItem`. Used instead of comparing `Arc` pointer identity so an
/// accessor can unsubscribe itself from its own `Drop` impl, where it no
/// longer has an `Arc` to itself to compare against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessorId(u64);

fn next_accessor_id() -> AccessorId {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    AccessorId(COUNTER.fetch_add(1, Ordering::Relaxed))
}

struct MonitorItem {
    browse_name: String,
    node_id: NodeId,
    monitored_item_id: u32,
    is_monitored: bool,
    active: bool,
    has_exception: bool,
    accessors: Vec<(AccessorId, Arc<dyn NotificationSink>)>,
    /// Most recent value delivered for this node, used to give a newly
    /// joining accessor an initial value instead of waiting for the next
    /// publish cycle.
    last_value: Option<DataValue>,
}

impl MonitorItem {
    fn new(browse_name: String, node_id: NodeId, accessor_id: AccessorId, accessor: Arc<dyn NotificationSink>) -> Self {
        MonitorItem {
            browse_name,
            node_id,
            monitored_item_id: 0,
            is_monitored: false,
            active: false,
            has_exception: false,
            accessors: vec![(accessor_id, accessor)],
            last_value: None,
        }
    }
}

#[derive(Default)]
struct State {
    items: Vec<MonitorItem>,
    /// monitored_item_id -> index into `items`.
    subscription_map: HashMap<u32, usize>,
}

impl State {
    fn find_by_browse_name(&self, browse_name: &str) -> Option<usize> {
        self.items.iter().position(|i| i.browse_name == browse_name)
    }
}

pub struct SubscriptionManager {
    connection: Arc<Connection>,
    /// L2. Always acquired before `connection.client_mutex` (L1).
    state: Mutex<State>,
    subscription_id: AtomicU32,
    subscription_active: AtomicBool,
    async_read_active: AtomicBool,
    run: AtomicBool,
    subscription_needs_to_be_removed: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionManager {
    pub fn new(connection: Arc<Connection>) -> Self {
        SubscriptionManager {
            connection,
            state: Mutex::new(State::default()),
            subscription_id: AtomicU32::new(0),
            subscription_active: AtomicBool::new(false),
            async_read_active: AtomicBool::new(false),
            run: AtomicBool::new(false),
            subscription_needs_to_be_removed: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.subscription_active.load(Ordering::SeqCst)
    }

    pub fn is_async_read_active(&self) -> bool {
        self.async_read_active.load(Ordering::SeqCst)
    }

    /// `createSubscription()`: cleans up a leftover subscription, then
    /// creates a fresh one, adopting the server-revised publishing interval.
    fn create_subscription(&self) -> BackendResult<()> {
        if self.subscription_id.load(Ordering::SeqCst) != 0 {
            let _guard = self.connection.client_mutex.lock().expect("client mutex poisoned");
            self.remove_subscription();
        }
        let requested_ms = self.connection.publishing_interval_ms as f64;
        let (id, revised_ms) = {
            let _guard = self.connection.client_mutex.lock().expect("client mutex poisoned");
            self.connection.client().create_subscription(requested_ms)?
        };
        self.subscription_id.store(id, Ordering::SeqCst);
        debug!(subscription_id = id, "create subscription succeeded");
        if (revised_ms - requested_ms).abs() > f64::EPSILON {
            warn!(requested_ms, revised_ms, "publishing interval was revised by the server");
        }
        self.subscription_active.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// `removeSubscription()`. Caller must already hold `client_mutex`.
    fn remove_subscription(&self) {
        let id = self.subscription_id.swap(0, Ordering::SeqCst);
        if id != 0 {
            if let Err(e) = self.connection.client().delete_subscription(id) {
                warn!(subscription_id = id, error = %e, "failed to remove subscription");
            } else {
                debug!(subscription_id = id, "removed subscription");
            }
        }
        self.reset_monitored_items();
    }

    /// Marks every `MonitorItem` as unmonitored and clears the id map,
    /// without touching the native subscription itself. Called by
    /// `remove_subscription` and directly by `Backend::reset_client`
    /// (spec.md §4.7: "resets all monitored items to unmonitored").
    pub(crate) fn reset_monitored_items(&self) {
        let mut state = self.state.lock().expect("subscription state poisoned");
        for item in &mut state.items {
            item.is_monitored = false;
        }
        state.subscription_map.clear();
    }

    /// `addMonitoredItems()`: releases the items lock before each native
    /// call, since it may re-enter a state callback that calls back into
    /// this manager.
    fn add_monitored_items(&self) {
        let async_active = self.async_read_active.load(Ordering::SeqCst);
        let pending: Vec<(usize, NodeId)> = {
            let mut state = self.state.lock().expect("subscription state poisoned");
            if async_active {
                for item in &mut state.items {
                    item.active = true;
                }
            }
            state
                .items
                .iter()
                .enumerate()
                .filter(|(_, item)| !item.is_monitored)
                .map(|(idx, item)| (idx, item.node_id.clone()))
                .collect()
        };

        for (idx, node_id) in pending {
            let subscription_id = self.subscription_id.load(Ordering::SeqCst);
            let result = {
                let _guard = self.connection.client_mutex.lock().expect("client mutex poisoned");
                self.connection.client().create_monitored_item(subscription_id, &node_id)
            };
            let mut state = self.state.lock().expect("subscription state poisoned");
            match result {
                Ok(monitored_item_id) => {
                    state.items[idx].monitored_item_id = monitored_item_id;
                    state.items[idx].is_monitored = true;
                    state.subscription_map.insert(monitored_item_id, idx);
                    debug!(
                        monitored_item_id,
                        browse_name = %state.items[idx].browse_name,
                        "monitoring node"
                    );
                }
                Err(e) => {
                    let browse_name = state.items[idx].browse_name.clone();
                    drop(state);
                    self.handle_exception_for_failed_item(&format!(
                        "failed to add monitored item for node {browse_name}: {e}"
                    ));
                }
            }
        }
    }

    fn handle_exception_for_failed_item(&self, message: &str) {
        error!(%message, "failed to add monitored item");
        self.handle_exception(message);
    }

    /// `prepare()`.
    pub fn prepare(&self) -> BackendResult<()> {
        self.create_subscription()?;
        self.add_monitored_items();
        Ok(())
    }

    /// `activate()`.
    pub fn activate(&self) -> BackendResult<()> {
        if !self.subscription_active.load(Ordering::SeqCst) {
            self.create_subscription()?;
        }
        self.async_read_active.store(true, Ordering::SeqCst);

        let should_add = {
            let state = self.state.lock().expect("subscription state poisoned");
            !state.items.is_empty() && state.subscription_map.is_empty()
        };
        if should_add {
            self.add_monitored_items();
        } else {
            let mut state = self.state.lock().expect("subscription state poisoned");
            for item in &mut state.items {
                item.active = true;
            }
        }
        Ok(())
    }

    /// `deactivate()`. Never takes `client_mutex` directly if the publish
    /// thread might be running — defers removal to `run_client` instead.
    pub fn deactivate(&self) {
        {
            let mut state = self.state.lock().expect("subscription state poisoned");
            for item in &mut state.items {
                item.active = false;
            }
        }
        self.run.store(false, Ordering::SeqCst);

        if self.subscription_active.swap(false, Ordering::SeqCst) {
            let thread_running = self.thread.lock().expect("thread handle poisoned").is_some();
            if thread_running {
                self.subscription_needs_to_be_removed.store(true, Ordering::SeqCst);
            } else {
                let _guard = self.connection.client_mutex.lock().expect("client mutex poisoned");
                self.remove_subscription();
            }
        }
        self.async_read_active.store(false, Ordering::SeqCst);
    }

    pub fn deactivate_all_and_push_exception(&self, message: &str) {
        self.handle_exception(message);
        self.deactivate();
    }

    fn handle_exception(&self, message: &str) {
        info!(%message, "handling exception");
        let mut state = self.state.lock().expect("subscription state poisoned");
        for item in &mut state.items {
            if item.active && !item.has_exception {
                item.has_exception = true;
                info!(
                    accessor_count = item.accessors.len(),
                    browse_name = %item.browse_name,
                    "pushing exception to accessors"
                );
                for (_, accessor) in &item.accessors {
                    accessor.push_exception(BackendError::runtime(message.to_string()));
                }
            }
        }
    }

    pub fn set_external_error(&self, browse_name: &str) {
        let mut state = self.state.lock().expect("subscription state poisoned");
        if let Some(idx) = state.find_by_browse_name(browse_name) {
            state.items[idx].has_exception = true;
        }
    }

    pub fn is_thread_running(&self) -> bool {
        self.thread.lock().expect("thread handle poisoned").is_some()
    }

    /// Starts the publish-loop thread only if one is not already running.
    /// Used both by `Backend::activate_async_read` and by a new accessor's
    /// construction (spec.md §4.6: "if asyncRead is already active, ensure
    /// the publish-loop thread is running").
    pub fn ensure_running(self: &Arc<Self>) {
        if !self.is_thread_running() {
            self.start();
        }
    }

    /// `start()`: spawns the publish-loop thread only if a subscription is
    /// active.
    pub fn start(self: &Arc<Self>) {
        if !self.subscription_active.load(Ordering::SeqCst) {
            self.run.store(false, Ordering::SeqCst);
            info!("no active subscriptions, not starting the publish-loop thread");
            return;
        }
        self.run.store(true, Ordering::SeqCst);
        let publishing_interval_ms = self.connection.publishing_interval_ms;
        info!(publishing_interval_ms, "starting subscription thread");
        let manager = Arc::clone(self);
        let handle = std::thread::spawn(move || manager.run_client());
        *self.thread.lock().expect("thread handle poisoned") = Some(handle);
    }

    /// `runClient()`: the publish-loop thread body.
    fn run_client(&self) {
        debug!("starting client iterate loop");
        let mut iterations: u64 = 0;
        while self.run.load(Ordering::SeqCst) {
            let iterate_result = {
                let _guard = self.connection.client_mutex.lock().expect("client mutex poisoned");
                let result = self.connection.client().run_iterate(0);
                if self.subscription_needs_to_be_removed.load(Ordering::SeqCst) {
                    break;
                }
                result
            };
            if let Err(e) = iterate_result {
                info!(error = %e, "stopped sending publish requests");
                break;
            }
            self.dispatch_notifications();
            std::thread::sleep(Duration::from_millis(
                (self.connection.publishing_interval_ms / 2).max(1) as u64,
            ));
            iterations += 1;
            if iterations % 50 == 0 {
                debug!("still running client iterate loop");
            }
        }
        {
            let _guard = self.connection.client_mutex.lock().expect("client mutex poisoned");
            if self.subscription_needs_to_be_removed.swap(false, Ordering::SeqCst) {
                self.remove_subscription();
            }
        }
        info!("stopped client iterate loop");
        self.run.store(false, Ordering::SeqCst);
    }

    /// Pulls queued data-change notifications off the native client and
    /// fans each one out to every accessor registered for its monitored
    /// item (`responseHandler`'s role).
    fn dispatch_notifications(&self) {
        let notifications = self.connection.client().drain_notifications();
        if notifications.is_empty() {
            return;
        }
        let mut state = self.state.lock().expect("subscription state poisoned");
        for notification in notifications {
            let Some(&idx) = state.subscription_map.get(&notification.monitored_item_id) else {
                // Item was already removed by `unsubscribe`; the native client may
                // still deliver one in-flight notification for it.
                error!(
                    monitored_item_id = notification.monitored_item_id,
                    "notification for unknown monitored item"
                );
                continue;
            };
            let item = &mut state.items[idx];
            item.last_value = Some(notification.value.deep_clone());
            if !item.active {
                continue;
            }
            item.has_exception = false;
            for (_, accessor) in &item.accessors {
                accessor.push_value(notification.value.deep_clone());
            }
        }
    }

    /// `subscribe()`: find-or-append a monitor item. When joining an
    /// already-active item, copies its most recent value into the newcomer.
    /// Returns the `AccessorId` the caller must pass to `unsubscribe`.
    pub fn subscribe(
        &self,
        browse_name: &str,
        node_id: NodeId,
        accessor: Arc<dyn NotificationSink>,
    ) -> BackendResult<AccessorId> {
        let accessor_id = next_accessor_id();
        let (is_new, initial_value) = {
            let mut state = self.state.lock().expect("subscription state poisoned");
            match state.find_by_browse_name(browse_name) {
                None => {
                    state.items.push(MonitorItem::new(
                        browse_name.to_string(),
                        node_id,
                        accessor_id,
                        Arc::clone(&accessor),
                    ));
                    (true, None)
                }
                Some(idx) => {
                    let item = &mut state.items[idx];
                    item.accessors.push((accessor_id, Arc::clone(&accessor)));
                    let initial = if item.active {
                        item.last_value.clone()
                    } else {
                        None
                    };
                    (false, initial)
                }
            }
        };

        if is_new {
            if self.async_read_active.load(Ordering::SeqCst) {
                if !self.subscription_active.load(Ordering::SeqCst) {
                    warn!("no active subscription, setting up a new one");
                    self.create_subscription()?;
                }
                self.add_monitored_items();
            }
        } else if let Some(value) = initial_value {
            debug!(browse_name, "setting initial value for newly joined accessor");
            accessor.push_value(value);
        }
        Ok(accessor_id)
    }

    /// `unsubscribe()`: remove only the accessor if others remain on the
    /// item, otherwise remove the whole monitor item and, if that was the
    /// last one, stop the subscription and the publish-loop thread.
    pub fn unsubscribe(&self, browse_name: &str, accessor_id: AccessorId) {
        let removed_monitored_item_id = {
            let mut state = self.state.lock().expect("subscription state poisoned");
            let Some(idx) = state.find_by_browse_name(browse_name) else {
                return;
            };
            if state.items[idx].accessors.len() > 1 {
                state.items[idx].accessors.retain(|(id, _)| *id != accessor_id);
                None
            } else {
                let item = state.items.remove(idx);
                // Removing shifts indices; rebuild the map rather than track deltas.
                state.subscription_map = state
                    .items
                    .iter()
                    .enumerate()
                    .map(|(i, it)| (it.monitored_item_id, i))
                    .collect();
                Some(item.monitored_item_id)
            }
        };

        let Some(id) = removed_monitored_item_id else {
            return;
        };
        if id != 0 && self.connection.is_connected() {
            let subscription_id = self.subscription_id.load(Ordering::SeqCst);
            let result = {
                let _guard = self.connection.client_mutex.lock().expect("client mutex poisoned");
                self.connection.client().delete_monitored_item(subscription_id, id)
            };
            match result {
                Ok(()) => debug!(browse_name, "monitored item removed"),
                Err(e) => error!(browse_name, error = %e, "failed to unsubscribe item"),
            }

            let items_empty = self.state.lock().expect("subscription state poisoned").items.is_empty();
            if items_empty {
                {
                    let _guard = self.connection.client_mutex.lock().expect("client mutex poisoned");
                    self.remove_subscription();
                }
                self.run.store(false, Ordering::SeqCst);
                self.stop_client_thread();
            }
        }
    }

    pub fn stop_client_thread(&self) {
        let handle = self.thread.lock().expect("thread handle poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.deactivate();
        self.stop_client_thread();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendParameters;
    use crate::native::fake::FakeClient;
    use crate::native::OpcUaClientOps as _;
    use std::collections::HashMap as Map;
    use std::sync::Mutex as StdMutex;

    struct TestSink {
        values: StdMutex<Vec<DataValue>>,
        exceptions: StdMutex<Vec<BackendError>>,
    }

    impl TestSink {
        fn new() -> Arc<Self> {
            Arc::new(TestSink {
                values: StdMutex::new(Vec::new()),
                exceptions: StdMutex::new(Vec::new()),
            })
        }
    }

    impl NotificationSink for TestSink {
        fn push_value(&self, value: DataValue) {
            self.values.lock().unwrap().push(value);
        }
        fn push_exception(&self, err: BackendError) {
            self.exceptions.lock().unwrap().push(err);
        }
    }

    fn connection() -> Arc<Connection> {
        let mut map = Map::new();
        map.insert("port".to_string(), "4840".to_string());
        let params = BackendParameters::from_map("localhost", &map).unwrap();
        let fake = Arc::new(FakeClient::new());
        fake.connect().unwrap();
        Arc::new(Connection::new(Box::new(fake), &params))
    }

    #[test]
    fn subscribe_then_activate_creates_monitored_item() {
        let conn = connection();
        let manager = SubscriptionManager::new(Arc::clone(&conn));
        let sink = TestSink::new();
        let node = NodeId::Numeric { namespace: 2, id: 1 };
        manager.subscribe("n1", node, sink).unwrap();
        manager.activate().unwrap();
        assert!(manager.is_active());
    }

    #[test]
    fn second_accessor_joins_existing_item() {
        let conn = connection();
        let manager = SubscriptionManager::new(Arc::clone(&conn));
        let node = NodeId::Numeric { namespace: 2, id: 1 };
        manager.subscribe("n1", node.clone(), TestSink::new()).unwrap();
        manager.subscribe("n1", node, TestSink::new()).unwrap();
        let state = manager.state.lock().unwrap();
        assert_eq!(state.items.len(), 1);
        assert_eq!(state.items[0].accessors.len(), 2);
    }

    #[test]
    fn unsubscribe_last_accessor_removes_item() {
        let conn = connection();
        let manager = SubscriptionManager::new(Arc::clone(&conn));
        let node = NodeId::Numeric { namespace: 2, id: 1 };
        let sink = TestSink::new();
        let id = manager.subscribe("n1", node, sink).unwrap();
        manager.activate().unwrap();
        manager.unsubscribe("n1", id);
        let state = manager.state.lock().unwrap();
        assert!(state.items.is_empty());
    }

    #[test]
    fn deactivate_marks_items_inactive() {
        let conn = connection();
        let manager = SubscriptionManager::new(Arc::clone(&conn));
        let node = NodeId::Numeric { namespace: 2, id: 1 };
        manager.subscribe("n1", node, TestSink::new()).unwrap();
        manager.activate().unwrap();
        manager.deactivate();
        let state = manager.state.lock().unwrap();
        assert!(!state.items[0].active);
        assert!(!manager.is_active());
    }

    #[test]
    fn handle_exception_pushes_to_active_accessors_once() {
        let conn = connection();
        let manager = SubscriptionManager::new(Arc::clone(&conn));
        let node = NodeId::Numeric { namespace: 2, id: 1 };
        let sink = TestSink::new();
        manager.subscribe("n1", node, Arc::clone(&sink) as Arc<dyn NotificationSink>).unwrap();
        manager.activate().unwrap();
        manager.handle_exception("boom");
        manager.handle_exception("boom again");
        assert_eq!(sink.exceptions.lock().unwrap().len(), 1);
    }
}
