//! Owns the native client handle and serializes all access to it.
//!
//! Grounded in `original_source/include/OPC-UA-Connection.h`. `client_lock`
//! becomes `client_mutex` (lock order L1: the innermost lock, held only
//! around a single native call, never held while waiting on another lock).

use std::sync::Mutex;

use tracing::{error, info};

use crate::config::BackendParameters;
use crate::error::{BackendError, BackendResult};
use crate::native::{ChannelState, OpcUaClientOps, SessionState};

/// Owns the native client and the mutex serializing access to it (lock
/// order L1). `client_mutex` guards nothing but itself — callers take it
/// only around the native call they are about to make, per spec.md §5.
pub struct Connection {
    client: Box<dyn OpcUaClientOps>,
    pub server_address: String,
    pub publishing_interval_ms: u32,
    pub connection_timeout_ms: u32,
    /// L1. Only ever held around a single native call.
    pub client_mutex: Mutex<()>,
}

impl Connection {
    pub fn new(client: Box<dyn OpcUaClientOps>, params: &BackendParameters) -> Self {
        Connection {
            client,
            server_address: params.server_address.clone(),
            publishing_interval_ms: params.publishing_interval_ms,
            connection_timeout_ms: params.connection_timeout_ms,
            client_mutex: Mutex::new(()),
        }
    }

    pub fn client(&self) -> &dyn OpcUaClientOps {
        self.client.as_ref()
    }

    /// Connects the native client. Mirrors `OPCUAConnection`'s constructor
    /// plus `OpcUABackend::connect()` folded together (this crate builds the
    /// native client once at construction and only reconnects it here).
    pub fn connect(&self) -> BackendResult<()> {
        let _guard = self.client_mutex.lock().expect("client mutex poisoned");
        self.client.connect().map_err(|e| {
            error!(server = %self.server_address, error = %e, "failed to connect to OPC UA server");
            BackendError::runtime(format!("failed to connect to {}: {e}", self.server_address))
        })?;
        info!(server = %self.server_address, "connected to OPC UA server");
        Ok(())
    }

    /// Disconnects and logs failures instead of propagating them, matching
    /// `OPCUAConnection::close()`.
    pub fn close(&self) {
        let _guard = self.client_mutex.lock().expect("client mutex poisoned");
        self.client.disconnect();
        info!(server = %self.server_address, "closed connection to OPC UA server");
    }

    /// `OPCUAConnection::isConnected()`: both the secure channel and the
    /// session must be in their active states.
    pub fn is_connected(&self) -> bool {
        self.client.channel_state() == ChannelState::Open
            && self.client.session_state() == SessionState::Activated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::fake::FakeClient;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn params() -> BackendParameters {
        let mut map = HashMap::new();
        map.insert("port".to_string(), "4840".to_string());
        BackendParameters::from_map("localhost", &map).unwrap()
    }

    #[test]
    fn not_connected_before_connect() {
        let fake = Arc::new(FakeClient::new());
        let conn = Connection::new(Box::new(Arc::clone(&fake)), &params());
        assert!(!conn.is_connected());
    }

    #[test]
    fn connect_failure_surfaces_as_runtime_error() {
        let fake = Arc::new(FakeClient::new());
        fake.set_fail_connect(true);
        let conn = Connection::new(Box::new(Arc::clone(&fake)), &params());
        let err = conn.connect().unwrap_err();
        assert!(err.is_runtime());
    }

    #[test]
    fn connect_then_is_connected() {
        let fake = Arc::new(FakeClient::new());
        let conn = Connection::new(Box::new(Arc::clone(&fake)), &params());
        conn.connect().unwrap();
        assert!(conn.is_connected());
    }

    #[test]
    fn close_resets_connected_state() {
        let fake = Arc::new(FakeClient::new());
        let conn = Connection::new(Box::new(Arc::clone(&fake)), &params());
        conn.connect().unwrap();
        conn.close();
        assert!(!conn.is_connected());
    }
}
