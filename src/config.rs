//! Backend parameters: the address/parameter surface of spec.md §6, parsed
//! from a `HashMap<String, String>` rather than `std::env` — the caller (an
//! out-of-scope CLI/config layer) is responsible for getting key/value pairs
//! into that map; this module only validates and defaults them.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};

/// Root node selector: either a numeric node id or a browse name, always
/// paired with the namespace index it lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootNode {
    Numeric { namespace: u16, id: u32 },
    Named { namespace: u16, name: String },
}

impl RootNode {
    /// Parses the `ns:nodeid` / `ns:nodename` format used by both the
    /// `rootNode` parameter and mapfile entries.
    fn parse(raw: &str) -> Result<Self> {
        let (ns, rest) = raw
            .split_once(':')
            .ok_or_else(|| anyhow!("rootNode '{raw}' must be of the form 'ns:nodeid'"))?;
        let namespace: u16 = ns
            .parse()
            .with_context(|| format!("rootNode '{raw}' has a non-numeric namespace"))?;
        match rest.parse::<u32>() {
            Ok(id) => Ok(RootNode::Numeric { namespace, id }),
            Err(_) => Ok(RootNode::Named {
                namespace,
                name: rest.to_string(),
            }),
        }
    }
}

/// Construction parameters for a [`crate::backend::Backend`], mirroring the
/// address/parameter surface spec.md §6 describes and the
/// `createInstance` factory in `original_source/src/OPC-UA-Backend.cc`.
#[derive(Debug, Clone)]
pub struct BackendParameters {
    pub server_address: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub certificate: Option<String>,
    pub key: Option<String>,
    pub map_file: Option<String>,
    pub root_node: Option<RootNode>,
    pub publishing_interval_ms: u32,
    pub connection_timeout_ms: u32,
}

impl BackendParameters {
    /// Builds the `opc.tcp://host:port` address and validated parameters
    /// from a flat parameter map. `host` and `port` are required; everything
    /// else defaults the way `createInstance` does.
    pub fn from_map(host: &str, params: &HashMap<String, String>) -> Result<Self> {
        let port = params
            .get("port")
            .ok_or_else(|| anyhow!("'port' parameter is required"))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("'port' value '{port}' is not a valid port number"))?;

        let publishing_interval_ms = match params.get("publishingInterval") {
            Some(v) => v
                .parse()
                .with_context(|| format!("'publishingInterval' value '{v}' is not a valid u32"))?,
            None => 500,
        };

        let connection_timeout_ms = match params.get("connectionTimeout") {
            Some(v) => v
                .parse()
                .with_context(|| format!("'connectionTimeout' value '{v}' is not a valid u32"))?,
            None => 5000,
        };

        let root_node = params
            .get("rootNode")
            .map(|raw| RootNode::parse(raw))
            .transpose()?;

        Ok(BackendParameters {
            server_address: format!("opc.tcp://{host}:{port}"),
            username: params.get("username").cloned(),
            password: params.get("password").cloned(),
            certificate: params.get("certificate").cloned(),
            key: params.get("key").cloned(),
            map_file: params.get("map").cloned(),
            root_node,
            publishing_interval_ms,
            connection_timeout_ms,
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    pub fn has_certificate(&self) -> bool {
        self.certificate.is_some() && self.key.is_some()
    }
}
