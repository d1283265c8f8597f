//! Server-browse catalogue construction.
//!
//! Grounded in `original_source/src/OPC-UA-Backend.cc::browseRecursive` and
//! `addCatalogueEntry`: walk the address space depth-first from a starting
//! node, and for every Variable node with a string NodeId, issue the same
//! four attribute reads the original does (data type, description, value
//! for array length, access level) to build one [`RegisterInfo`].

use tracing::{error, warn};

use crate::error::BackendResult;
use crate::native::{BrowsedChild, OpcUaClientOps};
use crate::types::{AccessModeFlags, DataDescriptor, NodeId, RegisterInfo, TypeCode};

/// Strips the root node's browse name (plus a trailing "Dir" convention)
/// from a raw browsed path, matching `addCatalogueEntry`'s handling of
/// `_rootNode`/`localNodeName.erase(0, localRootName.length())`.
fn strip_root_prefix(raw_path: &str, root_name: Option<&str>) -> String {
    let mut path = raw_path.trim_start_matches('/').to_string();
    if let Some(root) = root_name {
        let stripped_root = root.strip_suffix("Dir").unwrap_or(root);
        if path.starts_with(stripped_root) {
            path = path[stripped_root.len()..].to_string();
        }
    }
    path.trim_start_matches('/').to_string()
}

/// One browsed variable turned into a `RegisterInfo`, or `None` if its
/// typecode is unsupported or a required attribute read failed — in both
/// cases the caller logs and skips the register, per spec.md §4.3.
fn build_register_info(
    client: &dyn OpcUaClientOps,
    child: &BrowsedChild,
    root_name: Option<&str>,
) -> Option<RegisterInfo> {
    let metadata = match client.read_node_metadata(&child.node_id) {
        Ok(m) => m,
        Err(e) => {
            error!(
                node = %child.node_id,
                error = %e,
                "failed to read node metadata; variable is not added to the catalogue"
            );
            return None;
        }
    };

    let Some(type_code) = TypeCode::from_builtin_id(metadata.data_type_id) else {
        warn!(
            node = %child.node_id,
            data_type_id = metadata.data_type_id,
            "unknown OPC UA data type; register skipped"
        );
        return None;
    };

    let path = strip_root_prefix(&child.browse_name, root_name);
    let mut access_modes = AccessModeFlags::default();
    access_modes.wait_for_new_data = true;

    Some(RegisterInfo {
        path,
        node_id: child.node_id.clone(),
        browse_name: child.browse_name.clone(),
        type_code,
        array_length: metadata.array_length.max(1),
        read_only: metadata.read_only,
        index_range: None,
        description: metadata.description,
        access_modes,
        data_descriptor: DataDescriptor::for_type_code(type_code),
    })
}

/// Recursively browses from `start`, descending into Object nodes and
/// converting every Variable node with a string NodeId into a
/// [`RegisterInfo`] (matching the original: numeric-NodeId variables are
/// never catalogued by the browse path — only the mapfile path can name
/// them).
pub fn browse_recursive(
    client: &dyn OpcUaClientOps,
    start: &NodeId,
    root_name: Option<&str>,
) -> BackendResult<Vec<RegisterInfo>> {
    let mut out = Vec::new();
    let mut stack = vec![start.clone()];
    while let Some(node) = stack.pop() {
        for child in client.browse_children(&node)? {
            if child.is_object {
                stack.push(child.node_id.clone());
            }
            if child.is_variable && matches!(child.node_id, NodeId::String { .. }) {
                if let Some(info) = build_register_info(client, &child, root_name) {
                    out.push(info);
                }
            }
        }
    }
    Ok(out)
}
