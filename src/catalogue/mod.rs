//! Register catalogue: the map from a caller-facing register path to the
//! [`RegisterInfo`] needed to open an accessor on it (spec.md §4.3).
//!
//! Three independent construction paths feed the same linear list: a server
//! browse from the Objects folder, a server browse rooted at a caller-given
//! node, and a mapfile (legacy whitespace or XML, unified by
//! [`mapfile::MapEntry`]). A fourth path, loading a previously-saved XML
//! cache, skips the browse/mapfile step entirely. Grounded in
//! `original_source/src/OPC-UA-Backend.cc::fillCatalogue` and
//! `CatalogueCache.cc`.

pub mod browse;
pub mod cache;
pub mod mapfile;

use tracing::{error, warn};

use crate::error::BackendResult;
use crate::native::OpcUaClientOps;
use crate::types::{AccessModeFlags, DataDescriptor, NodeId, RegisterInfo, TypeCode};
use cache::CatalogueDocument;
use mapfile::MapEntry;

/// The resolved list of registers this backend instance exposes, plus a
/// linear-scan lookup by path. Spec.md §4.3 does not require a hash map —
/// catalogues are built once at connect time and are small enough that a
/// linear scan is the simplest correct implementation, matching
/// `original_source`'s `std::vector<RegisterInfo>` plus a linear `find`.
#[derive(Debug, Clone, Default)]
pub struct Catalogue {
    registers: Vec<RegisterInfo>,
}

impl Catalogue {
    pub fn empty() -> Self {
        Catalogue { registers: Vec::new() }
    }

    pub fn from_registers(registers: Vec<RegisterInfo>) -> Self {
        Catalogue { registers }
    }

    /// Builds a catalogue by recursively browsing the server's address space
    /// from the Objects folder (`ns=0;i=85`), the default when no root node
    /// or mapfile is configured.
    pub fn from_server_browse(client: &dyn OpcUaClientOps) -> BackendResult<Self> {
        let objects_folder = NodeId::Numeric { namespace: 0, id: 85 };
        let registers = browse::browse_recursive(client, &objects_folder, None)?;
        Ok(Catalogue { registers })
    }

    /// Builds a catalogue by browsing from a caller-supplied root node,
    /// stripping the root's browse name (and trailing "Dir" convention) from
    /// every resulting path.
    pub fn from_server_browse_rooted(
        client: &dyn OpcUaClientOps,
        root: &NodeId,
        root_name: &str,
    ) -> BackendResult<Self> {
        let registers = browse::browse_recursive(client, root, Some(root_name))?;
        Ok(Catalogue { registers })
    }

    /// Builds a catalogue from a list of already-parsed mapfile entries
    /// (legacy or XML — both parse to [`MapEntry`]), reading each entry's
    /// metadata off the live server the same way the browse path does.
    /// Entries whose metadata read fails are skipped with a warning, per
    /// spec.md §9 open question #3.
    pub fn from_mapfile_entries(client: &dyn OpcUaClientOps, entries: &[MapEntry]) -> Self {
        let mut registers = Vec::with_capacity(entries.len());
        for entry in entries {
            match register_info_for_mapfile_entry(client, entry) {
                Some(info) => registers.push(info),
                None => warn!(node = %entry.node_id, "mapfile entry could not be resolved against the server; skipped"),
            }
        }
        Catalogue { registers }
    }

    /// Builds a catalogue straight from a previously-saved XML cache
    /// document, with no server round-trip at all.
    pub fn from_cache_document(doc: CatalogueDocument) -> Self {
        Catalogue { registers: doc.registers }
    }

    /// Converts this catalogue into a [`CatalogueDocument`] ready to be
    /// persisted via [`cache::save_to_file`].
    pub fn to_cache_document(&self, server_address: String) -> CatalogueDocument {
        CatalogueDocument { server_address, registers: self.registers.clone() }
    }

    /// Linear lookup by register path (spec.md §4.3: "a flat namespace of
    /// register paths", not a hierarchy-aware lookup).
    pub fn lookup(&self, path: &str) -> Option<&RegisterInfo> {
        self.registers.iter().find(|r| r.path == path)
    }

    pub fn registers(&self) -> &[RegisterInfo] {
        &self.registers
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}

fn register_info_for_mapfile_entry(client: &dyn OpcUaClientOps, entry: &MapEntry) -> Option<RegisterInfo> {
    let metadata = match client.read_node_metadata(&entry.node_id) {
        Ok(m) => m,
        Err(e) => {
            error!(node = %entry.node_id, error = %e, "failed to read metadata for mapfile entry");
            return None;
        }
    };
    let type_code = TypeCode::from_builtin_id(metadata.data_type_id)?;
    let path = entry.alt_name.clone().unwrap_or_else(|| entry.node_id.to_string());
    let mut access_modes = AccessModeFlags::default();
    access_modes.wait_for_new_data = true;

    Some(RegisterInfo {
        path,
        node_id: entry.node_id.clone(),
        browse_name: entry.node_id.to_string(),
        type_code,
        array_length: metadata.array_length.max(1),
        read_only: metadata.read_only,
        index_range: entry.index_range.clone(),
        description: metadata.description,
        access_modes,
        data_descriptor: DataDescriptor::for_type_code(type_code),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::fake::FakeClient;

    #[test]
    fn lookup_finds_register_by_path() {
        let catalogue = Catalogue::from_registers(vec![RegisterInfo {
            path: "scalar/int32".to_string(),
            node_id: NodeId::Numeric { namespace: 2, id: 1 },
            browse_name: "1".to_string(),
            type_code: TypeCode::I32,
            array_length: 1,
            read_only: false,
            index_range: None,
            description: String::new(),
            access_modes: AccessModeFlags::default(),
            data_descriptor: DataDescriptor::for_type_code(TypeCode::I32),
        }]);
        assert!(catalogue.lookup("scalar/int32").is_some());
        assert!(catalogue.lookup("missing").is_none());
    }

    #[test]
    fn mapfile_entries_resolve_against_fake_client() {
        let client = FakeClient::new();
        let entries = vec![MapEntry {
            alt_name: Some("myAlt".to_string()),
            node_id: NodeId::Numeric { namespace: 2, id: 42 },
            index_range: None,
        }];
        let catalogue = Catalogue::from_mapfile_entries(&client, &entries);
        assert_eq!(catalogue.len(), 1);
        assert_eq!(catalogue.lookup("myAlt").unwrap().type_code, TypeCode::I32);
    }

    #[test]
    fn cache_document_round_trips_into_catalogue() {
        let doc = CatalogueDocument {
            server_address: "opc.tcp://localhost:4840".to_string(),
            registers: vec![],
        };
        let catalogue = Catalogue::from_cache_document(doc);
        assert!(catalogue.is_empty());
        let round_tripped = catalogue.to_cache_document("opc.tcp://localhost:4840".to_string());
        assert_eq!(round_tripped.server_address, "opc.tcp://localhost:4840");
    }
}
