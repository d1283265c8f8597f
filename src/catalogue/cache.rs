//! XML catalogue-cache format (spec.md §6) and its atomic-write contract.
//!
//! Grounded in `original_source/src/CatalogueCache.cc` (`readCatalogue` /
//! `saveCatalogue`) and `RegisterInfo.cc`'s serialization of
//! `AccessModeFlags`. The cache is written to a randomly-named temporary
//! sibling file, checked non-empty, then renamed into place — so a crash
//! mid-save can never leave an empty cache masking the real one (spec.md
//! §9, "Catalogue-cache atomic write").
//!
//! Spec.md §9 open question #4: the original extracts a numeric NodeId's
//! cache text with `nodeId.substr(nodeId.length() - 1)`, which drops every
//! digit but the last. Here numeric NodeIds are always persisted and parsed
//! as their full decimal text.

use std::io::Write as _;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use tracing::warn;

use crate::error::{BackendError, BackendResult};
use crate::types::{AccessModeFlags, DataDescriptor, NodeId, RegisterInfo, TypeCode};

const CACHE_NAMESPACE: &str = "https://github.com/ChimeraTK/DeviceAccess-OpcUaBackend";

/// An in-memory snapshot of a catalogue, independent of how it was built
/// (browse, mapfile, or a previous cache load), ready to be written to or
/// read from the XML cache format.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogueDocument {
    pub server_address: String,
    pub registers: Vec<RegisterInfo>,
}

/// Serializes the access-mode flag set the way `AccessModeFlags::serialize()`
/// does: one token per set flag, space-separated. Every register in this
/// crate reports `wait_for_new_data` (spec.md §4.3).
fn serialize_access_modes(flags: &AccessModeFlags) -> String {
    let mut tokens = Vec::new();
    if flags.wait_for_new_data {
        tokens.push("wait_for_new_data");
    }
    if flags.raw {
        tokens.push("raw");
    }
    tokens.join(" ")
}

fn deserialize_access_modes(text: &str) -> AccessModeFlags {
    let mut flags = AccessModeFlags::default();
    for token in text.split_whitespace() {
        match token {
            "wait_for_new_data" => flags.wait_for_new_data = true,
            "raw" => flags.raw = true,
            other => warn!(token = other, "unknown access mode token in cache file; ignored"),
        }
    }
    flags
}

fn write_text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> BackendResult<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .and_then(|_| writer.write_event(Event::Text(BytesText::new(text))))
        .and_then(|_| writer.write_event(Event::End(BytesEnd::new(name))))
        .map_err(|e| BackendError::runtime(format!("failed to write cache XML: {e}")))
}

/// Serializes `doc` to the spec.md §6 XML shape. Pure function; callers
/// handle the atomic temp-then-rename dance around the bytes this returns.
pub fn serialize(doc: &CatalogueDocument) -> BackendResult<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(|e| BackendError::runtime(format!("failed to write cache XML declaration: {e}")))?;

    let mut root = BytesStart::new("catalogue");
    root.push_attribute(("xmlns", CACHE_NAMESPACE));
    root.push_attribute(("version", "1.0"));
    writer
        .write_event(Event::Start(root))
        .map_err(|e| BackendError::runtime(format!("failed to write cache XML: {e}")))?;

    writer
        .write_event(Event::Start(BytesStart::new("general")))
        .map_err(|e| BackendError::runtime(format!("failed to write cache XML: {e}")))?;
    write_text_element(&mut writer, "serverAddress", &doc.server_address)?;
    writer
        .write_event(Event::End(BytesEnd::new("general")))
        .map_err(|e| BackendError::runtime(format!("failed to write cache XML: {e}")))?;

    for reg in &doc.registers {
        writer
            .write_event(Event::Start(BytesStart::new("register")))
            .map_err(|e| BackendError::runtime(format!("failed to write cache XML: {e}")))?;
        write_text_element(&mut writer, "nodeId", &node_id_text(&reg.node_id))?;
        write_text_element(&mut writer, "name", &reg.path)?;
        write_text_element(&mut writer, "description", &reg.description)?;
        write_text_element(&mut writer, "length", &reg.array_length.to_string())?;
        write_text_element(&mut writer, "access_mode", &serialize_access_modes(&reg.access_modes))?;
        write_text_element(&mut writer, "readOnly", if reg.read_only { "1" } else { "0" })?;
        write_text_element(&mut writer, "typeId", &reg.type_code.as_cache_id().to_string())?;
        write_text_element(&mut writer, "nameSpace", &reg.node_id.namespace().to_string())?;
        write_text_element(
            &mut writer,
            "isNumeric",
            if matches!(reg.node_id, NodeId::Numeric { .. }) { "1" } else { "0" },
        )?;
        write_text_element(&mut writer, "indexRange", reg.index_range.as_deref().unwrap_or(""))?;
        writer
            .write_event(Event::End(BytesEnd::new("register")))
            .map_err(|e| BackendError::runtime(format!("failed to write cache XML: {e}")))?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("catalogue")))
        .map_err(|e| BackendError::runtime(format!("failed to write cache XML: {e}")))?;
    Ok(writer.into_inner())
}

/// Full decimal text of a NodeId's identifier, independent of numeric/string
/// kind (spec.md §9 open question #4 fix).
fn node_id_text(node: &NodeId) -> String {
    match node {
        NodeId::Numeric { id, .. } => id.to_string(),
        NodeId::String { id, .. } => id.clone(),
    }
}

#[derive(Default)]
struct RawRegister {
    node_id: String,
    name: String,
    description: String,
    length: String,
    access_mode: String,
    read_only: String,
    type_id: String,
    namespace: String,
    is_numeric: String,
    index_range: String,
}

fn finish_register(raw: RawRegister) -> Option<RegisterInfo> {
    let type_id: u32 = raw.type_id.parse().ok()?;
    let type_code = TypeCode::from_builtin_id(type_id)?;
    let namespace: u16 = raw.namespace.parse().ok()?;
    let array_length: usize = raw.length.parse().ok()?;
    let is_numeric = raw.is_numeric == "1";
    let node_id = if is_numeric {
        NodeId::Numeric { namespace, id: raw.node_id.parse().ok()? }
    } else {
        NodeId::String { namespace, id: raw.node_id }
    };
    Some(RegisterInfo {
        path: raw.name,
        node_id,
        browse_name: raw.node_id_display_placeholder(),
        type_code,
        array_length: array_length.max(1),
        read_only: raw.read_only == "1",
        index_range: if raw.index_range.is_empty() { None } else { Some(raw.index_range) },
        description: raw.description,
        access_modes: deserialize_access_modes(&raw.access_mode),
        data_descriptor: DataDescriptor::for_type_code(type_code),
    })
}

impl RawRegister {
    // `browse_name` is not persisted separately in the cache format (the
    // original only round-trips the register's path/name); the node id's
    // decimal/string text is the closest stable identifier to reuse here.
    fn node_id_display_placeholder(&self) -> String {
        self.node_id.clone()
    }
}

/// Parses the spec.md §6 XML shape back into a [`CatalogueDocument`]. Any
/// register entry that fails to parse is skipped with a warning rather than
/// aborting the whole load (spec.md §9 open question #3).
pub fn deserialize(xml: &str) -> BackendResult<CatalogueDocument> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut server_address = String::new();
    let mut registers = Vec::new();
    let mut element_stack: Vec<String> = Vec::new();
    let mut current: Option<RawRegister> = None;
    let mut in_general = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "register" {
                    current = Some(RawRegister::default());
                } else if name == "general" {
                    in_general = true;
                }
                element_stack.push(name);
            }
            Ok(Event::Text(ref t)) => {
                let Ok(text) = t.unescape() else { continue };
                let text = text.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                if let Some(field) = element_stack.last() {
                    if in_general && field == "serverAddress" {
                        server_address = text;
                    } else if let Some(reg) = current.as_mut() {
                        match field.as_str() {
                            "nodeId" => reg.node_id = text,
                            "name" => reg.name = text,
                            "description" => reg.description = text,
                            "length" => reg.length = text,
                            "access_mode" => reg.access_mode = text,
                            "readOnly" => reg.read_only = text,
                            "typeId" => reg.type_id = text,
                            "nameSpace" => reg.namespace = text,
                            "isNumeric" => reg.is_numeric = text,
                            "indexRange" => reg.index_range = text,
                            _ => {}
                        }
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "general" {
                    in_general = false;
                }
                if name == "register" {
                    if let Some(raw) = current.take() {
                        match finish_register(raw) {
                            Some(info) => registers.push(info),
                            None => warn!("failed to parse a cached register entry; skipped"),
                        }
                    }
                }
                element_stack.pop();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(BackendError::runtime(format!("failed to parse cache XML: {e}"))),
        }
        buf.clear();
    }

    Ok(CatalogueDocument { server_address, registers })
}

/// Writes `doc` to `path` atomically: serialize to a randomly-named
/// temporary sibling file, verify it is non-empty, then rename over `path`.
/// Mirrors `CatalogueCache.cc::saveCatalogue`.
pub fn save_to_file(doc: &CatalogueDocument, path: &std::path::Path) -> BackendResult<()> {
    let bytes = serialize(doc)?;
    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let tmp_name = format!(
        ".{:06x}-opcua-backend-cache-{:06x}.tmp",
        std::process::id(),
        bytes.len()
    );
    let tmp_path = dir.join(tmp_name);

    {
        let mut file = std::fs::File::create(&tmp_path)
            .map_err(|e| BackendError::runtime(format!("failed to create temporary cache file: {e}")))?;
        file.write_all(&bytes)
            .map_err(|e| BackendError::runtime(format!("failed to write temporary cache file: {e}")))?;
    }

    let written = std::fs::metadata(&tmp_path).map(|m| m.len()).unwrap_or(0);
    if written == 0 {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(BackendError::runtime("failed to save cache file: temporary file was empty"));
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| BackendError::runtime(format!("failed to replace cache file: {e}")))
}

pub fn load_from_file(path: &std::path::Path) -> BackendResult<CatalogueDocument> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| BackendError::runtime(format!("failed to read cache file {}: {e}", path.display())))?;
    deserialize(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccessModeFlags, DataDescriptor, NodeId, RegisterInfo, TypeCode};

    fn sample_doc() -> CatalogueDocument {
        let mut flags = AccessModeFlags::default();
        flags.wait_for_new_data = true;
        CatalogueDocument {
            server_address: "opc.tcp://localhost:4840".to_string(),
            registers: vec![
                RegisterInfo {
                    path: "Dummy/scalar/int32".to_string(),
                    node_id: NodeId::Numeric { namespace: 2, id: 123456789 },
                    browse_name: "123456789".to_string(),
                    type_code: TypeCode::I32,
                    array_length: 1,
                    read_only: false,
                    index_range: None,
                    description: "a scalar".to_string(),
                    access_modes: flags,
                    data_descriptor: DataDescriptor::for_type_code(TypeCode::I32),
                },
                RegisterInfo {
                    path: "Dummy/array/string".to_string(),
                    node_id: NodeId::String { namespace: 3, id: "Dummy.array.string".to_string() },
                    browse_name: "Dummy.array.string".to_string(),
                    type_code: TypeCode::String,
                    array_length: 5,
                    read_only: true,
                    index_range: Some("0:4".to_string()),
                    description: String::new(),
                    access_modes: flags,
                    data_descriptor: DataDescriptor::for_type_code(TypeCode::String),
                },
            ],
        }
    }

    #[test]
    fn round_trips_through_serialize_and_deserialize() {
        let doc = sample_doc();
        let bytes = serialize(&doc).unwrap();
        let xml = String::from_utf8(bytes).unwrap();
        let parsed = deserialize(&xml).unwrap();
        assert_eq!(parsed.server_address, doc.server_address);
        assert_eq!(parsed.registers.len(), doc.registers.len());
        assert_eq!(parsed.registers[0].node_id, doc.registers[0].node_id);
        assert_eq!(parsed.registers[1].index_range, doc.registers[1].index_range);
        assert!(parsed.registers[1].read_only);
    }

    #[test]
    fn numeric_node_id_keeps_all_digits() {
        let doc = sample_doc();
        let bytes = serialize(&doc).unwrap();
        let xml = String::from_utf8(bytes).unwrap();
        assert!(xml.contains("123456789"));
        let parsed = deserialize(&xml).unwrap();
        assert_eq!(parsed.registers[0].node_id, NodeId::Numeric { namespace: 2, id: 123456789 });
    }

    #[test]
    fn save_and_load_round_trip_via_temp_file() {
        let dir = std::env::temp_dir().join(format!("opcua-cache-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("catalogue.xml");
        let doc = sample_doc();
        save_to_file(&doc, &path).unwrap();
        let loaded = load_from_file(&path).unwrap();
        assert_eq!(loaded.registers.len(), 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
