//! Parsers for the two mapfile syntaxes (spec.md §6), both producing the
//! same [`MapEntry`] list. Grounded in
//! `original_source/src/OPC-UA-Backend.cc::getNodesFromMapfile` (legacy
//! whitespace format) and `original_source/src/MapFile.cc` (XML format).
//!
//! Both parsers are pure functions over `&str` — disk I/O (reading the
//! mapfile path into a string) is the out-of-scope collaborator's job; this
//! module only turns file contents into `MapEntry`s.

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use tracing::error;

use crate::types::NodeId;

/// One parsed mapfile line/`<pv>` element: an optional caller-chosen
/// register name, the resolved NodeId, and an optional index range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub alt_name: Option<String>,
    pub node_id: NodeId,
    pub index_range: Option<String>,
}

/// Parses a NodeId the way both mapfile formats do: try the token as a
/// numeric id first, and on failure fall back to treating it as a string id
/// prefixed with `root_prefix` (spec.md §4.3, open question #3: a failure at
/// any stage just skips this one entry, it never leaves a half-built entry
/// around).
fn resolve_node_id(token: &str, namespace_token: &str, root_prefix: &str) -> Option<NodeId> {
    let namespace: u16 = namespace_token.parse().ok()?;
    match token.parse::<u32>() {
        Ok(id) => Some(NodeId::Numeric { namespace, id }),
        Err(_) => Some(NodeId::String {
            namespace,
            id: format!("{root_prefix}{token}"),
        }),
    }
}

/// Legacy whitespace-separated format: 2 or 3 tokens per non-blank,
/// non-`#`-prefixed line. `#` starts a comment; blank lines are ignored.
/// `root_prefix` is prepended to string NodeIds, mirroring
/// `_rootNode + (*it)` in the original.
pub fn parse_legacy(text: &str, root_prefix: &str) -> Vec<MapEntry> {
    let mut entries = Vec::new();
    for (line_no, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 2 && tokens.len() != 3 {
            error!(line = line_no + 1, tokens = tokens.len(), "wrong number of tokens in mapfile line; skipped");
            continue;
        }
        let (alt_name, node_token, namespace_token) = if tokens.len() == 3 {
            (Some(tokens[0].to_string()), tokens[1], tokens[2])
        } else {
            (None, tokens[0], tokens[1])
        };
        match resolve_node_id(node_token, namespace_token, root_prefix) {
            Some(node_id) => entries.push(MapEntry { alt_name, node_id, index_range: None }),
            None => error!(line = line_no + 1, "failed to parse namespace/node id in mapfile line; skipped"),
        }
    }
    entries
}

/// XML format: `<uamapping>` root in the
/// `https://github.com/ChimeraTK/DeviceAccess-OpcUaBackend` namespace,
/// children `<pv ns="N" name="alt" range="a:b">nodeId</pv>`. Grounded in
/// `MapFile.cc::readElements`, which uses an XPath `//pv` query; here a
/// streaming reader suffices since the only elements of interest are `<pv>`.
pub fn parse_xml(text: &str, root_prefix: &str) -> Vec<MapEntry> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);
    let mut entries = Vec::new();
    let mut buf = Vec::new();
    let mut pending: Option<(Option<String>, Option<String>, Option<String>)> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.local_name().as_ref() == b"pv" => {
                pending = Some(pv_attributes(e));
            }
            Ok(Event::Text(ref t)) => {
                if let Some((namespace_token, range, name)) = pending.take() {
                    if let Ok(text_value) = t.unescape() {
                        let node_text = text_value.trim();
                        if !node_text.is_empty() {
                            return_node_text(&mut entries, namespace_token, range, name, node_text, root_prefix);
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "XML parse error in mapfile; remaining entries skipped");
                break;
            }
        }
        buf.clear();
    }
    entries
}

fn pv_attributes(e: &quick_xml::events::BytesStart) -> (Option<String>, Option<String>, Option<String>) {
    let mut namespace_token = None;
    let mut range = None;
    let mut name = None;
    for attr in e.attributes().flatten() {
        let key = attr.key.local_name();
        let value = String::from_utf8_lossy(&attr.value).into_owned();
        match key.as_ref() {
            b"ns" => namespace_token = Some(value),
            b"range" => range = Some(value),
            b"name" => name = Some(value),
            _ => {}
        }
    }
    (namespace_token, range, name)
}

fn return_node_text(
    entries: &mut Vec<MapEntry>,
    namespace_token: Option<String>,
    range: Option<String>,
    alt_name: Option<String>,
    node_text: &str,
    root_prefix: &str,
) {
    let Some(namespace_token) = namespace_token else {
        error!("<pv> element missing required 'ns' attribute; skipped");
        return;
    };
    match resolve_node_id(node_text, &namespace_token, root_prefix) {
        Some(node_id) => entries.push(MapEntry {
            alt_name,
            node_id,
            index_range: range.filter(|r| !r.is_empty()),
        }),
        None => error!(ns = %namespace_token, "failed to parse namespace in mapfile <pv> element; skipped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_parses_two_and_three_token_lines() {
        let text = "# comment\n1234 2\nalt 5678 3\n";
        let entries = parse_legacy(text, "Root/");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].alt_name, None);
        assert_eq!(entries[0].node_id, NodeId::Numeric { namespace: 2, id: 1234 });
        assert_eq!(entries[1].alt_name, Some("alt".to_string()));
        assert_eq!(entries[1].node_id, NodeId::Numeric { namespace: 3, id: 5678 });
    }

    #[test]
    fn legacy_falls_back_to_string_node_id_with_root_prefix() {
        let text = "myNode 2\n";
        let entries = parse_legacy(text, "Root/");
        assert_eq!(entries[0].node_id, NodeId::String { namespace: 2, id: "Root/myNode".to_string() });
    }

    #[test]
    fn legacy_skips_malformed_lines() {
        let text = "1 2 3 4 5\nvalid 2\n";
        let entries = parse_legacy(text, "Root/");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn xml_parses_numeric_and_string_pv_elements() {
        let xml = r#"<uamapping xmlns="https://github.com/ChimeraTK/DeviceAccess-OpcUaBackend">
            <pv ns="2" name="alt1">1234</pv>
            <pv ns="3" range="0:4">myNode</pv>
        </uamapping>"#;
        let entries = parse_xml(xml, "Root/");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].node_id, NodeId::Numeric { namespace: 2, id: 1234 });
        assert_eq!(entries[0].alt_name, Some("alt1".to_string()));
        assert_eq!(entries[1].node_id, NodeId::String { namespace: 3, id: "Root/myNode".to_string() });
        assert_eq!(entries[1].index_range, Some("0:4".to_string()));
    }
}
