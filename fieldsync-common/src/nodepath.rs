//! Node-path builders and parsers for the synchronized tree.
//!
//! Paths follow the pattern:
//! `<prefix>/<client>[/<block>[/<value>]]/@/<attr>`
//!
//! The `@` segment separates the entity from its attribute leaf, so
//! entity names can never collide with attribute names.

/// Default node-path prefix for all FieldSync entities.
pub const PATH_PREFIX: &str = "fieldsync";

/// Attribute leaf names hosted under each entity's `@` node.
pub mod attr {
    /// Client: connection state.
    pub const STATE: &str = "state";
    /// Client: Modbus unit (server) address.
    pub const UNIT: &str = "unit";
    /// Block: register kind.
    pub const KIND: &str = "kind";
    /// Block: start address.
    pub const ADDRESS: &str = "address";
    /// Block: element count.
    pub const COUNT: &str = "count";
    /// Block: sampling period in milliseconds.
    pub const SAMPLING: &str = "sampling";
    /// Block: last raw data.
    pub const DATA: &str = "data";
    /// Value: scalar type.
    pub const TYPE: &str = "type";
    /// Value: element offset into the block.
    pub const OFFSET: &str = "offset";
    /// Value: decoded value.
    pub const VALUE: &str = "value";
    /// Any entity: last error code.
    pub const ERROR: &str = "error";
}

/// Builder for node paths under a fixed prefix.
#[derive(Debug, Clone)]
pub struct NodePathBuilder {
    prefix: String,
}

impl NodePathBuilder {
    /// Create a builder with the default prefix.
    pub fn new() -> Self {
        Self::with_prefix(PATH_PREFIX)
    }

    /// Create a builder with a custom prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Path of a client node.
    pub fn client(&self, client: &str) -> String {
        format!("{}/{}", self.prefix, client)
    }

    /// Path of a client attribute leaf.
    pub fn client_attr(&self, client: &str, attr: &str) -> String {
        format!("{}/{}/@/{}", self.prefix, client, attr)
    }

    /// Path of a block node.
    pub fn block(&self, client: &str, block: &str) -> String {
        format!("{}/{}/{}", self.prefix, client, block)
    }

    /// Path of a block attribute leaf.
    pub fn block_attr(&self, client: &str, block: &str, attr: &str) -> String {
        format!("{}/{}/{}/@/{}", self.prefix, client, block, attr)
    }

    /// Path of a value node.
    pub fn value(&self, client: &str, block: &str, value: &str) -> String {
        format!("{}/{}/{}/{}", self.prefix, client, block, value)
    }

    /// Path of a value attribute leaf.
    pub fn value_attr(&self, client: &str, block: &str, value: &str, attr: &str) -> String {
        format!("{}/{}/{}/{}/@/{}", self.prefix, client, block, value, attr)
    }
}

impl Default for NodePathBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed components of a node path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedNodePath<'a> {
    pub client: &'a str,
    pub block: Option<&'a str>,
    pub value: Option<&'a str>,
    /// Attribute leaf, if the path addresses one.
    pub attr: Option<&'a str>,
}

/// Parse a node path under the given prefix.
///
/// Returns `None` for paths outside the prefix or with an unexpected
/// shape.
pub fn parse_node_path<'a>(prefix: &str, path: &'a str) -> Option<ParsedNodePath<'a>> {
    let rest = path.strip_prefix(prefix)?.strip_prefix('/')?;
    let segments: Vec<&str> = rest.split('/').collect();

    // Split entity segments from an optional trailing "@/<attr>".
    let (entity, attr) = match segments.iter().position(|s| *s == "@") {
        Some(at) => {
            if at + 2 != segments.len() {
                return None;
            }
            (&segments[..at], Some(segments[at + 1]))
        }
        None => (&segments[..], None),
    };

    if entity.is_empty() || entity.len() > 3 || entity.iter().any(|s| s.is_empty()) {
        return None;
    }

    Some(ParsedNodePath {
        client: entity[0],
        block: entity.get(1).copied(),
        value: entity.get(2).copied(),
        attr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_paths() {
        let paths = NodePathBuilder::new();
        assert_eq!(paths.client("plc01"), "fieldsync/plc01");
        assert_eq!(
            paths.client_attr("plc01", attr::STATE),
            "fieldsync/plc01/@/state"
        );
        assert_eq!(
            paths.block_attr("plc01", "meters", attr::KIND),
            "fieldsync/plc01/meters/@/kind"
        );
        assert_eq!(
            paths.value_attr("plc01", "meters", "voltage", attr::VALUE),
            "fieldsync/plc01/meters/voltage/@/value"
        );
    }

    #[test]
    fn test_parse_round_trip() {
        let paths = NodePathBuilder::with_prefix("plant/field");
        let key = paths.value_attr("plc01", "meters", "voltage", attr::OFFSET);
        let parsed = parse_node_path("plant/field", &key).unwrap();

        assert_eq!(parsed.client, "plc01");
        assert_eq!(parsed.block, Some("meters"));
        assert_eq!(parsed.value, Some("voltage"));
        assert_eq!(parsed.attr, Some("offset"));
    }

    #[test]
    fn test_parse_entity_only() {
        let parsed = parse_node_path("fieldsync", "fieldsync/plc01/meters").unwrap();
        assert_eq!(parsed.client, "plc01");
        assert_eq!(parsed.block, Some("meters"));
        assert_eq!(parsed.value, None);
        assert_eq!(parsed.attr, None);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_node_path("fieldsync", "other/plc01/@/state").is_none());
        assert!(parse_node_path("fieldsync", "fieldsync").is_none());
        assert!(parse_node_path("fieldsync", "fieldsync/a/b/c/d/@/x").is_none());
        assert!(parse_node_path("fieldsync", "fieldsync/a/@/x/y").is_none());
        assert!(parse_node_path("fieldsync", "fieldsync//@/state").is_none());
    }
}
