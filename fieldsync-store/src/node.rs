//! Typed node values and the store interface the engine synchronizes into.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use fieldsync_common::codec::{ScalarValue, ValueType};

use crate::error::Result;

/// Typed property value hosted at a node-path leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    /// Raw register/coil words, as fetched from the bus.
    Words(Vec<u16>),
}

impl NodeValue {
    /// Interpret as a signed integer where the variant allows it.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            NodeValue::Int(v) => Some(*v),
            NodeValue::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Interpret as text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            NodeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret as raw words.
    pub fn as_words(&self) -> Option<&[u16]> {
        match self {
            NodeValue::Words(w) => Some(w),
            _ => None,
        }
    }

    /// Coerce into a scalar of the given type, with range checking.
    ///
    /// Used when an external write arrives for a value leaf: the store
    /// carries loosely-typed numbers, the bus needs the value's exact
    /// scalar encoding.
    pub fn to_scalar(&self, ty: ValueType) -> Option<ScalarValue> {
        let int = |v: &NodeValue| -> Option<i128> {
            match v {
                NodeValue::Int(i) => Some(*i as i128),
                NodeValue::UInt(u) => Some(*u as i128),
                _ => None,
            }
        };
        let float = |v: &NodeValue| -> Option<f64> {
            match v {
                NodeValue::Float(f) => Some(*f),
                NodeValue::Int(i) => Some(*i as f64),
                NodeValue::UInt(u) => Some(*u as f64),
                _ => None,
            }
        };

        match ty {
            ValueType::Bool => match self {
                NodeValue::Bool(b) => Some(ScalarValue::Bool(*b)),
                other => int(other).map(|v| ScalarValue::Bool(v != 0)),
            },
            ValueType::Int16 => int(self)
                .and_then(|v| i16::try_from(v).ok())
                .map(ScalarValue::Int16),
            ValueType::UInt16 => int(self)
                .and_then(|v| u16::try_from(v).ok())
                .map(ScalarValue::UInt16),
            ValueType::Int32 | ValueType::Int32Le => int(self)
                .and_then(|v| i32::try_from(v).ok())
                .map(ScalarValue::Int32),
            ValueType::UInt32 | ValueType::UInt32Le => int(self)
                .and_then(|v| u32::try_from(v).ok())
                .map(ScalarValue::UInt32),
            ValueType::Int64 | ValueType::Int64Le => int(self)
                .and_then(|v| i64::try_from(v).ok())
                .map(ScalarValue::Int64),
            ValueType::UInt64 | ValueType::UInt64Le => int(self)
                .and_then(|v| u64::try_from(v).ok())
                .map(ScalarValue::UInt64),
            ValueType::Float32 | ValueType::Float32Le => {
                float(self).map(|v| ScalarValue::Float32(v as f32))
            }
            ValueType::Float64 | ValueType::Float64Le => float(self).map(ScalarValue::Float64),
        }
    }
}

impl From<ScalarValue> for NodeValue {
    fn from(v: ScalarValue) -> Self {
        match v {
            ScalarValue::Bool(b) => NodeValue::Bool(b),
            ScalarValue::Int16(v) => NodeValue::Int(v as i64),
            ScalarValue::UInt16(v) => NodeValue::UInt(v as u64),
            ScalarValue::Int32(v) => NodeValue::Int(v as i64),
            ScalarValue::UInt32(v) => NodeValue::UInt(v as u64),
            ScalarValue::Float32(v) => NodeValue::Float(v as f64),
            ScalarValue::Int64(v) => NodeValue::Int(v),
            ScalarValue::UInt64(v) => NodeValue::UInt(v),
            ScalarValue::Float64(v) => NodeValue::Float(v),
        }
    }
}

/// Who wrote a node value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// The synchronization engine mirroring live data.
    Engine,
    /// An external party (UI, remote client) editing the tree.
    External,
}

/// A change applied to the node tree.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    /// Full node path of the affected leaf.
    pub path: String,
    /// The new value.
    pub value: NodeValue,
    /// Who performed the write.
    pub origin: Origin,
    /// When the store applied it.
    pub timestamp: DateTime<Utc>,
}

/// Hierarchical typed property storage with change notifications.
///
/// The engine mirrors every mutable attribute into the store with
/// [`Origin::Engine`]; external parties edit configuration leaves with
/// [`Origin::External`], which is gated by the per-node write-access
/// flag. All writes fan out to subscribers.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Write a leaf value. Engine writes create missing nodes; external
    /// writes require an existing, writable node.
    async fn set(&self, path: &str, value: NodeValue, origin: Origin) -> Result<()>;

    /// Read a leaf value.
    async fn get(&self, path: &str) -> Option<NodeValue>;

    /// Set the write-access flag of a leaf.
    async fn set_writable(&self, path: &str, writable: bool);

    /// Read the write-access flag of a leaf.
    async fn writable(&self, path: &str) -> bool;

    /// Remove a node and its entire subtree.
    async fn remove(&self, path: &str);

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_to_node() {
        assert_eq!(NodeValue::from(ScalarValue::Int16(-3)), NodeValue::Int(-3));
        assert_eq!(NodeValue::from(ScalarValue::UInt64(9)), NodeValue::UInt(9));
        assert_eq!(
            NodeValue::from(ScalarValue::Float32(0.5)),
            NodeValue::Float(0.5)
        );
    }

    #[test]
    fn test_coerce_in_range() {
        assert_eq!(
            NodeValue::Int(42).to_scalar(ValueType::UInt16),
            Some(ScalarValue::UInt16(42))
        );
        assert_eq!(
            NodeValue::UInt(7).to_scalar(ValueType::Int64),
            Some(ScalarValue::Int64(7))
        );
        assert_eq!(
            NodeValue::Int(1).to_scalar(ValueType::Bool),
            Some(ScalarValue::Bool(true))
        );
        assert_eq!(
            NodeValue::Int(-2).to_scalar(ValueType::Float32),
            Some(ScalarValue::Float32(-2.0))
        );
    }

    #[test]
    fn test_coerce_out_of_range() {
        assert_eq!(NodeValue::Int(-1).to_scalar(ValueType::UInt16), None);
        assert_eq!(NodeValue::Int(70000).to_scalar(ValueType::Int16), None);
        assert_eq!(
            NodeValue::Text("x".into()).to_scalar(ValueType::UInt32),
            None
        );
    }
}
