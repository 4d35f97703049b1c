//! Nested tensor-bearing structures exchanged with hook callbacks.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Non-tensor leaf values the schema can serialize inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpaqueValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Leaf carrying an arbitrary host object the schema cannot capture.
///
/// Foreign leaves survive inside a [`Value`] tree but are rejected by the
/// codec; callers are expected to pre-validate structures that may contain
/// them.
#[derive(Clone)]
pub struct ForeignLeaf {
    payload: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl ForeignLeaf {
    pub fn new<V: Any + Send + Sync>(value: V) -> Self {
        Self {
            payload: Arc::new(value),
            type_name: std::any::type_name::<V>(),
        }
    }

    /// Name of the concrete type captured at construction time.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<V: Any>(&self) -> Option<&V> {
        self.payload.downcast_ref()
    }
}

impl fmt::Debug for ForeignLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ForeignLeaf({})", self.type_name)
    }
}

impl PartialEq for ForeignLeaf {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.payload, &other.payload)
    }
}

/// Arbitrarily nested composition of sequences, keyed mappings, tensor
/// leaves, and opaque leaves.
///
/// Mappings use sorted keys (`BTreeMap`), which doubles as the canonical key
/// order the codec records in schemas.
#[derive(Debug, Clone, PartialEq)]
pub enum Value<T> {
    Tensor(T),
    Seq(Vec<Value<T>>),
    Map(BTreeMap<String, Value<T>>),
    Opaque(OpaqueValue),
    Foreign(ForeignLeaf),
}

impl<T> Value<T> {
    pub fn none() -> Self {
        Value::Opaque(OpaqueValue::None)
    }

    pub fn int(value: i64) -> Self {
        Value::Opaque(OpaqueValue::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Value::Opaque(OpaqueValue::Float(value))
    }

    pub fn str(value: impl Into<String>) -> Self {
        Value::Opaque(OpaqueValue::Str(value.into()))
    }

    pub fn seq(items: impl Into<Vec<Value<T>>>) -> Self {
        Value::Seq(items.into())
    }

    pub fn map(entries: impl IntoIterator<Item = (String, Value<T>)>) -> Self {
        Value::Map(entries.into_iter().collect())
    }

    pub fn foreign<V: Any + Send + Sync>(value: V) -> Self {
        Value::Foreign(ForeignLeaf::new(value))
    }

    /// Number of tensor leaves reachable from this node.
    pub fn tensor_leaf_count(&self) -> usize {
        match self {
            Value::Tensor(_) => 1,
            Value::Seq(items) => items.iter().map(Value::tensor_leaf_count).sum(),
            Value::Map(entries) => entries.values().map(Value::tensor_leaf_count).sum(),
            Value::Opaque(_) | Value::Foreign(_) => 0,
        }
    }
}
