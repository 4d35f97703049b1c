//! Flatten/unflatten codec between nested structures and flat tensor lists.
//!
//! Traversal is depth-first, left-to-right, map keys in canonical (sorted)
//! order. The i-th tensor in a flat list always corresponds to the i-th
//! tensor slot the traversal visits, which is what keeps gradient order
//! intact across the graph boundary.

use thiserror::Error;

use serde::{Deserialize, Serialize};

use super::value::{OpaqueValue, Value};

/// Structural contract violations raised by the codec.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unsupported leaf type `{type_name}` cannot be captured in a schema")]
    UnsupportedLeafType { type_name: String },
    #[error("flat tensor list has {actual} tensors but the schema records {expected} slots")]
    SchemaMismatch { expected: usize, actual: usize },
}

/// Serializable descriptor of a structure's shape and non-tensor content.
///
/// Together with a flat tensor list a schema is sufficient to rebuild the
/// original structure, containers and key order included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Schema {
    TensorSlot,
    Seq(Vec<Schema>),
    Map(Vec<(String, Schema)>),
    Opaque(OpaqueValue),
}

impl Schema {
    /// Number of tensor slots recorded in the schema.
    pub fn tensor_count(&self) -> usize {
        match self {
            Schema::TensorSlot => 1,
            Schema::Seq(items) => items.iter().map(Schema::tensor_count).sum(),
            Schema::Map(entries) => entries.iter().map(|(_, s)| s.tensor_count()).sum(),
            Schema::Opaque(_) => 0,
        }
    }
}

/// Flattens `value` into its tensor leaves plus a reconstructable schema.
///
/// Tensor leaves are appended in visitation order; opaque leaves are stored
/// inline in the schema. Foreign leaves fail with
/// [`SchemaError::UnsupportedLeafType`].
pub fn flatten<T: Clone>(value: &Value<T>) -> Result<(Vec<T>, Schema), SchemaError> {
    let mut tensors = Vec::with_capacity(value.tensor_leaf_count());
    let schema = record(value, &mut tensors)?;
    Ok((tensors, schema))
}

fn record<T: Clone>(value: &Value<T>, tensors: &mut Vec<T>) -> Result<Schema, SchemaError> {
    match value {
        Value::Tensor(tensor) => {
            tensors.push(tensor.clone());
            Ok(Schema::TensorSlot)
        }
        Value::Seq(items) => {
            let mut children = Vec::with_capacity(items.len());
            for item in items {
                children.push(record(item, tensors)?);
            }
            Ok(Schema::Seq(children))
        }
        Value::Map(entries) => {
            let mut children = Vec::with_capacity(entries.len());
            for (key, item) in entries {
                children.push((key.clone(), record(item, tensors)?));
            }
            Ok(Schema::Map(children))
        }
        Value::Opaque(opaque) => Ok(Schema::Opaque(opaque.clone())),
        Value::Foreign(leaf) => Err(SchemaError::UnsupportedLeafType {
            type_name: leaf.type_name().to_string(),
        }),
    }
}

/// Rebuilds the structure described by `schema`, pulling tensors from
/// `tensors` in the traversal order used by [`flatten`].
pub fn unflatten<T: Clone>(tensors: &[T], schema: &Schema) -> Result<Value<T>, SchemaError> {
    let expected = schema.tensor_count();
    if tensors.len() != expected {
        return Err(SchemaError::SchemaMismatch {
            expected,
            actual: tensors.len(),
        });
    }
    let mut cursor = 0usize;
    let value = rebuild(schema, tensors, &mut cursor)?;
    Ok(value)
}

fn rebuild<T: Clone>(
    schema: &Schema,
    tensors: &[T],
    cursor: &mut usize,
) -> Result<Value<T>, SchemaError> {
    match schema {
        Schema::TensorSlot => {
            let tensor = tensors
                .get(*cursor)
                .ok_or(SchemaError::SchemaMismatch {
                    expected: schema.tensor_count(),
                    actual: tensors.len(),
                })?
                .clone();
            *cursor += 1;
            Ok(Value::Tensor(tensor))
        }
        Schema::Seq(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(rebuild(item, tensors, cursor)?);
            }
            Ok(Value::Seq(out))
        }
        Schema::Map(entries) => {
            let mut out = std::collections::BTreeMap::new();
            for (key, item) in entries {
                out.insert(key.clone(), rebuild(item, tensors, cursor)?);
            }
            Ok(Value::Map(out))
        }
        Schema::Opaque(opaque) => Ok(Value::Opaque(opaque.clone())),
    }
}

/// Pre-validation pass rejecting leaves the schema cannot capture.
/// Used by the opt-in debug checks before structures reach the codec.
pub fn ensure_supported<T>(value: &Value<T>) -> Result<(), SchemaError> {
    match value {
        Value::Tensor(_) | Value::Opaque(_) => Ok(()),
        Value::Seq(items) => items.iter().try_for_each(ensure_supported),
        Value::Map(entries) => entries.values().try_for_each(ensure_supported),
        Value::Foreign(leaf) => Err(SchemaError::UnsupportedLeafType {
            type_name: leaf.type_name().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tensors are opaque to the codec, so unit tests get away with plain strings.
    type V = Value<&'static str>;

    #[test]
    fn roundtrip_preserves_structure_and_order() {
        let value: V = Value::seq(vec![
            Value::Tensor("a"),
            Value::map(vec![
                ("w".to_string(), Value::Tensor("b")),
                ("k".to_string(), Value::int(7)),
            ]),
            Value::none(),
        ]);

        let (tensors, schema) = flatten(&value).unwrap();
        // Map keys flatten in canonical sorted order: "k" before "w".
        assert_eq!(tensors, vec!["a", "b"]);
        assert_eq!(schema.tensor_count(), 2);

        let rebuilt = unflatten(&tensors, &schema).unwrap();
        assert_eq!(rebuilt, value);
    }

    #[test]
    fn flatten_is_order_stable() {
        let value: V = Value::map(vec![
            ("z".to_string(), Value::Tensor("late")),
            ("a".to_string(), Value::Tensor("early")),
        ]);
        let (first, _) = flatten(&value).unwrap();
        let (second, _) = flatten(&value).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, vec!["early", "late"]);
    }

    #[test]
    fn zero_tensor_structures_roundtrip() {
        let value: V = Value::map(vec![(
            "cfg".to_string(),
            Value::seq(vec![Value::str("adam"), Value::float(0.9)]),
        )]);
        let (tensors, schema) = flatten(&value).unwrap();
        assert!(tensors.is_empty());
        assert_eq!(unflatten(&tensors, &schema).unwrap(), value);
    }

    #[test]
    fn foreign_leaf_is_rejected() {
        let value: V = Value::seq(vec![Value::foreign(std::time::Duration::from_secs(1))]);
        let err = flatten(&value).unwrap_err();
        assert!(matches!(err, SchemaError::UnsupportedLeafType { .. }));
        assert!(err.to_string().contains("Duration"));
    }

    #[test]
    fn unflatten_rejects_wrong_tensor_count() {
        let value: V = Value::seq(vec![Value::Tensor("a"), Value::Tensor("b")]);
        let (tensors, schema) = flatten(&value).unwrap();
        let err = unflatten(&tensors[..1], &schema).unwrap_err();
        assert!(matches!(
            err,
            SchemaError::SchemaMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }
}
