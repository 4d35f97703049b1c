//! Schema codec: lossless conversion between nested argument structures and
//! flat ordered tensor lists.

mod codec;
mod value;

pub use codec::{ensure_supported, flatten, unflatten, Schema, SchemaError};
pub use value::{ForeignLeaf, OpaqueValue, Value};
