//! Update-or-insert merging of nested metadata documents

use serde_json::{Map, Value};

use crate::error::{DriverError, Result};

pub type Metadata = Map<String, Value>;

/// Merge `partial` into `target`.
///
/// Keys missing from `partial` are kept, nested objects are merged key by key,
/// and any other value in `partial` replaces what was there.
pub fn merge(target: &mut Metadata, partial: &Metadata) {
    for (key, incoming) in partial {
        if let Value::Object(nested) = incoming {
            if let Some(Value::Object(existing)) = target.get_mut(key) {
                merge(existing, nested);
                continue;
            }
        }
        target.insert(key.clone(), incoming.clone());
    }
}

/// Borrow `value` as a metadata object, rejecting scalars and arrays
pub fn as_metadata(value: &Value) -> Result<&Metadata> {
    value.as_object().ok_or_else(|| {
        DriverError::Validation(format!("metadata must be a JSON object, got {}", value))
    })
}
