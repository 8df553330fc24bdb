//! Runtime utilities for generated code (Macros).
//! Do not use directly.

use crate::error::{RehydrateError, Result};
use crate::registry::Serializable;
use crate::value::{Fields, FromValue, Handle, ToValue, Value};

/// Stores `value` under `name`.
pub fn insert<T: ToValue + ?Sized>(fields: &mut Fields, name: &str, value: &T) {
    fields.insert(name.to_owned(), value.to_value());
}

/// Reads the property `name` of a `type_name` record.
///
/// Absent properties fall back to [`FromValue::missing`]; anything else is a construction
/// error naming the property.
pub fn field<T: FromValue>(fields: &Fields, type_name: &str, name: &str) -> Result<T> {
    match fields.get(name) {
        Some(value) => convert(value, type_name, name),
        None => T::missing().ok_or_else(|| {
            RehydrateError::construction(type_name, format!("missing property `{name}`"))
        }),
    }
}

/// Overwrites `target` with the property `name`, if present.
pub fn assign<T: FromValue>(
    target: &mut T,
    fields: &Fields,
    type_name: &str,
    name: &str,
) -> Result<()> {
    if let Some(value) = fields.get(name) {
        *target = convert(value, type_name, name)?;
    }
    Ok(())
}

fn convert<T: FromValue>(value: &Value, type_name: &str, name: &str) -> Result<T> {
    T::from_value(value.clone()).map_err(|err| {
        RehydrateError::construction(type_name, format!("property `{name}`: {err}"))
    })
}

/// By-value conversion of a registered type: the instance is copied into a fresh cell.
pub fn object_to_value<T: Serializable + Clone>(value: &T) -> Value {
    Value::object(value.clone())
}

/// By-value conversion back: the instance is copied out of its cell.
pub fn object_from_value<T: Serializable + Clone>(value: Value) -> Result<T> {
    Handle::<T>::from_value(value)?.cloned()
}
