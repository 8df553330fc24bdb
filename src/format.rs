//! The flat wire format.
//!
//! Every dehydrated object becomes a [`FlatRecord`]:
//!
//! ```text
//! inline:      { "$type": "Point", "$value": { "x": 1, "y": 2 } }
//! reference:   { "$type": "Node",  "$ref": "n1" }
//! ```
//!
//! Records nest freely inside plain JSON: arrays stay arrays and objects without a `$type` key
//! stay keyed structures. [`Shape::classify`] decides once which of these a JSON node is, so
//! the hydrator dispatches with a single `match`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{RehydrateError, Result};

/// Key holding the registered type name.
pub const TYPE_KEY: &str = "$type";
/// Key holding the flattened properties of an inline record.
pub const VALUE_KEY: &str = "$value";
/// Key holding the identity of a referenced record.
pub const REF_KEY: &str = "$ref";

/// One typed, JSON-safe unit of a dehydrated graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatRecord {
    /// Registered name of the record's type.
    #[serde(rename = "$type")]
    pub type_name: String,
    /// Flattened properties, present on inline records.
    #[serde(rename = "$value", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
    /// Identity of the referenced record, present on placeholders.
    #[serde(rename = "$ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl FlatRecord {
    /// A record carrying its value inline.
    pub fn inline(type_name: impl Into<String>, value: JsonValue) -> Self {
        Self {
            type_name: type_name.into(),
            value: Some(value),
            reference: None,
        }
    }

    /// A placeholder pointing at an external record.
    pub fn placeholder(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            value: None,
            reference: Some(id.into()),
        }
    }

    /// Returns true if the record only points at another record.
    pub fn is_placeholder(&self) -> bool {
        self.value.is_none() && self.reference.is_some()
    }

    /// JSON form of the record.
    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::new();
        map.insert(TYPE_KEY.to_owned(), JsonValue::String(self.type_name.clone()));
        if let Some(value) = &self.value {
            map.insert(VALUE_KEY.to_owned(), value.clone());
        }
        if let Some(id) = &self.reference {
            map.insert(REF_KEY.to_owned(), JsonValue::String(id.clone()));
        }
        JsonValue::Object(map)
    }

    /// Reads a record back from its JSON form.
    ///
    /// # Errors
    /// [`RehydrateError::Format`] if `json` is not a typed record.
    pub fn from_json(json: &JsonValue) -> Result<Self> {
        match Shape::classify(json)? {
            Shape::Typed {
                type_name,
                value,
                reference,
            } => Ok(Self {
                type_name: type_name.to_owned(),
                value: Some(value.clone()),
                reference: reference.map(str::to_owned),
            }),
            Shape::Reference { type_name, id } => Ok(Self::placeholder(type_name, id)),
            _ => Err(RehydrateError::Format(format!(
                "expected a typed record, found {}",
                describe(json)
            ))),
        }
    }

    /// Borrowed shape of the record, as the hydrator consumes it.
    pub(crate) fn shape(&self) -> Result<Shape<'_>> {
        match (&self.value, &self.reference) {
            (Some(value), reference) => Ok(Shape::Typed {
                type_name: &self.type_name,
                value,
                reference: reference.as_deref(),
            }),
            (None, Some(id)) => Ok(Shape::Reference {
                type_name: &self.type_name,
                id,
            }),
            (None, None) => Err(missing_payload(&self.type_name)),
        }
    }
}

/// Classification of one JSON node.
#[derive(Debug, Clone, Copy)]
pub enum Shape<'a> {
    /// `null`, booleans, numbers and strings.
    Primitive(&'a JsonValue),
    /// Arrays.
    Sequence(&'a [JsonValue]),
    /// Objects that are not records.
    Keyed(&'a Map<String, JsonValue>),
    /// Records with an inline `$value`. A `$ref` next to it is kept but the value wins.
    Typed {
        /// Registered type name.
        type_name: &'a str,
        /// Flattened properties.
        value: &'a JsonValue,
        /// Identity recorded next to the value, if any.
        reference: Option<&'a str>,
    },
    /// Placeholders carrying only `$type` and `$ref`.
    Reference {
        /// Registered type name.
        type_name: &'a str,
        /// Identity of the external record.
        id: &'a str,
    },
}

impl<'a> Shape<'a> {
    /// Classifies `json`.
    ///
    /// An object is a record when it has a `$type` key and no keys other than `$type`,
    /// `$value` and `$ref`. Any other object is a keyed structure.
    ///
    /// # Errors
    /// [`RehydrateError::Format`] for records whose reserved keys have the wrong JSON type or
    /// that carry neither `$value` nor `$ref`.
    pub fn classify(json: &'a JsonValue) -> Result<Self> {
        let map = match json {
            JsonValue::Array(items) => return Ok(Self::Sequence(items)),
            JsonValue::Object(map) => map,
            other => return Ok(Self::Primitive(other)),
        };
        if !is_record(map) {
            return Ok(Self::Keyed(map));
        }

        let type_name = match map.get(TYPE_KEY) {
            Some(JsonValue::String(name)) => name.as_str(),
            Some(other) => {
                return Err(RehydrateError::Format(format!(
                    "`{TYPE_KEY}` must be a string, found {}",
                    describe(other)
                )));
            }
            None => return Ok(Self::Keyed(map)),
        };
        let reference = match map.get(REF_KEY) {
            Some(JsonValue::String(id)) => Some(id.as_str()),
            Some(other) => {
                return Err(RehydrateError::Format(format!(
                    "`{REF_KEY}` of `{type_name}` must be a string, found {}",
                    describe(other)
                )));
            }
            None => None,
        };

        match (map.get(VALUE_KEY), reference) {
            (Some(value), reference) => Ok(Self::Typed {
                type_name,
                value,
                reference,
            }),
            (None, Some(id)) => Ok(Self::Reference { type_name, id }),
            (None, None) => Err(missing_payload(type_name)),
        }
    }
}

/// Returns true if `map` would be read back as a record rather than a keyed structure.
pub fn is_record(map: &Map<String, JsonValue>) -> bool {
    map.contains_key(TYPE_KEY)
        && map
            .keys()
            .all(|k| k == TYPE_KEY || k == VALUE_KEY || k == REF_KEY)
}

fn missing_payload(type_name: &str) -> RehydrateError {
    RehydrateError::Format(format!(
        "record of `{type_name}` has neither `{VALUE_KEY}` nor `{REF_KEY}`"
    ))
}

fn describe(json: &JsonValue) -> &'static str {
    match json {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
