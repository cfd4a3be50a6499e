//! Records (documents) and record selectors.
//!
//! A [`Record`] pairs an optional identity with an ordered field mapping. The
//! identity is carried out-of-band: equality and serialization only look at the
//! fields, so a record read back from storage compares equal to the fields that
//! were written.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Storage-assigned record identifier. Never changes once assigned.
pub type RecordId = u64;

/// Ordered mapping from field name to value.
pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    #[serde(skip)]
    id: Option<RecordId>,
    fields: Fields,
}

impl Record {
    /// A new, uncommitted document.
    pub fn new(fields: Fields) -> Self {
        Self { id: None, fields }
    }

    pub fn with_id(id: RecordId, fields: Fields) -> Self {
        Self {
            id: Some(id),
            fields,
        }
    }

    pub fn id(&self) -> Option<RecordId> {
        self.id
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn into_fields(self) -> Fields {
        self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// True if every `(field, value)` pair in `keys` matches (or any, with `match_any`).
    pub fn matches(&self, keys: &Fields, match_any: bool) -> bool {
        let mut checks = keys.iter().map(|(k, v)| self.fields.get(k) == Some(v));
        if match_any {
            checks.any(|hit| hit)
        } else {
            checks.all(|hit| hit)
        }
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.fields) {
            Ok(text) => f.write_str(&text),
            Err(_) => f.write_str("{}"),
        }
    }
}

/// Selects the records an operation applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum Keys {
    /// Every record in the table.
    All,
    ById(RecordId),
    ByIds(Vec<RecordId>),
    /// Field equalities, AND-ed or OR-ed according to `match_any`.
    ByFields(Fields),
}

impl Keys {
    pub fn by_field<V: Into<Value>>(field: &str, value: V) -> Self {
        let mut fields = Fields::new();
        fields.insert(field.to_string(), value.into());
        Keys::ByFields(fields)
    }

    pub fn selects(&self, record_id: RecordId, record: &Record, match_any: bool) -> bool {
        match self {
            Keys::All => true,
            Keys::ById(id) => *id == record_id,
            Keys::ByIds(ids) => ids.contains(&record_id),
            // An empty mapping selects everything, like `All`.
            Keys::ByFields(fields) if fields.is_empty() => true,
            Keys::ByFields(fields) => record.matches(fields, match_any),
        }
    }
}

impl From<RecordId> for Keys {
    fn from(id: RecordId) -> Self {
        Keys::ById(id)
    }
}

impl From<Vec<RecordId>> for Keys {
    fn from(ids: Vec<RecordId>) -> Self {
        Keys::ByIds(ids)
    }
}

impl From<Fields> for Keys {
    fn from(fields: Fields) -> Self {
        Keys::ByFields(fields)
    }
}

/// Build a [`Fields`] map from a `serde_json::json!` object literal.
///
/// Non-object values produce an empty map.
pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}
