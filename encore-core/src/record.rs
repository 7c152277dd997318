//! Backend record shapes.
//!
//! The backend is an opaque record store: every record lives on a named
//! layout, has an id, and carries a flat map of field values. The gateway
//! never interprets field semantics beyond the few numeric helpers below.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::RecordId;

/// Flat field-name → value map as stored by the backend.
pub type FieldMap = serde_json::Map<String, Value>;

/// A record returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub record_id: RecordId,
    /// Modification counter, when the backend reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mod_id: Option<String>,
    pub fields: FieldMap,
}

impl Record {
    pub fn new(record_id: RecordId, fields: FieldMap) -> Self {
        Self {
            record_id,
            mod_id: None,
            fields,
        }
    }

    /// Read a field as a number.
    ///
    /// The backend returns numbers either as JSON numbers or as strings
    /// (empty string for an unset field); both are accepted.
    pub fn number(&self, field: &str) -> Option<f64> {
        number_field(&self.fields, field)
    }

    /// Read a field as a non-empty string.
    pub fn text(&self, field: &str) -> Option<&str> {
        match self.fields.get(field) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Lenient numeric read used for backend field maps.
pub fn number_field(fields: &FieldMap, field: &str) -> Option<f64> {
    match fields.get(field)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

/// Sort direction for find requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    #[serde(rename = "ascend")]
    Ascending,
    #[serde(rename = "descend")]
    Descending,
}

/// One sort key for a find request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// Paging and ordering options for `find`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FindOptions {
    pub limit: Option<u32>,
    /// One-based offset, as the backend expects.
    pub offset: Option<u32>,
    pub sort: Vec<SortSpec>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort.push(sort);
        self
    }
}
