//! Record value type and field validation.
//!
//! Every record has the same shape: an id, a map of scalar attributes and a
//! `deleted` flag. Attributes are merged key by key on update, so a caller only
//! sends the attributes it wants to change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type RecordId = String;

/// Attribute that must be present (as a non-empty string) on every record.
pub const REQUIRED_FIELD: &str = "name";

/// A single attribute value. Nested values and `null` are not accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

/// Attribute map of a record. `BTreeMap` keeps listings and snapshots stable.
pub type FieldMap = BTreeMap<String, Scalar>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub fields: FieldMap,
    #[serde(default)]
    pub deleted: bool,
}

impl Record {
    pub fn active(id: impl Into<RecordId>, fields: FieldMap) -> Self {
        Self {
            id: id.into(),
            fields,
            deleted: false,
        }
    }

    pub fn tombstone(id: impl Into<RecordId>, fields: FieldMap) -> Self {
        Self {
            id: id.into(),
            fields,
            deleted: true,
        }
    }

    pub fn field(&self, key: &str) -> Option<&Scalar> {
        self.fields.get(key)
    }
}

/// Checks the attributes of a record about to be created.
pub fn validate_new(fields: &FieldMap) -> Result<()> {
    validate_keys(fields)?;
    match fields.get(REQUIRED_FIELD) {
        Some(value) => validate_required(value),
        None => Err(Error::malformed(format!(
            "missing required field '{REQUIRED_FIELD}'"
        ))),
    }
}

/// Checks a partial update. The required field may be omitted but not blanked.
pub fn validate_patch(fields: &FieldMap) -> Result<()> {
    validate_keys(fields)?;
    match fields.get(REQUIRED_FIELD) {
        Some(value) => validate_required(value),
        None => Ok(()),
    }
}

/// Overlays `patch` on `base`; keys absent from `patch` keep their prior value.
pub fn merge(base: &FieldMap, patch: FieldMap) -> FieldMap {
    let mut merged = base.clone();
    merged.extend(patch);
    merged
}

fn validate_keys(fields: &FieldMap) -> Result<()> {
    if fields.keys().any(|key| key.trim().is_empty()) {
        return Err(Error::malformed("field names must not be empty"));
    }
    Ok(())
}

fn validate_required(value: &Scalar) -> Result<()> {
    match value {
        Scalar::Text(text) if !text.trim().is_empty() => Ok(()),
        Scalar::Text(_) => Err(Error::malformed(format!(
            "field '{REQUIRED_FIELD}' must not be empty"
        ))),
        _ => Err(Error::malformed(format!(
            "field '{REQUIRED_FIELD}' must be a string"
        ))),
    }
}

/// Builds a field map from literal pairs. Handy in tests and demos.
pub fn fields<K, V, I>(pairs: I) -> FieldMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Scalar>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}
