//! Core domain model for FounderCap change tracking: typed field values, the
//! company schema, normalized source records, snapshots and patches.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub mod diff;

pub use diff::{diff, values_equal};

pub const CRATE_NAME: &str = "fcap-core";

/// Stable identifier of a tracked company.
pub type EntityId = String;

/// Identifier of an external data provider (`crunchbase`, `linkedin`, ...).
pub type SourceId = String;

/// Flat field name -> typed value mapping. A missing key and a `null` are the
/// same thing, so nulls are never stored.
pub type FieldMap = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Enum,
    StringList,
    DateTime,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Enum => "enum",
            FieldKind::StringList => "string_list",
            FieldKind::DateTime => "datetime",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    String(String),
    Number(f64),
    Enum(String),
    StringList(Vec<String>),
    DateTime(DateTime<Utc>),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::String(_) => FieldKind::String,
            FieldValue::Number(_) => FieldKind::Number,
            FieldValue::Enum(_) => FieldKind::Enum,
            FieldValue::StringList(_) => FieldKind::StringList,
            FieldValue::DateTime(_) => FieldKind::DateTime,
        }
    }

    /// Plain JSON rendering used by sinks. Integral numbers render as integers
    /// so `1000000.0` goes out as `1000000`.
    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::String(s) | FieldValue::Enum(s) => JsonValue::String(s.clone()),
            FieldValue::Number(n) => number_to_json(*n),
            FieldValue::StringList(items) => {
                JsonValue::Array(items.iter().cloned().map(JsonValue::String).collect())
            }
            FieldValue::DateTime(ts) => JsonValue::String(ts.to_rfc3339()),
        }
    }
}

fn number_to_json(n: f64) -> JsonValue {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        JsonValue::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

/// Renders a whole field map as a JSON object of plain values.
pub fn fields_to_json(fields: &FieldMap) -> JsonValue {
    JsonValue::Object(
        fields
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect(),
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaViolation {
    #[error("field `{field}` is not part of the schema")]
    UnknownField { field: String },
    #[error("field `{field}` expected {expected}, got {actual}")]
    KindMismatch {
        field: String,
        expected: FieldKind,
        actual: String,
    },
    #[error("field `{field}` has unparseable value: {reason}")]
    Unparseable { field: String, reason: String },
    #[error("record must be a JSON object")]
    NotAnObject,
}

/// Fixed field set every source adapter must conform to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: BTreeMap<String, FieldKind>,
}

impl Schema {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, FieldKind)>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// The schema shared by all startup sources.
    pub fn company() -> Self {
        Self::new([
            ("name", FieldKind::String),
            ("domain", FieldKind::String),
            ("description", FieldKind::String),
            ("website", FieldKind::String),
            ("linkedin_url", FieldKind::String),
            ("crunchbase_url", FieldKind::String),
            ("industry", FieldKind::String),
            ("location_city", FieldKind::String),
            ("location_region", FieldKind::String),
            ("location_country", FieldKind::String),
            ("founded_year", FieldKind::Number),
            ("employee_count", FieldKind::Number),
            ("total_funding", FieldKind::Number),
            ("funding_stage", FieldKind::Enum),
            ("operating_status", FieldKind::Enum),
            ("investors", FieldKind::StringList),
            ("tags", FieldKind::StringList),
            ("last_funding_date", FieldKind::DateTime),
        ])
    }

    pub fn kind_of(&self, field: &str) -> Option<FieldKind> {
        self.fields.get(field).copied()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn validate(&self, fields: &FieldMap) -> Result<(), SchemaViolation> {
        for (name, value) in fields {
            let expected = self
                .kind_of(name)
                .ok_or_else(|| SchemaViolation::UnknownField { field: name.clone() })?;
            if value.kind() != expected {
                return Err(SchemaViolation::KindMismatch {
                    field: name.clone(),
                    expected,
                    actual: value.kind().to_string(),
                });
            }
            if let FieldValue::Number(n) = value {
                if !n.is_finite() {
                    return Err(non_finite(name, n));
                }
            }
        }
        Ok(())
    }

    /// Builds a typed field map from a loosely typed JSON object. `null`
    /// values drop the key.
    pub fn coerce_json(&self, value: &JsonValue) -> Result<FieldMap, SchemaViolation> {
        let object = value.as_object().ok_or(SchemaViolation::NotAnObject)?;
        let mut out = FieldMap::new();
        for (name, raw) in object {
            let kind = self
                .kind_of(name)
                .ok_or_else(|| SchemaViolation::UnknownField { field: name.clone() })?;
            if let Some(value) = coerce_value(name, kind, raw)? {
                out.insert(name.clone(), value);
            }
        }
        Ok(out)
    }
}

/// Converts one JSON value into the given kind.
pub fn coerce_value(
    field: &str,
    kind: FieldKind,
    raw: &JsonValue,
) -> Result<Option<FieldValue>, SchemaViolation> {
    if raw.is_null() {
        return Ok(None);
    }
    let mismatch = || SchemaViolation::KindMismatch {
        field: field.to_string(),
        expected: kind,
        actual: json_kind_name(raw).to_string(),
    };

    let value = match kind {
        FieldKind::String => FieldValue::String(raw.as_str().ok_or_else(mismatch)?.to_string()),
        FieldKind::Enum => FieldValue::Enum(raw.as_str().ok_or_else(mismatch)?.to_string()),
        FieldKind::Number => match raw {
            JsonValue::Number(n) => FieldValue::Number(n.as_f64().ok_or_else(mismatch)?),
            JsonValue::String(s) => {
                let cleaned = s.trim().replace(',', "");
                let parsed = cleaned.parse::<f64>().map_err(|e| SchemaViolation::Unparseable {
                    field: field.to_string(),
                    reason: format!("{s:?}: {e}"),
                })?;
                if !parsed.is_finite() {
                    return Err(non_finite(field, s));
                }
                FieldValue::Number(parsed)
            }
            _ => return Err(mismatch()),
        },
        FieldKind::StringList => {
            let items = raw.as_array().ok_or_else(mismatch)?;
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                list.push(item.as_str().ok_or_else(mismatch)?.to_string());
            }
            FieldValue::StringList(list)
        }
        FieldKind::DateTime => {
            let text = raw.as_str().ok_or_else(mismatch)?;
            FieldValue::DateTime(parse_datetime(text).ok_or_else(|| {
                SchemaViolation::Unparseable {
                    field: field.to_string(),
                    reason: format!("{text:?} is neither RFC 3339 nor YYYY-MM-DD"),
                }
            })?)
        }
    };
    Ok(Some(value))
}

// NaN never equals itself and serializes as `null`, so it cannot be stored.
fn non_finite(field: &str, value: impl std::fmt::Debug) -> SchemaViolation {
    SchemaViolation::Unparseable {
        field: field.to_string(),
        reason: format!("{value:?} is not a finite number"),
    }
}

pub fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn json_kind_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// One source's view of one entity, produced fresh each run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub entity_id: EntityId,
    pub source_id: SourceId,
    pub fetched_at: DateTime<Utc>,
    pub fields: FieldMap,
}

/// Merged, current state of a tracked company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub fields: FieldMap,
    #[serde(default)]
    pub last_checked: BTreeMap<SourceId, DateTime<Utc>>,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            fields: FieldMap::new(),
            last_checked: BTreeMap::new(),
        }
    }

    /// Overlays a record on top of the current fields. Later calls win for
    /// fields present in both.
    pub fn merge_record(&mut self, record: &NormalizedRecord) {
        for (name, value) in &record.fields {
            self.fields.insert(name.clone(), value.clone());
        }
        self.last_checked
            .insert(record.source_id.clone(), record.fetched_at);
    }
}

/// Immutable, timestamped full state of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub entity_id: EntityId,
    pub taken_at: DateTime<Utc>,
    pub fields: FieldMap,
    #[serde(default)]
    pub last_checked: BTreeMap<SourceId, DateTime<Utc>>,
    pub content_hash: String,
}

impl Snapshot {
    pub fn capture(entity: &Entity, taken_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: entity.id.clone(),
            taken_at,
            fields: entity.fields.clone(),
            last_checked: entity.last_checked.clone(),
            content_hash: content_hash(&entity.fields),
        }
    }

    pub fn to_entity(&self) -> Entity {
        Entity {
            id: self.entity_id.clone(),
            fields: self.fields.clone(),
            last_checked: self.last_checked.clone(),
        }
    }
}

/// SHA-256 over the canonical (key-ordered) JSON of a field map.
pub fn content_hash(fields: &FieldMap) -> String {
    let bytes = serde_json::to_vec(fields).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Option<FieldValue>,
    pub new: Option<FieldValue>,
}

impl FieldChange {
    pub fn is_addition(&self) -> bool {
        self.old.is_none() && self.new.is_some()
    }

    pub fn is_removal(&self) -> bool {
        self.old.is_some() && self.new.is_none()
    }
}

/// Field-level difference between two states. A field absent from the patch
/// is unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch {
    changes: BTreeMap<String, FieldChange>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, field: impl Into<String>, old: Option<FieldValue>, new: Option<FieldValue>) {
        self.changes.insert(field.into(), FieldChange { old, new });
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn get(&self, field: &str) -> Option<&FieldChange> {
        self.changes.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldChange)> {
        self.changes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// New values of the changed fields only; removed fields map to `None`.
    pub fn partial_update(&self) -> BTreeMap<String, Option<FieldValue>> {
        self.changes
            .iter()
            .map(|(field, change)| (field.clone(), change.new.clone()))
            .collect()
    }

    /// `{"field": [old, new]}` with plain JSON values.
    pub fn to_json(&self) -> JsonValue {
        let render = |v: &Option<FieldValue>| v.as_ref().map(FieldValue::to_json).unwrap_or(JsonValue::Null);
        JsonValue::Object(
            self.changes
                .iter()
                .map(|(field, change)| {
                    (
                        field.clone(),
                        JsonValue::Array(vec![render(&change.old), render(&change.new)]),
                    )
                })
                .collect(),
        )
    }
}
