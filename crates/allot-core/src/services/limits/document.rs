//! Per-user aggregate document
//!
//! One document per user holds every limit type as a top-level field. A
//! per-character limit type nests one level deeper, keyed by character id:
//!
//! ```text
//! { "userId": "u1",
//!   "photos":       { "count": 2, ... },
//!   "conversation": { "char-a": { "count": 7, ... }, "char-b": { ... } } }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::reset::check_and_reset_all;
use super::types::{EntitlementRecord, ResetPeriod};
use crate::error::Result;

/// Aggregate document for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsDocument {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// One entry per limit type
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl LimitsDocument {
    pub fn new(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            created_at: now,
            updated_at: now,
            fields: Map::new(),
        }
    }

    /// Raw value stored at `path`, if any
    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        let top = self.fields.get(path.field())?;
        match path {
            FieldPath::Flat(_) => Some(top),
            FieldPath::PerCharacter { character_id, .. } => top.get(character_id.as_str()),
        }
    }

    /// Serialize `record` into `path`, creating the character map if needed
    pub fn put(&mut self, path: &FieldPath, record: &EntitlementRecord) -> Result<()> {
        let value = serde_json::to_value(record)?;
        match path {
            FieldPath::Flat(field) => {
                self.fields.insert(field.clone(), value);
            }
            FieldPath::PerCharacter { field, character_id } => {
                let slot = self
                    .fields
                    .entry(field.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                if let Value::Object(characters) = slot {
                    characters.insert(character_id.clone(), value);
                }
            }
        }
        Ok(())
    }

    /// Remove a whole limit-type field. Returns `true` if it existed.
    pub fn remove_field(&mut self, field: &str) -> bool {
        self.fields.remove(field).is_some()
    }

    /// Decode every character record under a per-character field
    pub fn character_records(&self, field: &str) -> Vec<(String, EntitlementRecord)> {
        let Some(Value::Object(characters)) = self.fields.get(field) else {
            return Vec::new();
        };
        characters
            .iter()
            .filter_map(|(id, value)| {
                match serde_json::from_value::<EntitlementRecord>(value.clone()) {
                    Ok(record) => Some((id.clone(), record)),
                    Err(e) => {
                        log::warn!("[limits:document] Skipping undecodable record {}.{}: {}", field, id, e);
                        None
                    }
                }
            })
            .collect()
    }
}

/// Location of one record inside a [`LimitsDocument`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldPath {
    Flat(String),
    PerCharacter { field: String, character_id: String },
}

impl FieldPath {
    pub fn field(&self) -> &str {
        match self {
            FieldPath::Flat(field) | FieldPath::PerCharacter { field, .. } => field,
        }
    }

    pub fn character_id(&self) -> Option<&str> {
        match self {
            FieldPath::Flat(_) => None,
            FieldPath::PerCharacter { character_id, .. } => Some(character_id),
        }
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldPath::Flat(field) => write!(f, "{}", field),
            FieldPath::PerCharacter { field, character_id } => write!(f, "{}.{}", field, character_id),
        }
    }
}

/// A record loaded from a document, with whether it needs writing back
#[derive(Debug, Clone)]
pub struct LoadedRecord {
    pub record: EntitlementRecord,
    /// Created, migrated or rolled over during the load
    pub dirty: bool,
}

/// Load the record at `path`, or a fresh one, and bring it up to date:
/// legacy migration plus the reset pass.
///
/// Shared by the read path and every write path so both see identical state.
pub fn load_or_default(
    doc: Option<&LimitsDocument>,
    path: &FieldPath,
    period: ResetPeriod,
    now: DateTime<Utc>,
) -> Result<LoadedRecord> {
    let (mut record, mut dirty) = match doc.and_then(|d| d.get(path)) {
        Some(value) => (serde_json::from_value::<EntitlementRecord>(value.clone())?, false),
        None => (EntitlementRecord::default(), true),
    };

    dirty |= record.migrate_legacy_cards();
    dirty |= check_and_reset_all(&mut record, period, now);

    Ok(LoadedRecord { record, dirty })
}
