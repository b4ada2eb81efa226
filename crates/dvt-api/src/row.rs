use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// The kind of write issued for a batch of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Upsert,
    Delete,
}

/// One row payload for a platform entity.
///
/// Attributes are kept as raw JSON values; reference fields hold the target
/// row id as a string, and the schema descriptor (not the payload) knows
/// which entity type a reference field points at.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Row {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Row::default()
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// True if any attribute holds `id` as its (string) value. Used by the
    /// executor when a dangling-reference message names an id but no field.
    pub fn references_id(&self, id: &str) -> Option<&str> {
        self.attributes.iter().find_map(|(name, value)| {
            value
                .as_str()
                .filter(|v| v.eq_ignore_ascii_case(id))
                .map(|_| name.as_str())
        })
    }
}

/// One page of query results from `retrieve_multiple`.
#[derive(Debug, Clone, Default)]
pub struct RowPage {
    pub rows: Vec<Row>,
    pub more_records: bool,
    pub paging_cookie: Option<String>,
}
