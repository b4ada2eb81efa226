use std::collections::BTreeSet;
use std::path::Path;

use dvt_error::{DvResult, ErrorCode, err};
use serde::{Deserialize, Serialize};

/// One attribute of an entity. A non-empty `targets` list marks the field as
/// a reference (lookup) to rows of those entity types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
}

impl FieldDescriptor {
    pub fn attribute(name: impl Into<String>) -> Self {
        FieldDescriptor { name: name.into(), targets: Vec::new() }
    }

    pub fn lookup(name: impl Into<String>, targets: Vec<String>) -> Self {
        FieldDescriptor { name: name.into(), targets }
    }

    pub fn is_reference(&self) -> bool {
        !self.targets.is_empty()
    }

    /// Owner fields get special treatment (`--strip-owner-fields`,
    /// user mapping).
    pub fn is_owner(&self) -> bool {
        self.name == "ownerid" || self.targets.iter().any(|t| t == "systemuser" || t == "team")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDescriptor {
    pub logical_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

impl EntityDescriptor {
    pub fn new(logical_name: impl Into<String>) -> Self {
        EntityDescriptor {
            logical_name: logical_name.into(),
            primary_key: None,
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    /// The primary-key attribute, `<logical name>id` by convention.
    pub fn primary_key(&self) -> String {
        self.primary_key
            .clone()
            .unwrap_or_else(|| format!("{}id", self.logical_name))
    }

    pub fn reference_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.is_reference())
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A many-to-many relationship, processed in the dedicated final phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipDescriptor {
    /// Schema name used on associate/disassociate calls.
    pub name: String,
    pub entity1: String,
    pub entity2: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intersect_entity: Option<String>,
}

/// The schema the orchestrator plans a run against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDescriptor {
    pub entities: Vec<EntityDescriptor>,
    #[serde(default)]
    pub relationships: Vec<RelationshipDescriptor>,
    /// Entity whose rows are remapped through the user mapping file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_mapping_entity: Option<String>,
}

impl SchemaDescriptor {
    pub fn from_path(path: &Path) -> DvResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            dvt_error::dv_err!(
                ErrorCode::SchemaError,
                "cannot read schema file {}: {e}",
                path.display()
            )
        })?;
        let schema: SchemaDescriptor = serde_json::from_str(&raw).map_err(|e| {
            dvt_error::dv_err!(
                ErrorCode::SchemaError,
                "malformed schema file {}: {e}",
                path.display()
            )
        })?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn validate(&self) -> DvResult<()> {
        if self.entities.is_empty() {
            return err!(ErrorCode::SchemaError, "schema describes no entities");
        }
        let mut seen = BTreeSet::new();
        for entity in &self.entities {
            if !seen.insert(entity.logical_name.as_str()) {
                return err!(
                    ErrorCode::SchemaError,
                    "entity '{}' appears twice in the schema",
                    entity.logical_name
                );
            }
        }
        for relationship in &self.relationships {
            for side in [&relationship.entity1, &relationship.entity2] {
                if !seen.contains(side.as_str()) {
                    return err!(
                        ErrorCode::SchemaError,
                        "relationship '{}' references unknown entity '{}'",
                        relationship.name,
                        side
                    );
                }
            }
        }
        Ok(())
    }

    pub fn entity(&self, logical_name: &str) -> Option<&EntityDescriptor> {
        self.entities.iter().find(|e| e.logical_name == logical_name)
    }

    pub fn entity_names(&self) -> Vec<&str> {
        self.entities.iter().map(|e| e.logical_name.as_str()).collect()
    }

    pub fn contains(&self, logical_name: &str) -> bool {
        self.entity(logical_name).is_some()
    }
}
