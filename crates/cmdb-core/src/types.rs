//! Core domain types for the CMDB.
//!
//! These types are shared by the primary store, the graph index mirror,
//! the cache, and the orchestrator.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Attributes;

// ── Identifiers ───────────────────────────────────────────────────

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a configuration item.
    CiId
);
uuid_id!(
    /// Unique identifier for a CI type definition.
    CiTypeId
);
uuid_id!(
    /// Unique identifier for a relationship.
    RelationshipId
);
uuid_id!(
    /// Identifier of an authenticated principal.
    UserId
);

// ── Request Context ───────────────────────────────────────────────

/// Who is performing an operation, as established by the auth layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestContext {
    pub actor: UserId,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub user_agent: String,
}

impl RequestContext {
    pub fn new(actor: UserId) -> Self {
        Self {
            actor,
            ip_address: String::new(),
            user_agent: String::new(),
        }
    }

    pub fn with_client(mut self, ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.ip_address = ip_address.into();
        self.user_agent = user_agent.into();
        self
    }
}

// ── CI Type Schema ────────────────────────────────────────────────

/// Declared type of an attribute.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    String,
    Integer,
    Boolean,
    Array,
    Object,
}

/// Syntactic format checks applicable to string attributes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttributeFormat {
    Email,
    Url,
    Ipv4,
    Date,
    Datetime,
}

/// Optional constraints on an attribute value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttributeValidation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// String length, or element count for arrays and objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<AttributeFormat>,
}

/// One attribute of a CI type schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttributeDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<AttributeValidation>,
}

impl AttributeDefinition {
    pub fn new(name: impl Into<String>, attr_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            attr_type,
            description: String::new(),
            validation: None,
        }
    }

    pub fn with_validation(mut self, validation: AttributeValidation) -> Self {
        self.validation = Some(validation);
        self
    }
}

/// A named schema that CIs of that type must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CiTypeDefinition {
    pub id: CiTypeId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required_attributes: Vec<AttributeDefinition>,
    #[serde(default)]
    pub optional_attributes: Vec<AttributeDefinition>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CiTypeDefinition {
    /// Look up an attribute by name in either list.
    pub fn attribute(&self, name: &str) -> Option<&AttributeDefinition> {
        self.required_attributes
            .iter()
            .chain(self.optional_attributes.iter())
            .find(|a| a.name == name)
    }
}

// ── Configuration Items ───────────────────────────────────────────

/// A tracked asset with typed attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigurationItem {
    pub id: CiId,
    pub name: String,
    pub ci_type: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<UserId>,
    pub updated_at: DateTime<Utc>,
}

/// A typed, directed edge between two CIs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relationship {
    pub id: RelationshipId,
    pub source_id: CiId,
    pub target_id: CiId,
    pub relationship_type: String,
    #[serde(default)]
    pub attributes: Attributes,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

// ── Requests ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCiRequest {
    pub name: String,
    pub ci_type: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Patch for a CI. A present `attributes` map replaces the current one wholesale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCiRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCiTypeRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required_attributes: Vec<AttributeDefinition>,
    #[serde(default)]
    pub optional_attributes: Vec<AttributeDefinition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCiTypeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_attributes: Option<Vec<AttributeDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional_attributes: Option<Vec<AttributeDefinition>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRelationshipRequest {
    pub source_id: CiId,
    pub target_id: CiId,
    pub relationship_type: String,
    #[serde(default)]
    pub attributes: Attributes,
}

/// Relationship type is immutable; only attributes can change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRelationshipRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
}

// ── List Filters ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CiSortField {
    Name,
    CiType,
    #[default]
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CiFilter {
    #[serde(default)]
    pub ci_type: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    /// Matches CIs carrying any of these tags.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created_by: Option<UserId>,
    #[serde(default)]
    pub sort: CiSortField,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipSortField {
    #[default]
    CreatedAt,
    RelationshipType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationshipFilter {
    #[serde(default)]
    pub source_id: Option<CiId>,
    #[serde(default)]
    pub target_id: Option<CiId>,
    #[serde(default)]
    pub relationship_type: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub sort: RelationshipSortField,
    #[serde(default)]
    pub order: SortOrder,
}

// ── Dashboard ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DashboardStats {
    pub total_cis: u64,
    pub total_ci_types: u64,
    pub total_relationships: u64,
    pub total_users: u64,
}

/// Normalize a tag list into a sorted, de-duplicated set without blanks.
pub fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_definition_uses_wire_names() {
        let json = r#"{
            "name": "hostname",
            "type": "string",
            "validation": {"min_length": 1, "max_length": 255, "enum": ["a"], "format": "ipv4"}
        }"#;
        let def: AttributeDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.attr_type, AttributeType::String);
        let v = def.validation.unwrap();
        assert_eq!(v.min_length, Some(1));
        assert_eq!(v.allowed, vec!["a".to_string()]);
        assert_eq!(v.format, Some(AttributeFormat::Ipv4));
    }

    #[test]
    fn ids_serialize_as_bare_uuids() {
        let id = CiId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
        let parsed: CiId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn tags_are_normalized() {
        let tags = normalize_tags(["prod", " web ", "prod", ""]);
        assert_eq!(tags.into_iter().collect::<Vec<_>>(), vec!["prod", "web"]);
    }

    #[test]
    fn update_request_distinguishes_absent_from_empty() {
        let absent: UpdateCiRequest = serde_json::from_str("{}").unwrap();
        assert!(absent.attributes.is_none());
        let empty: UpdateCiRequest = serde_json::from_str(r#"{"attributes": {}}"#).unwrap();
        assert_eq!(empty.attributes.map(|a| a.len()), Some(0));
    }
}
