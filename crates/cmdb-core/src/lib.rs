//! cmdb-core: Shared types, schema validation, configuration, and error handling for the CMDB.
//!
//! This crate provides the foundational pieces used by every CMDB component:
//! - Configuration items, CI type schemas, and relationships
//! - The tagged-union attribute value model
//! - The schema validator that checks attributes against a CI type
//! - Pagination descriptors shared by list operations
//! - Layered configuration loading
//! - The error taxonomy surfaced to callers

pub mod config;
pub mod error;
pub mod format;
pub mod pagination;
pub mod types;
pub mod validate;
pub mod value;

pub use error::{CmdbError, Result, ValidationError};
pub use pagination::{Page, PageRequest};
pub use types::{
    AttributeDefinition, AttributeType, AttributeValidation, CiId, CiTypeDefinition, CiTypeId,
    ConfigurationItem, Relationship, RelationshipId, RequestContext, UserId,
};
pub use value::{AttrValue, Attributes};
