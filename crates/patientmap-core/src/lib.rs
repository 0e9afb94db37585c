//! patientmap-core: Shared types, configuration, and error handling for the PatientMap
//! knowledge graph.
//!
//! This crate provides the foundational types used across all PatientMap components:
//! - Node kinds (Patient, Condition, Medication, ...) and relationship kinds
//! - Node and relationship tuples exchanged with upstream producers
//! - Closed attribute schemas per kind, with validation and normalization
//! - Configuration management
//! - Common error types

pub mod config;
pub mod error;
pub mod schema;
pub mod types;

pub use config::{BuildConfig, Neo4jSettings, PatientMapConfig};
pub use error::PatientMapError;
pub use schema::SchemaError;
pub use types::{
    Attributes, ClinicalTrial, Condition, Medication, MedicationEvidenceLink, NodeKey, NodeKind,
    NodeSpec, Patient, RelationshipKey, RelationshipKind, RelationshipSpec, Relevance,
    ResearchArticle, StudiesLink,
};
