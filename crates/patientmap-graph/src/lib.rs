//! PatientMap Graph: storage for the patient-centric knowledge graph.
//!
//! All graph reads and writes go through the [`GraphReader`] and
//! [`GraphWriter`] traits. Two backends implement them:
//! - [`InMemoryGraphStore`]: sharded concurrent maps, used by tests and
//!   short-lived workflows
//! - [`GraphClient`]: Neo4j, with uniqueness constraints installed by
//!   [`initialize_schema`]
//!
//! Components that must only read (validation, analysis) hold a
//! [`ReadOnlyGraph`], which refuses every write.

pub mod client;
pub mod memory;
pub mod mutations;
pub mod queries;
pub mod schema;
pub mod store;

pub use client::{GraphClient, GraphConfig, GraphError};
pub use memory::InMemoryGraphStore;
pub use schema::initialize_schema;
pub use store::{
    EdgeRecord, EntityOverview, GraphReader, GraphSummary, GraphWriter, NodeRecord,
    PatientListing, ReadOnlyGraph, RelatedArticle, Subgraph, UpsertOutcome,
};
