//! Storage traits and the records they return.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use patientmap_core::{
    Attributes, NodeKey, NodeKind, NodeSpec, RelationshipKey, RelationshipKind, RelationshipSpec,
};

use crate::client::GraphError;

/// Whether an upsert created a new entity or merged into an existing one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// A stored node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub kind: NodeKind,
    pub id: String,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn key(&self) -> NodeKey {
        NodeKey::new(self.kind, self.id.clone())
    }

    /// A string attribute, if present.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(|v| v.as_str())
    }

    /// The human-readable name of this entity (`name`, `label` or `title`).
    pub fn display_name(&self) -> Option<&str> {
        self.text(self.kind.display_attribute())
    }
}

/// A stored relationship.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeRecord {
    pub kind: RelationshipKind,
    pub from_id: String,
    pub to_id: String,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EdgeRecord {
    pub fn key(&self) -> RelationshipKey {
        RelationshipKey::new(self.kind, self.from_id.clone(), self.to_id.clone())
    }
}

/// Read-only projection of one patient's entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityOverview {
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub conditions: Vec<NodeRecord>,
    pub medications: Vec<NodeRecord>,
    /// Distinct articles that study any of the patient's conditions.
    pub research_article_count: usize,
}

/// Store-wide entity counts. Only non-zero kinds are listed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphSummary {
    pub nodes_by_type: BTreeMap<NodeKind, usize>,
    pub edges_by_type: BTreeMap<RelationshipKind, usize>,
}

impl GraphSummary {
    pub fn total_nodes(&self) -> usize {
        self.nodes_by_type.values().sum()
    }

    pub fn total_edges(&self) -> usize {
        self.edges_by_type.values().sum()
    }

    pub fn nodes(&self, kind: NodeKind) -> usize {
        self.nodes_by_type.get(&kind).copied().unwrap_or(0)
    }

    pub fn edges(&self, kind: RelationshipKind) -> usize {
        self.edges_by_type.get(&kind).copied().unwrap_or(0)
    }
}

/// A patient's neighbourhood: the patient, its conditions and medications,
/// the articles linked to them, and the connecting edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subgraph {
    pub nodes: Vec<NodeRecord>,
    pub edges: Vec<EdgeRecord>,
}

/// One row of [`GraphReader::list_patients`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientListing {
    pub id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub condition_count: usize,
    pub medication_count: usize,
}

/// An article studying a condition, with the link's evidence attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedArticle {
    pub article: NodeRecord,
    pub relevance: Option<String>,
    pub confidence: Option<f64>,
}

/// Confidence assumed for ranking when a link carries none.
pub const DEFAULT_RANKING_CONFIDENCE: f64 = 0.5;

/// Read primitives over the knowledge graph.
#[async_trait]
pub trait GraphReader: Send + Sync {
    async fn get_node(&self, kind: NodeKind, id: &str) -> Result<Option<NodeRecord>, GraphError>;

    async fn get_relationship(
        &self,
        key: &RelationshipKey,
    ) -> Result<Option<EdgeRecord>, GraphError>;

    /// Fails with [`GraphError::NotFound`] when the patient does not exist.
    async fn get_entity_overview(&self, patient_id: &str) -> Result<EntityOverview, GraphError>;

    async fn export_summary(&self) -> Result<GraphSummary, GraphError>;

    /// Fails with [`GraphError::NotFound`] when the patient does not exist.
    async fn patient_subgraph(&self, patient_id: &str) -> Result<Subgraph, GraphError>;

    /// Conditions and medications without an owning patient, and articles
    /// that study no condition.
    async fn find_orphans(&self) -> Result<Vec<NodeKey>, GraphError>;

    /// All patients, newest first.
    async fn list_patients(&self) -> Result<Vec<PatientListing>, GraphError>;

    /// Articles studying a condition, highest confidence first.
    async fn find_related_research(
        &self,
        condition_id: &str,
        limit: usize,
    ) -> Result<Vec<RelatedArticle>, GraphError>;
}

/// Write primitives. Every write merges by identity.
#[async_trait]
pub trait GraphWriter: GraphReader {
    /// Create the node, or merge the supplied attributes into the existing one.
    async fn upsert_node(&self, spec: &NodeSpec) -> Result<UpsertOutcome, GraphError>;

    /// Create or merge a relationship. Both endpoints must already exist.
    async fn upsert_relationship(
        &self,
        spec: &RelationshipSpec,
    ) -> Result<UpsertOutcome, GraphError>;

    /// Remove a node and its relationships. Administrative only.
    async fn delete_node(&self, kind: NodeKind, id: &str) -> Result<bool, GraphError>;
}

/// A store handle restricted to reads.
///
/// Writes through this handle fail with [`GraphError::CapabilityViolation`].
pub struct ReadOnlyGraph<S: ?Sized> {
    inner: Arc<S>,
}

impl<S: ?Sized> ReadOnlyGraph<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self { inner }
    }
}

impl<S: ?Sized> Clone for ReadOnlyGraph<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl<S: GraphReader + ?Sized> GraphReader for ReadOnlyGraph<S> {
    async fn get_node(&self, kind: NodeKind, id: &str) -> Result<Option<NodeRecord>, GraphError> {
        self.inner.get_node(kind, id).await
    }

    async fn get_relationship(
        &self,
        key: &RelationshipKey,
    ) -> Result<Option<EdgeRecord>, GraphError> {
        self.inner.get_relationship(key).await
    }

    async fn get_entity_overview(&self, patient_id: &str) -> Result<EntityOverview, GraphError> {
        self.inner.get_entity_overview(patient_id).await
    }

    async fn export_summary(&self) -> Result<GraphSummary, GraphError> {
        self.inner.export_summary().await
    }

    async fn patient_subgraph(&self, patient_id: &str) -> Result<Subgraph, GraphError> {
        self.inner.patient_subgraph(patient_id).await
    }

    async fn find_orphans(&self) -> Result<Vec<NodeKey>, GraphError> {
        self.inner.find_orphans().await
    }

    async fn list_patients(&self) -> Result<Vec<PatientListing>, GraphError> {
        self.inner.list_patients().await
    }

    async fn find_related_research(
        &self,
        condition_id: &str,
        limit: usize,
    ) -> Result<Vec<RelatedArticle>, GraphError> {
        self.inner.find_related_research(condition_id, limit).await
    }
}

#[async_trait]
impl<S: GraphReader + ?Sized> GraphWriter for ReadOnlyGraph<S> {
    async fn upsert_node(&self, spec: &NodeSpec) -> Result<UpsertOutcome, GraphError> {
        tracing::error!(node = %spec.key(), "Write refused through read-only graph handle");
        Err(GraphError::CapabilityViolation {
            operation: "upsert_node",
        })
    }

    async fn upsert_relationship(
        &self,
        spec: &RelationshipSpec,
    ) -> Result<UpsertOutcome, GraphError> {
        tracing::error!(
            relationship = %spec.key(),
            "Write refused through read-only graph handle"
        );
        Err(GraphError::CapabilityViolation {
            operation: "upsert_relationship",
        })
    }

    async fn delete_node(&self, kind: NodeKind, id: &str) -> Result<bool, GraphError> {
        tracing::error!(%kind, id, "Write refused through read-only graph handle");
        Err(GraphError::CapabilityViolation {
            operation: "delete_node",
        })
    }
}
