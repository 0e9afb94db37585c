//! In-memory graph store backed by sharded concurrent maps.
//!
//! Nodes are keyed by `(kind, id)` and relationships by `(kind, from, to)`.
//! The per-key entry lock of the map is the uniqueness constraint, so
//! concurrent upserts for different patients never contend on a global lock.
//! A relationship upsert holds shared guards on both endpoint nodes while it
//! claims ownership and writes the edge. Locks are only ever taken in the
//! order nodes, owners, edges, and no node lock is requested while an owner
//! or edge guard is held.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use patientmap_core::schema::{default_relevance, normalize_node, normalize_relationship};
use patientmap_core::{
    Attributes, NodeKey, NodeKind, NodeSpec, RelationshipKey, RelationshipKind, RelationshipSpec,
};

use crate::client::GraphError;
use crate::store::{
    EdgeRecord, EntityOverview, GraphReader, GraphSummary, GraphWriter, NodeRecord,
    PatientListing, RelatedArticle, Subgraph, UpsertOutcome, DEFAULT_RANKING_CONFIDENCE,
};

/// Concurrent in-memory implementation of [`GraphReader`] and [`GraphWriter`].
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    nodes: DashMap<NodeKey, NodeRecord>,
    edges: DashMap<RelationshipKey, EdgeRecord>,
    /// condition id -> owning patient id
    owners: DashMap<String, String>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, kind: NodeKind, id: &str) -> Option<NodeRecord> {
        self.nodes
            .get(&NodeKey::new(kind, id))
            .map(|r| r.value().clone())
    }

    /// Edges matching a predicate, cloned out so no shard lock outlives the scan.
    fn edges_where(&self, pred: impl Fn(&EdgeRecord) -> bool) -> Vec<EdgeRecord> {
        self.edges
            .iter()
            .filter(|r| pred(r.value()))
            .map(|r| r.value().clone())
            .collect()
    }

    fn nodes_for(&self, kind: NodeKind, ids: impl IntoIterator<Item = String>) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> = ids
            .into_iter()
            .filter_map(|id| self.node(kind, &id))
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    fn require_patient(&self, patient_id: &str) -> Result<NodeRecord, GraphError> {
        self.node(NodeKind::Patient, patient_id)
            .ok_or_else(|| GraphError::NotFound {
                kind: NodeKind::Patient,
                id: patient_id.to_string(),
            })
    }

    fn claim_condition(&self, spec: &RelationshipSpec) -> Result<(), GraphError> {
        match self.owners.entry(spec.to_id.clone()) {
            Entry::Occupied(entry) if entry.get() != &spec.from_id => {
                Err(GraphError::OwnershipConflict {
                    condition_id: spec.to_id.clone(),
                    owner: entry.get().clone(),
                })
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(entry) => {
                entry.insert(spec.from_id.clone());
                Ok(())
            }
        }
    }
}

#[async_trait]
impl GraphReader for InMemoryGraphStore {
    async fn get_node(&self, kind: NodeKind, id: &str) -> Result<Option<NodeRecord>, GraphError> {
        Ok(self.node(kind, id))
    }

    async fn get_relationship(
        &self,
        key: &RelationshipKey,
    ) -> Result<Option<EdgeRecord>, GraphError> {
        Ok(self.edges.get(key).map(|r| r.value().clone()))
    }

    async fn get_entity_overview(&self, patient_id: &str) -> Result<EntityOverview, GraphError> {
        let patient = self.require_patient(patient_id)?;

        let owned = self.edges_where(|e| e.from_id == patient_id && e.kind.is_ownership());
        let condition_ids: HashSet<String> = owned
            .iter()
            .filter(|e| e.kind == RelationshipKind::HasCondition)
            .map(|e| e.to_id.clone())
            .collect();
        let medication_ids = owned
            .iter()
            .filter(|e| e.kind == RelationshipKind::TakesMedication)
            .map(|e| e.to_id.clone());

        let articles: HashSet<String> = self
            .edges_where(|e| {
                e.kind == RelationshipKind::Studies && condition_ids.contains(&e.to_id)
            })
            .into_iter()
            .map(|e| e.from_id)
            .collect();

        Ok(EntityOverview {
            patient_id: patient.id.clone(),
            patient_name: patient.display_name().map(str::to_string),
            conditions: self.nodes_for(NodeKind::Condition, condition_ids.iter().cloned()),
            medications: self.nodes_for(NodeKind::Medication, medication_ids.collect::<Vec<_>>()),
            research_article_count: articles.len(),
        })
    }

    async fn export_summary(&self) -> Result<GraphSummary, GraphError> {
        let mut summary = GraphSummary::default();
        for node in self.nodes.iter() {
            *summary.nodes_by_type.entry(node.key().kind).or_insert(0) += 1;
        }
        for edge in self.edges.iter() {
            *summary.edges_by_type.entry(edge.key().kind).or_insert(0) += 1;
        }
        Ok(summary)
    }

    async fn patient_subgraph(&self, patient_id: &str) -> Result<Subgraph, GraphError> {
        let patient = self.require_patient(patient_id)?;

        let mut edges = self.edges_where(|e| e.from_id == patient_id && e.kind.is_ownership());
        let conditions: HashSet<String> = edges
            .iter()
            .filter(|e| e.kind == RelationshipKind::HasCondition)
            .map(|e| e.to_id.clone())
            .collect();
        let medications: HashSet<String> = edges
            .iter()
            .filter(|e| e.kind == RelationshipKind::TakesMedication)
            .map(|e| e.to_id.clone())
            .collect();

        edges.extend(self.edges_where(|e| match e.kind {
            RelationshipKind::Studies => conditions.contains(&e.to_id),
            RelationshipKind::InformsMedicationManagement => medications.contains(&e.to_id),
            _ => false,
        }));
        edges.sort_by(|a, b| a.key().cmp(&b.key()));

        let mut nodes = vec![patient];
        let mut seen: HashSet<NodeKey> = HashSet::new();
        for edge in &edges {
            let target = edge.key().to_key();
            let source = edge.key().from_key();
            for key in [target, source] {
                if key.kind == NodeKind::Patient || !seen.insert(key.clone()) {
                    continue;
                }
                if let Some(record) = self.node(key.kind, &key.id) {
                    nodes.push(record);
                }
            }
        }

        Ok(Subgraph { nodes, edges })
    }

    async fn find_orphans(&self) -> Result<Vec<NodeKey>, GraphError> {
        let mut anchored: HashSet<NodeKey> = HashSet::new();
        for edge in self.edges.iter() {
            let key = edge.key();
            match key.kind {
                RelationshipKind::HasCondition | RelationshipKind::TakesMedication => {
                    anchored.insert(key.to_key());
                }
                RelationshipKind::Studies => {
                    anchored.insert(key.from_key());
                }
                RelationshipKind::InformsMedicationManagement => {}
            }
        }

        let mut orphans: Vec<NodeKey> = self
            .nodes
            .iter()
            .map(|r| r.key().clone())
            .filter(|key| {
                matches!(
                    key.kind,
                    NodeKind::Condition | NodeKind::Medication | NodeKind::ResearchArticle
                ) && !anchored.contains(key)
            })
            .collect();
        orphans.sort();
        Ok(orphans)
    }

    async fn list_patients(&self) -> Result<Vec<PatientListing>, GraphError> {
        let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
        for edge in self.edges.iter() {
            let entry = counts.entry(edge.from_id.clone()).or_default();
            match edge.kind {
                RelationshipKind::HasCondition => entry.0 += 1,
                RelationshipKind::TakesMedication => entry.1 += 1,
                _ => {}
            }
        }

        let mut patients: Vec<PatientListing> = self
            .nodes
            .iter()
            .filter(|r| r.key().kind == NodeKind::Patient)
            .map(|r| {
                let record = r.value();
                let (condition_count, medication_count) =
                    counts.get(&record.id).copied().unwrap_or_default();
                PatientListing {
                    id: record.id.clone(),
                    name: record.display_name().map(str::to_string),
                    created_at: record.created_at,
                    condition_count,
                    medication_count,
                }
            })
            .collect();
        patients.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(patients)
    }

    async fn find_related_research(
        &self,
        condition_id: &str,
        limit: usize,
    ) -> Result<Vec<RelatedArticle>, GraphError> {
        let links =
            self.edges_where(|e| e.kind == RelationshipKind::Studies && e.to_id == condition_id);

        let mut related: Vec<RelatedArticle> = links
            .into_iter()
            .filter_map(|link| {
                let article = self.node(NodeKind::ResearchArticle, &link.from_id)?;
                Some(RelatedArticle {
                    article,
                    relevance: link
                        .attributes
                        .get("relevance")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    confidence: link.attributes.get("confidence").and_then(Value::as_f64),
                })
            })
            .collect();

        related.sort_by(|a, b| {
            let ca = a.confidence.unwrap_or(DEFAULT_RANKING_CONFIDENCE);
            let cb = b.confidence.unwrap_or(DEFAULT_RANKING_CONFIDENCE);
            cb.total_cmp(&ca).then_with(|| a.article.id.cmp(&b.article.id))
        });
        related.truncate(limit);
        Ok(related)
    }
}

#[async_trait]
impl GraphWriter for InMemoryGraphStore {
    async fn upsert_node(&self, spec: &NodeSpec) -> Result<UpsertOutcome, GraphError> {
        let attributes = normalize_node(spec)?;
        let now = Utc::now();

        let outcome = match self.nodes.entry(spec.key()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.attributes.extend(attributes);
                record.updated_at = now;
                UpsertOutcome::Updated
            }
            Entry::Vacant(entry) => {
                entry.insert(NodeRecord {
                    kind: spec.kind,
                    id: spec.id.clone(),
                    attributes,
                    created_at: now,
                    updated_at: now,
                });
                UpsertOutcome::Created
            }
        };

        tracing::debug!(node = %spec.key(), ?outcome, "Upserted node");
        Ok(outcome)
    }

    async fn upsert_relationship(
        &self,
        spec: &RelationshipSpec,
    ) -> Result<UpsertOutcome, GraphError> {
        let attributes = normalize_relationship(spec)?;
        let key = spec.key();

        // Endpoint guards stay held until the edge is written, so a concurrent
        // delete_node cannot remove an endpoint between the check and the merge.
        let from_node = self.nodes.get(&key.from_key());
        let to_node = self.nodes.get(&key.to_key());
        let (_from_node, _to_node) = match (from_node, to_node) {
            (Some(from), Some(to)) => (from, to),
            (None, _) => {
                return Err(GraphError::DanglingReference {
                    missing: key.from_key(),
                    relationship: key,
                })
            }
            (Some(_), None) => {
                return Err(GraphError::DanglingReference {
                    missing: key.to_key(),
                    relationship: key,
                })
            }
        };

        if spec.kind == RelationshipKind::HasCondition {
            self.claim_condition(spec)?;
        }

        let now = Utc::now();
        let outcome = match self.edges.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.attributes.extend(attributes);
                record.updated_at = now;
                UpsertOutcome::Updated
            }
            Entry::Vacant(entry) => {
                let mut initial = Attributes::new();
                if let Some(relevance) = default_relevance(spec.kind) {
                    initial.insert("relevance".to_string(), Value::from(relevance));
                }
                initial.extend(attributes);
                entry.insert(EdgeRecord {
                    kind: spec.kind,
                    from_id: spec.from_id.clone(),
                    to_id: spec.to_id.clone(),
                    attributes: initial,
                    created_at: now,
                    updated_at: now,
                });
                UpsertOutcome::Created
            }
        };

        tracing::debug!(relationship = %key, ?outcome, "Upserted relationship");
        Ok(outcome)
    }

    async fn delete_node(&self, kind: NodeKind, id: &str) -> Result<bool, GraphError> {
        if self.nodes.remove(&NodeKey::new(kind, id)).is_none() {
            return Ok(false);
        }

        self.edges.retain(|key, _| {
            let (from_kind, to_kind) = key.kind.endpoints();
            !((from_kind == kind && key.from_id == id) || (to_kind == kind && key.to_id == id))
        });
        match kind {
            NodeKind::Condition => {
                self.owners.remove(id);
            }
            NodeKind::Patient => self.owners.retain(|_, owner| owner.as_str() != id),
            _ => {}
        }

        tracing::info!(%kind, id, "Deleted node");
        Ok(true)
    }
}
