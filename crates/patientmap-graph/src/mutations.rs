//! Write operations against Neo4j.
//!
//! All mutations use MERGE (upsert) semantics so repeated submissions of the
//! same entity converge on one node. Nodes are identified by (label, id) and
//! relationships by (type, source, target).

use async_trait::async_trait;
use chrono::Utc;
use neo4rs::query;

use patientmap_core::schema::{default_relevance, normalize_node, normalize_relationship};
use patientmap_core::{Attributes, NodeKind, NodeSpec, RelationshipKind, RelationshipSpec};

use crate::client::{GraphClient, GraphError};
use crate::store::{GraphWriter, UpsertOutcome};

#[async_trait]
impl GraphWriter for GraphClient {
    async fn upsert_node(&self, spec: &NodeSpec) -> Result<UpsertOutcome, GraphError> {
        let attributes = normalize_node(spec)?;
        let cypher = format!(
            "MERGE (n:{label} {{id: $id}})
             ON CREATE SET n.created_at = $now
             SET n += apoc.convert.fromJsonMap($props), n.updated_at = $now
             RETURN n.created_at = $now AS created",
            label = spec.kind.label()
        );

        let q = query(&cypher)
            .param("id", spec.id.clone())
            .param("props", props_json(&attributes)?)
            .param("now", Utc::now().to_rfc3339());

        let outcome = outcome_of(self.query_one(q).await?);
        tracing::debug!(node = %spec.key(), ?outcome, "Upserted node");
        Ok(outcome)
    }

    async fn upsert_relationship(
        &self,
        spec: &RelationshipSpec,
    ) -> Result<UpsertOutcome, GraphError> {
        let attributes = normalize_relationship(spec)?;

        let mut q = query(&relationship_merge_cypher(spec.kind))
            .param("from_id", spec.from_id.clone())
            .param("to_id", spec.to_id.clone())
            .param("props", props_json(&attributes)?)
            .param("now", Utc::now().to_rfc3339());
        if let Some(relevance) = default_relevance(spec.kind) {
            q = q.param("default_relevance", relevance);
        }

        match self.query_one(q).await? {
            Some(row) => {
                let outcome = outcome_of(Some(row));
                tracing::debug!(relationship = %spec.key(), ?outcome, "Upserted relationship");
                Ok(outcome)
            }
            None => Err(self.rejection(spec).await?),
        }
    }

    async fn delete_node(&self, kind: NodeKind, id: &str) -> Result<bool, GraphError> {
        let cypher = format!(
            "MATCH (n:{label} {{id: $id}})
             DETACH DELETE n
             RETURN count(n) AS cnt",
            label = kind.label()
        );

        let q = query(&cypher).param("id", id.to_string());

        let deleted = match self.query_one(q).await? {
            Some(row) => row.get::<i64>("cnt").unwrap_or(0) > 0,
            None => false,
        };
        if deleted {
            tracing::info!(%kind, id, "Deleted node");
        }
        Ok(deleted)
    }
}

impl GraphClient {
    /// Explain why a relationship merge matched nothing: a missing endpoint,
    /// or a condition already owned by another patient.
    async fn rejection(&self, spec: &RelationshipSpec) -> Result<GraphError, GraphError> {
        let key = spec.key();
        let (from, to) = spec.kind.endpoints();
        let cypher = format!(
            "OPTIONAL MATCH (a:{from_label} {{id: $from_id}})
             OPTIONAL MATCH (b:{to_label} {{id: $to_id}})
             OPTIONAL MATCH (o:Patient)-[:HAS_CONDITION]->(b)
             WHERE o.id <> $from_id
             RETURN a IS NOT NULL AS has_from, b IS NOT NULL AS has_to,
                    head(collect(o.id)) AS owner",
            from_label = from.label(),
            to_label = to.label(),
        );
        let q = query(&cypher)
            .param("from_id", spec.from_id.clone())
            .param("to_id", spec.to_id.clone());

        let row = self.query_one(q).await?;
        let flag = |name: &str| {
            row.as_ref()
                .and_then(|r| r.get::<bool>(name).ok())
                .unwrap_or(false)
        };
        let (has_from, has_to) = (flag("has_from"), flag("has_to"));

        if has_from && has_to && spec.kind == RelationshipKind::HasCondition {
            let owner = row
                .as_ref()
                .and_then(|r| r.get::<String>("owner").ok())
                .unwrap_or_default();
            return Ok(GraphError::OwnershipConflict {
                condition_id: spec.to_id.clone(),
                owner,
            });
        }

        let missing = if has_from { key.to_key() } else { key.from_key() };
        Ok(GraphError::DanglingReference {
            relationship: key,
            missing,
        })
    }
}

/// The single statement that checks endpoints and merges a relationship.
///
/// No rows means nothing was written. For `HAS_CONDITION` the condition node
/// is locked first, so the owner check and the merge cannot interleave with
/// another patient's claim.
fn relationship_merge_cypher(kind: RelationshipKind) -> String {
    let (from, to) = kind.endpoints();
    let on_create = match default_relevance(kind) {
        Some(_) => "r.created_at = $now, r.relevance = $default_relevance",
        None => "r.created_at = $now",
    };
    let owner_guard = if kind == RelationshipKind::HasCondition {
        "CALL apoc.lock.nodes([b])
             OPTIONAL MATCH (o:Patient)-[:HAS_CONDITION]->(b)
             WHERE o.id <> $from_id
             WITH a, b, o
             WHERE o IS NULL
             "
    } else {
        ""
    };
    format!(
        "MATCH (a:{from_label} {{id: $from_id}})
             MATCH (b:{to_label} {{id: $to_id}})
             {owner_guard}MERGE (a)-[r:{rel}]->(b)
             ON CREATE SET {on_create}
             SET r += apoc.convert.fromJsonMap($props), r.updated_at = $now
             RETURN r.created_at = $now AS created",
        from_label = from.label(),
        to_label = to.label(),
        rel = kind.rel_type(),
    )
}

// ── Helpers ──────────────────────────────────────────────────────

fn props_json(attributes: &Attributes) -> Result<String, GraphError> {
    serde_json::to_string(attributes).map_err(|e| GraphError::Serialization(e.to_string()))
}

fn outcome_of(row: Option<neo4rs::Row>) -> UpsertOutcome {
    match row.and_then(|r| r.get::<bool>("created").ok()) {
        Some(true) => UpsertOutcome::Created,
        _ => UpsertOutcome::Updated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_claim_is_guarded_inside_the_merge() {
        let cypher = relationship_merge_cypher(RelationshipKind::HasCondition);
        let lock = cypher.find("apoc.lock.nodes([b])").unwrap();
        let guard = cypher.find("WHERE o IS NULL").unwrap();
        let merge = cypher.find("MERGE (a)-[r:HAS_CONDITION]->(b)").unwrap();
        assert!(lock < guard && guard < merge);
    }

    #[test]
    fn shareable_relationships_have_no_owner_guard() {
        for kind in [
            RelationshipKind::TakesMedication,
            RelationshipKind::Studies,
            RelationshipKind::InformsMedicationManagement,
        ] {
            let cypher = relationship_merge_cypher(kind);
            assert!(!cypher.contains("apoc.lock.nodes"));
            assert!(cypher.contains(&format!("MERGE (a)-[r:{}]->(b)", kind.rel_type())));
        }
        assert!(relationship_merge_cypher(RelationshipKind::Studies)
            .contains("r.relevance = $default_relevance"));
    }
}
