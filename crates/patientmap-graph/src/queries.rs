//! Read operations against Neo4j.
//!
//! Properties come back as JSON via `apoc.convert.toJson(properties(x))` and
//! are split into attributes and store-managed timestamps here.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use neo4rs::query;

use patientmap_core::{Attributes, NodeKey, NodeKind, RelationshipKey, RelationshipKind};

use crate::client::{GraphClient, GraphError};
use crate::store::{
    EdgeRecord, EntityOverview, GraphReader, GraphSummary, NodeRecord, PatientListing,
    RelatedArticle, Subgraph, DEFAULT_RANKING_CONFIDENCE,
};

/// Patterns that make up a patient's neighbourhood. Each binds `a` (source),
/// `b` (target) and `r`, and is anchored on `(p:Patient {id: $id})`.
const SUBGRAPH_PATTERNS: [(RelationshipKind, &str); 4] = [
    (
        RelationshipKind::HasCondition,
        "MATCH (p:Patient {id: $id})-[r:HAS_CONDITION]->(b:Condition) WITH p AS a, r, b",
    ),
    (
        RelationshipKind::TakesMedication,
        "MATCH (p:Patient {id: $id})-[r:TAKES_MEDICATION]->(b:Medication) WITH p AS a, r, b",
    ),
    (
        RelationshipKind::Studies,
        "MATCH (:Patient {id: $id})-[:HAS_CONDITION]->(b:Condition)<-[r:STUDIES]-(a:ResearchArticle)",
    ),
    (
        RelationshipKind::InformsMedicationManagement,
        "MATCH (:Patient {id: $id})-[:TAKES_MEDICATION]->(b:Medication)
               <-[r:INFORMS_MEDICATION_MANAGEMENT]-(a:ResearchArticle)",
    ),
];

#[async_trait]
impl GraphReader for GraphClient {
    async fn get_node(&self, kind: NodeKind, id: &str) -> Result<Option<NodeRecord>, GraphError> {
        let cypher = format!(
            "MATCH (n:{label} {{id: $id}})
             RETURN apoc.convert.toJson(properties(n)) AS props",
            label = kind.label()
        );

        let q = query(&cypher).param("id", id.to_string());

        match self.query_one(q).await? {
            Some(row) => Ok(Some(node_record(kind, &row_string(&row, "props")?)?)),
            None => Ok(None),
        }
    }

    async fn get_relationship(
        &self,
        key: &RelationshipKey,
    ) -> Result<Option<EdgeRecord>, GraphError> {
        let (from, to) = key.kind.endpoints();
        let cypher = format!(
            "MATCH (:{from_label} {{id: $from_id}})-[r:{rel}]->(:{to_label} {{id: $to_id}})
             RETURN apoc.convert.toJson(properties(r)) AS props",
            from_label = from.label(),
            to_label = to.label(),
            rel = key.kind.rel_type(),
        );

        let q = query(&cypher)
            .param("from_id", key.from_id.clone())
            .param("to_id", key.to_id.clone());

        match self.query_one(q).await? {
            Some(row) => Ok(Some(edge_record(
                key.kind,
                &key.from_id,
                &key.to_id,
                &row_string(&row, "props")?,
            )?)),
            None => Ok(None),
        }
    }

    async fn get_entity_overview(&self, patient_id: &str) -> Result<EntityOverview, GraphError> {
        let patient = self.require_patient(patient_id).await?;

        let conditions = self
            .owned_nodes(patient_id, RelationshipKind::HasCondition)
            .await?;
        let medications = self
            .owned_nodes(patient_id, RelationshipKind::TakesMedication)
            .await?;

        let q = query(
            "MATCH (:Patient {id: $id})-[:HAS_CONDITION]->(:Condition)
                   <-[:STUDIES]-(a:ResearchArticle)
             RETURN count(DISTINCT a) AS cnt",
        )
        .param("id", patient_id.to_string());

        let research_article_count = match self.query_one(q).await? {
            Some(row) => row.get::<i64>("cnt").unwrap_or(0).max(0) as usize,
            None => 0,
        };

        Ok(EntityOverview {
            patient_id: patient.id.clone(),
            patient_name: patient.display_name().map(str::to_string),
            conditions,
            medications,
            research_article_count,
        })
    }

    async fn export_summary(&self) -> Result<GraphSummary, GraphError> {
        let mut summary = GraphSummary::default();

        let rows = self
            .query_rows(query(
                "MATCH (n) UNWIND labels(n) AS label
                 RETURN label, count(n) AS cnt",
            ))
            .await?;
        for row in rows {
            let label: String = row.get("label").unwrap_or_default();
            let cnt = row.get::<i64>("cnt").unwrap_or(0);
            if let (Ok(kind), true) = (label.parse::<NodeKind>(), cnt > 0) {
                summary.nodes_by_type.insert(kind, cnt as usize);
            }
        }

        let rows = self
            .query_rows(query(
                "MATCH ()-[r]->() RETURN type(r) AS rel, count(r) AS cnt",
            ))
            .await?;
        for row in rows {
            let rel: String = row.get("rel").unwrap_or_default();
            let cnt = row.get::<i64>("cnt").unwrap_or(0);
            if let (Ok(kind), true) = (rel.parse::<RelationshipKind>(), cnt > 0) {
                summary.edges_by_type.insert(kind, cnt as usize);
            }
        }

        Ok(summary)
    }

    async fn patient_subgraph(&self, patient_id: &str) -> Result<Subgraph, GraphError> {
        let patient = self.require_patient(patient_id).await?;

        let mut subgraph = Subgraph {
            nodes: vec![patient],
            edges: Vec::new(),
        };
        let mut seen: HashSet<NodeKey> = HashSet::new();

        for (kind, pattern) in SUBGRAPH_PATTERNS {
            let (from_kind, to_kind) = kind.endpoints();
            let cypher = format!(
                "{pattern}
                 RETURN a.id AS from_id, b.id AS to_id,
                        apoc.convert.toJson(properties(a)) AS from_props,
                        apoc.convert.toJson(properties(b)) AS to_props,
                        apoc.convert.toJson(properties(r)) AS rel_props"
            );
            let q = query(&cypher).param("id", patient_id.to_string());

            for row in self.query_rows(q).await? {
                let from_id = row_string(&row, "from_id")?;
                let to_id = row_string(&row, "to_id")?;

                for (node_kind, props_col) in [(from_kind, "from_props"), (to_kind, "to_props")] {
                    if node_kind == NodeKind::Patient {
                        continue;
                    }
                    let record = node_record(node_kind, &row_string(&row, props_col)?)?;
                    if seen.insert(record.key()) {
                        subgraph.nodes.push(record);
                    }
                }

                subgraph.edges.push(edge_record(
                    kind,
                    &from_id,
                    &to_id,
                    &row_string(&row, "rel_props")?,
                )?);
            }
        }

        Ok(subgraph)
    }

    async fn find_orphans(&self) -> Result<Vec<NodeKey>, GraphError> {
        let q = query(
            "MATCH (c:Condition) WHERE NOT ()-[:HAS_CONDITION]->(c)
             RETURN 'Condition' AS label, c.id AS id
             UNION ALL
             MATCH (m:Medication) WHERE NOT ()-[:TAKES_MEDICATION]->(m)
             RETURN 'Medication' AS label, m.id AS id
             UNION ALL
             MATCH (a:ResearchArticle) WHERE NOT (a)-[:STUDIES]->()
             RETURN 'ResearchArticle' AS label, a.id AS id",
        );

        let mut orphans = Vec::new();
        for row in self.query_rows(q).await? {
            let label = row_string(&row, "label")?;
            let kind = label
                .parse::<NodeKind>()
                .map_err(GraphError::Serialization)?;
            orphans.push(NodeKey::new(kind, row_string(&row, "id")?));
        }
        orphans.sort();
        Ok(orphans)
    }

    async fn list_patients(&self) -> Result<Vec<PatientListing>, GraphError> {
        let q = query(
            "MATCH (p:Patient)
             OPTIONAL MATCH (p)-[:HAS_CONDITION]->(c:Condition)
             WITH p, count(DISTINCT c) AS conditions
             OPTIONAL MATCH (p)-[:TAKES_MEDICATION]->(m:Medication)
             RETURN p.id AS id, p.name AS name, p.created_at AS created_at,
                    conditions, count(DISTINCT m) AS medications
             ORDER BY created_at DESC, id",
        );

        let rows = self.query_rows(q).await?;
        let mut patients = Vec::with_capacity(rows.len());
        for row in rows {
            patients.push(PatientListing {
                id: row_string(&row, "id")?,
                name: row.get::<String>("name").ok(),
                created_at: parse_timestamp(row.get::<String>("created_at").ok().as_deref()),
                condition_count: row.get::<i64>("conditions").unwrap_or(0).max(0) as usize,
                medication_count: row.get::<i64>("medications").unwrap_or(0).max(0) as usize,
            });
        }
        Ok(patients)
    }

    async fn find_related_research(
        &self,
        condition_id: &str,
        limit: usize,
    ) -> Result<Vec<RelatedArticle>, GraphError> {
        let q = query(
            "MATCH (a:ResearchArticle)-[r:STUDIES]->(:Condition {id: $id})
             RETURN apoc.convert.toJson(properties(a)) AS props,
                    r.relevance AS relevance, r.confidence AS confidence
             ORDER BY coalesce(r.confidence, $fallback) DESC, a.id
             LIMIT $limit",
        )
        .param("id", condition_id.to_string())
        .param("fallback", DEFAULT_RANKING_CONFIDENCE)
        .param("limit", limit as i64);

        let rows = self.query_rows(q).await?;
        let mut related = Vec::with_capacity(rows.len());
        for row in rows {
            related.push(RelatedArticle {
                article: node_record(NodeKind::ResearchArticle, &row_string(&row, "props")?)?,
                relevance: row.get::<String>("relevance").ok(),
                confidence: row.get::<f64>("confidence").ok(),
            });
        }
        Ok(related)
    }
}

impl GraphClient {
    async fn require_patient(&self, patient_id: &str) -> Result<NodeRecord, GraphError> {
        self.get_node(NodeKind::Patient, patient_id)
            .await?
            .ok_or_else(|| GraphError::NotFound {
                kind: NodeKind::Patient,
                id: patient_id.to_string(),
            })
    }

    /// Targets of a patient's ownership edges of the given kind.
    async fn owned_nodes(
        &self,
        patient_id: &str,
        kind: RelationshipKind,
    ) -> Result<Vec<NodeRecord>, GraphError> {
        let target = kind.endpoints().1;
        let cypher = format!(
            "MATCH (:Patient {{id: $id}})-[:{rel}]->(n:{label})
             RETURN apoc.convert.toJson(properties(n)) AS props
             ORDER BY n.id",
            rel = kind.rel_type(),
            label = target.label(),
        );
        let q = query(&cypher).param("id", patient_id.to_string());

        let rows = self.query_rows(q).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(node_record(target, &row_string(&row, "props")?)?);
        }
        Ok(records)
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn row_string(row: &neo4rs::Row, column: &str) -> Result<String, GraphError> {
    row.get::<String>(column)
        .map_err(|e| GraphError::Serialization(format!("Failed to read column {column}: {e}")))
}

/// Split a stored property map into attributes and store-managed fields.
fn split_props(
    props_json: &str,
) -> Result<(Option<String>, Attributes, DateTime<Utc>, DateTime<Utc>), GraphError> {
    let mut props: Attributes = serde_json::from_str(props_json)
        .map_err(|e| GraphError::Serialization(format!("Invalid property map: {e}")))?;

    let id = props
        .remove("id")
        .and_then(|v| v.as_str().map(str::to_string));
    let created_at = parse_timestamp(props.remove("created_at").as_ref().and_then(|v| v.as_str()));
    let updated_at = parse_timestamp(props.remove("updated_at").as_ref().and_then(|v| v.as_str()));
    Ok((id, props, created_at, updated_at))
}

pub(crate) fn node_record(kind: NodeKind, props_json: &str) -> Result<NodeRecord, GraphError> {
    let (id, attributes, created_at, updated_at) = split_props(props_json)?;
    let id = id.ok_or_else(|| {
        GraphError::Serialization(format!("{kind} node is missing its id property"))
    })?;
    Ok(NodeRecord {
        kind,
        id,
        attributes,
        created_at,
        updated_at,
    })
}

pub(crate) fn edge_record(
    kind: RelationshipKind,
    from_id: &str,
    to_id: &str,
    props_json: &str,
) -> Result<EdgeRecord, GraphError> {
    let (_, attributes, created_at, updated_at) = split_props(props_json)?;
    Ok(EdgeRecord {
        kind,
        from_id: from_id.to_string(),
        to_id: to_id.to_string(),
        attributes,
        created_at,
        updated_at,
    })
}

/// Timestamps are stored as RFC 3339 strings. Unparseable values map to the epoch.
fn parse_timestamp(value: Option<&str>) -> DateTime<Utc> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}
