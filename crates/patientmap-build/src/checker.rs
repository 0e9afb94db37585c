//! Read-only completeness validation.
//!
//! The checker holds a [`ReadOnlyGraph`], so it cannot mutate the store it
//! inspects. Every read is bounded by the operation timeout; a read that
//! fails or times out makes the evaluation incomplete with a
//! [`Gap::ValidationUnavailable`] reason.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;

use patientmap_core::{NodeKey, NodeKind, RelationshipKey};
use patientmap_graph::{GraphError, GraphReader, NodeRecord, ReadOnlyGraph};

use crate::input::BuildInput;

/// Entities and relationships the graph must contain once the build is done.
#[derive(Debug, Clone, Default)]
pub struct Expectations {
    pub nodes: Vec<NodeKey>,
    pub relationships: Vec<RelationshipKey>,
}

impl Expectations {
    /// Every non-patient node and every relationship in the input.
    pub fn from_input(input: &BuildInput) -> Self {
        let mut nodes: Vec<NodeKey> = Vec::with_capacity(input.nodes.len());
        for spec in &input.nodes {
            let key = spec.key();
            if key != input.patient.key() && !nodes.contains(&key) {
                nodes.push(key);
            }
        }

        let mut relationships: Vec<RelationshipKey> = Vec::with_capacity(input.relationships.len());
        for spec in &input.relationships {
            let key = spec.key();
            if !relationships.contains(&key) {
                relationships.push(key);
            }
        }

        Self {
            nodes,
            relationships,
        }
    }
}

/// Something the graph is still missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "gap", rename_all = "snake_case")]
pub enum Gap {
    MissingPatient { id: String },
    MissingNode { key: NodeKey },
    MissingRelationship { key: RelationshipKey },
    ValidationUnavailable { reason: String },
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPatient { id } => write!(f, "missing patient {id}"),
            Self::MissingNode { key } => write!(f, "missing node {key}"),
            Self::MissingRelationship { key } => write!(f, "missing relationship {key}"),
            Self::ValidationUnavailable { reason } => write!(f, "validation unavailable: {reason}"),
        }
    }
}

/// Result of one evaluation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Validation {
    pub complete: bool,
    pub reasons: Vec<Gap>,
    /// Non-gating data-quality hints for entities that are present.
    pub suggestions: Vec<String>,
}

impl Validation {
    /// True when the gap list is trustworthy (no read failed).
    pub fn is_conclusive(&self) -> bool {
        !self
            .reasons
            .iter()
            .any(|r| matches!(r, Gap::ValidationUnavailable { .. }))
    }
}

/// Scores structural completeness of a patient's graph against expectations.
pub struct ValidationChecker<S: ?Sized> {
    graph: ReadOnlyGraph<S>,
    expectations: Expectations,
    timeout: Duration,
}

impl<S: GraphReader + ?Sized> ValidationChecker<S> {
    pub fn new(graph: ReadOnlyGraph<S>, expectations: Expectations, timeout: Duration) -> Self {
        Self {
            graph,
            expectations,
            timeout,
        }
    }

    pub fn expectations(&self) -> &Expectations {
        &self.expectations
    }

    /// Evaluate whether the patient anchor and every expected entity and
    /// relationship exist.
    pub async fn evaluate(&self, patient_id: &str) -> Validation {
        let mut validation = Validation::default();

        match self
            .read(self.graph.get_node(NodeKind::Patient, patient_id))
            .await
        {
            Ok(Some(record)) => suggest(&record, &mut validation.suggestions),
            Ok(None) => validation.reasons.push(Gap::MissingPatient {
                id: patient_id.to_string(),
            }),
            Err(reason) => return unavailable(validation, reason),
        }

        for key in &self.expectations.nodes {
            match self.read(self.graph.get_node(key.kind, &key.id)).await {
                Ok(Some(record)) => suggest(&record, &mut validation.suggestions),
                Ok(None) => validation.reasons.push(Gap::MissingNode { key: key.clone() }),
                Err(reason) => return unavailable(validation, reason),
            }
        }

        for key in &self.expectations.relationships {
            match self.read(self.graph.get_relationship(key)).await {
                Ok(Some(_)) => {}
                Ok(None) => validation
                    .reasons
                    .push(Gap::MissingRelationship { key: key.clone() }),
                Err(reason) => return unavailable(validation, reason),
            }
        }

        validation.complete = validation.reasons.is_empty();
        tracing::debug!(
            patient_id,
            complete = validation.complete,
            gaps = validation.reasons.len(),
            suggestions = validation.suggestions.len(),
            "Evaluated graph completeness"
        );
        validation
    }

    async fn read<T>(
        &self,
        fut: impl Future<Output = Result<T, GraphError>>,
    ) -> Result<T, String> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("read timed out after {}ms", self.timeout.as_millis())),
        }
    }
}

fn unavailable(mut validation: Validation, reason: String) -> Validation {
    tracing::warn!(%reason, "Graph validation unavailable");
    validation.complete = false;
    validation.reasons.push(Gap::ValidationUnavailable { reason });
    validation
}

/// Data-quality hints for a present entity.
fn suggest(record: &NodeRecord, out: &mut Vec<String>) {
    let key = record.key();
    if record.display_name().is_none() {
        out.push(format!(
            "{key} has no {}",
            record.kind.display_attribute()
        ));
    }

    let has = |name: &str| match record.attributes.get(name) {
        Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
        Some(serde_json::Value::Array(items)) => !items.is_empty(),
        Some(serde_json::Value::Null) | None => false,
        Some(_) => true,
    };
    let wanted: &[(&str, &str)] = match record.kind {
        NodeKind::Patient => &[],
        NodeKind::Condition => &[("icd_code", "ICD code")],
        NodeKind::Medication => &[("dosage", "dosage")],
        NodeKind::ResearchArticle => &[("authors", "authors"), ("url", "source URL")],
        NodeKind::ClinicalTrial => &[("phase", "phase"), ("status", "status")],
    };
    for (name, description) in wanted {
        if !has(name) {
            out.push(format!("{key} has no {description}"));
        }
    }
}
