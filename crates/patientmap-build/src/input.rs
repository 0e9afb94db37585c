//! Loop input: the finite, ordered collection of entities to build.

use serde::{Deserialize, Serialize};

use patientmap_core::{NodeKind, NodeSpec, RelationshipSpec};

/// Everything one build loop should bring into the graph.
///
/// Deserializes from the upstream tuple shape:
///
/// ```json
/// {
///   "patient": {"type": "Patient", "id": "p1", "attributes": {"name": "Ada"}},
///   "nodes": [{"type": "Condition", "id": "cond_diabetes", "attributes": {}}],
///   "relationships": [{"type": "HAS_CONDITION", "from_id": "p1", "to_id": "cond_diabetes"}]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInput {
    pub patient: NodeSpec,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub relationships: Vec<RelationshipSpec>,
}

impl BuildInput {
    pub fn new(patient: impl Into<NodeSpec>) -> Self {
        Self {
            patient: patient.into(),
            nodes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Input for a research-enrichment pass over an existing patient.
    ///
    /// The patient anchor carries no attributes, so patient data is never
    /// overwritten by the enrichment loop.
    pub fn enrichment(
        patient_id: impl Into<String>,
        nodes: Vec<NodeSpec>,
        relationships: Vec<RelationshipSpec>,
    ) -> Self {
        Self {
            patient: NodeSpec::new(NodeKind::Patient, patient_id),
            nodes,
            relationships,
        }
    }

    pub fn node(mut self, spec: impl Into<NodeSpec>) -> Self {
        self.nodes.push(spec.into());
        self
    }

    pub fn relationship(mut self, spec: impl Into<RelationshipSpec>) -> Self {
        self.relationships.push(spec.into());
        self
    }

    pub fn patient_id(&self) -> &str {
        &self.patient.id
    }

    /// Total number of input items, the patient anchor included.
    pub fn item_count(&self) -> usize {
        1 + self.nodes.len() + self.relationships.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patientmap_core::RelationshipKind;

    #[test]
    fn deserializes_upstream_shape() {
        let json = r#"{
            "patient": {"type": "Patient", "id": "p1", "attributes": {"name": "Ada"}},
            "nodes": [
                {"type": "Condition", "id": "cond_diabetes", "attributes": {"label": "Type 2 Diabetes"}},
                {"type": "Medication", "id": "med_metformin"}
            ],
            "relationships": [
                {"type": "HAS_CONDITION", "from_id": "p1", "to_id": "cond_diabetes"}
            ]
        }"#;
        let input: BuildInput = serde_json::from_str(json).unwrap();

        assert_eq!(input.patient_id(), "p1");
        assert_eq!(input.nodes.len(), 2);
        assert_eq!(input.relationships[0].kind, RelationshipKind::HasCondition);
        assert_eq!(input.item_count(), 4);
    }

    #[test]
    fn enrichment_anchor_has_no_attributes() {
        let input = BuildInput::enrichment("p1", Vec::new(), Vec::new());
        assert_eq!(input.patient.kind, NodeKind::Patient);
        assert!(input.patient.attributes.is_empty());
    }
}
