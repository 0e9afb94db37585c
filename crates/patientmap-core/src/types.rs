//! Core domain types for the PatientMap knowledge graph.
//!
//! Upstream producers (data intake, research-finding extraction) describe the
//! graph as `{type, id, attributes}` node tuples and
//! `{type, from_id, to_id, attributes}` relationship tuples. These map onto
//! [`NodeSpec`] and [`RelationshipSpec`]. The typed builders further down
//! ([`Condition`], [`ResearchArticle`], ...) produce specs carrying only the
//! fields that were actually supplied, so they merge as partial updates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Free-form attribute bag attached to nodes and relationships.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

// ── Kinds ─────────────────────────────────────────────────────────

/// Every entity type stored in the graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKind {
    Patient,
    Condition,
    Medication,
    ResearchArticle,
    ClinicalTrial,
}

impl NodeKind {
    pub const ALL: [NodeKind; 5] = [
        NodeKind::Patient,
        NodeKind::Condition,
        NodeKind::Medication,
        NodeKind::ResearchArticle,
        NodeKind::ClinicalTrial,
    ];

    /// The graph label for this kind.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Patient => "Patient",
            Self::Condition => "Condition",
            Self::Medication => "Medication",
            Self::ResearchArticle => "ResearchArticle",
            Self::ClinicalTrial => "ClinicalTrial",
        }
    }

    /// The attribute holding the human-readable name of an entity of this kind.
    pub fn display_attribute(&self) -> &'static str {
        match self {
            Self::Patient => "name",
            Self::Condition | Self::Medication => "label",
            Self::ResearchArticle | Self::ClinicalTrial => "title",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.label() == s)
            .ok_or_else(|| format!("unknown node kind: {s}"))
    }
}

/// Every relationship type stored in the graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipKind {
    /// Patient → Condition (ownership).
    HasCondition,
    /// Patient → Medication.
    TakesMedication,
    /// ResearchArticle → Condition (shared evidence).
    Studies,
    /// ResearchArticle → Medication.
    InformsMedicationManagement,
}

impl RelationshipKind {
    pub const ALL: [RelationshipKind; 4] = [
        RelationshipKind::HasCondition,
        RelationshipKind::TakesMedication,
        RelationshipKind::Studies,
        RelationshipKind::InformsMedicationManagement,
    ];

    /// The relationship type string used in the graph.
    pub fn rel_type(&self) -> &'static str {
        match self {
            Self::HasCondition => "HAS_CONDITION",
            Self::TakesMedication => "TAKES_MEDICATION",
            Self::Studies => "STUDIES",
            Self::InformsMedicationManagement => "INFORMS_MEDICATION_MANAGEMENT",
        }
    }

    /// The (source, target) node kinds this relationship connects.
    pub fn endpoints(&self) -> (NodeKind, NodeKind) {
        match self {
            Self::HasCondition => (NodeKind::Patient, NodeKind::Condition),
            Self::TakesMedication => (NodeKind::Patient, NodeKind::Medication),
            Self::Studies => (NodeKind::ResearchArticle, NodeKind::Condition),
            Self::InformsMedicationManagement => {
                (NodeKind::ResearchArticle, NodeKind::Medication)
            }
        }
    }

    /// Whether this relationship anchors its target to a patient.
    pub fn is_ownership(&self) -> bool {
        matches!(self, Self::HasCondition | Self::TakesMedication)
    }
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rel_type())
    }
}

impl FromStr for RelationshipKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.rel_type() == s)
            .ok_or_else(|| format!("unknown relationship type: {s}"))
    }
}

/// Why a research article is linked to a condition.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Relevance {
    Treatment,
    Diagnosis,
    Prognosis,
    #[default]
    Related,
}

impl Relevance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Treatment => "treatment",
            Self::Diagnosis => "diagnosis",
            Self::Prognosis => "prognosis",
            Self::Related => "related",
        }
    }
}

impl FromStr for Relevance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "treatment" => Ok(Self::Treatment),
            "diagnosis" => Ok(Self::Diagnosis),
            "prognosis" => Ok(Self::Prognosis),
            "related" => Ok(Self::Related),
            _ => Err(format!("unknown relevance: {s}")),
        }
    }
}

// ── Keys ──────────────────────────────────────────────────────────

/// Identity of a node: unique within its kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub kind: NodeKind,
    pub id: String,
}

impl NodeKey {
    pub fn new(kind: NodeKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Identity of a relationship: at most one edge per (kind, from, to).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationshipKey {
    pub kind: RelationshipKind,
    pub from_id: String,
    pub to_id: String,
}

impl RelationshipKey {
    pub fn new(kind: RelationshipKind, from_id: impl Into<String>, to_id: impl Into<String>) -> Self {
        Self {
            kind,
            from_id: from_id.into(),
            to_id: to_id.into(),
        }
    }

    pub fn from_key(&self) -> NodeKey {
        NodeKey::new(self.kind.endpoints().0, self.from_id.clone())
    }

    pub fn to_key(&self) -> NodeKey {
        NodeKey::new(self.kind.endpoints().1, self.to_id.clone())
    }
}

impl fmt::Display for RelationshipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({} -> {})", self.kind, self.from_id, self.to_id)
    }
}

// ── Specs ─────────────────────────────────────────────────────────

/// A node as described by an upstream producer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSpec {
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub id: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl NodeSpec {
    pub fn new(kind: NodeKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            attributes: Attributes::new(),
        }
    }

    /// Set one attribute, builder style.
    pub fn with(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn key(&self) -> NodeKey {
        NodeKey::new(self.kind, self.id.clone())
    }
}

/// A relationship as described by an upstream producer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationshipSpec {
    #[serde(rename = "type")]
    pub kind: RelationshipKind,
    pub from_id: String,
    pub to_id: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl RelationshipSpec {
    pub fn new(kind: RelationshipKind, from_id: impl Into<String>, to_id: impl Into<String>) -> Self {
        Self {
            kind,
            from_id: from_id.into(),
            to_id: to_id.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn has_condition(patient_id: impl Into<String>, condition_id: impl Into<String>) -> Self {
        Self::new(RelationshipKind::HasCondition, patient_id, condition_id)
    }

    pub fn takes_medication(
        patient_id: impl Into<String>,
        medication_id: impl Into<String>,
    ) -> Self {
        Self::new(RelationshipKind::TakesMedication, patient_id, medication_id)
    }

    /// Set one attribute, builder style.
    pub fn with(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn key(&self) -> RelationshipKey {
        RelationshipKey::new(self.kind, self.from_id.clone(), self.to_id.clone())
    }
}

// ── Typed builders ────────────────────────────────────────────────

/// The patient anchoring a subgraph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Patient {
    #[serde(skip_serializing)]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A diagnosed medical condition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Condition {
    #[serde(skip_serializing)]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icd_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symptoms: Option<Vec<String>>,
}

/// A prescribed medication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Medication {
    #[serde(skip_serializing)]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dosage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<Vec<String>>,
}

/// A published research article.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchArticle {
    #[serde(skip_serializing)]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publication_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "abstract", skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
}

/// A registered clinical trial.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClinicalTrial {
    #[serde(skip_serializing)]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interventions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrollment: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_date: Option<String>,
}

/// A `STUDIES` link from an article to a condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudiesLink {
    #[serde(skip_serializing)]
    pub article_id: String,
    #[serde(skip_serializing)]
    pub condition_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance: Option<Relevance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// An `INFORMS_MEDICATION_MANAGEMENT` link from an article to a medication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedicationEvidenceLink {
    #[serde(skip_serializing)]
    pub article_id: String,
    #[serde(skip_serializing)]
    pub medication_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medication_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Serialize a typed builder into an attribute bag, dropping unset fields.
fn attributes_of<T: Serialize>(entity: &T) -> Attributes {
    match serde_json::to_value(entity) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => Attributes::new(),
    }
}

macro_rules! node_spec_from {
    ($ty:ty, $kind:expr) => {
        impl From<$ty> for NodeSpec {
            fn from(entity: $ty) -> Self {
                let attributes = attributes_of(&entity);
                NodeSpec {
                    kind: $kind,
                    id: entity.id,
                    attributes,
                }
            }
        }
    };
}

node_spec_from!(Patient, NodeKind::Patient);
node_spec_from!(Condition, NodeKind::Condition);
node_spec_from!(Medication, NodeKind::Medication);
node_spec_from!(ResearchArticle, NodeKind::ResearchArticle);
node_spec_from!(ClinicalTrial, NodeKind::ClinicalTrial);

impl From<StudiesLink> for RelationshipSpec {
    fn from(link: StudiesLink) -> Self {
        let attributes = attributes_of(&link);
        RelationshipSpec {
            kind: RelationshipKind::Studies,
            from_id: link.article_id,
            to_id: link.condition_id,
            attributes,
        }
    }
}

impl From<MedicationEvidenceLink> for RelationshipSpec {
    fn from(link: MedicationEvidenceLink) -> Self {
        let attributes = attributes_of(&link);
        RelationshipSpec {
            kind: RelationshipKind::InformsMedicationManagement,
            from_id: link.article_id,
            to_id: link.medication_id,
            attributes,
        }
    }
}
