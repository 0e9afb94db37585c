//! Closed attribute schemas for every node and relationship kind.
//!
//! Stores call [`normalize_node`] / [`normalize_relationship`] before any
//! write. A spec that fails here is malformed and never reaches storage.

use serde_json::Value;

use crate::types::{Attributes, NodeKind, NodeSpec, RelationshipKind, RelationshipSpec, Relevance};

/// Keys managed by the store itself.
pub const RESERVED_KEYS: [&str; 3] = ["id", "created_at", "updated_at"];

/// Errors raised when a spec violates its kind's attribute schema.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("{owner} has an empty identifier")]
    EmptyId { owner: String },

    #[error("attribute '{name}' is managed by the store and cannot be supplied")]
    ReservedAttribute { name: String },

    #[error("{owner} has no attribute named '{name}'")]
    UnknownAttribute { owner: String, name: String },

    #[error("attribute '{name}' must be {expected}")]
    InvalidType { name: String, expected: &'static str },

    #[error("attribute '{name}' out of range [0, 1]: {value}")]
    OutOfRange { name: String, value: f64 },

    #[error("attribute '{name}' has invalid value '{value}'")]
    InvalidValue { name: String, value: String },
}

/// Value shape accepted for an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    Text,
    /// Ordered list of strings, kept verbatim.
    TextList,
    /// List of strings, de-duplicated preserving first occurrence.
    TextSet,
    /// Non-negative integer.
    Integer,
    /// Float in [0, 1].
    UnitInterval,
    /// One of the `STUDIES` relevance values.
    Relevance,
}

impl AttributeType {
    fn expected(&self) -> &'static str {
        match self {
            Self::Text | Self::Relevance => "a string",
            Self::TextList | Self::TextSet => "a list of strings",
            Self::Integer => "a non-negative integer",
            Self::UnitInterval => "a number",
        }
    }
}

type Schema = &'static [(&'static str, AttributeType)];

use AttributeType::*;

const PATIENT: Schema = &[("name", Text)];

const CONDITION: Schema = &[("label", Text), ("icd_code", Text), ("symptoms", TextSet)];

const MEDICATION: Schema = &[
    ("label", Text),
    ("dosage", Text),
    ("frequency", Text),
    ("side_effects", TextSet),
];

const RESEARCH_ARTICLE: Schema = &[
    ("title", Text),
    ("authors", TextList),
    ("publication_date", Text),
    ("journal", Text),
    ("url", Text),
    ("abstract", Text),
    ("keywords", TextSet),
];

const CLINICAL_TRIAL: Schema = &[
    ("title", Text),
    ("phase", Text),
    ("status", Text),
    ("conditions", TextSet),
    ("interventions", TextSet),
    ("url", Text),
    ("enrollment", Integer),
    ("start_date", Text),
    ("completion_date", Text),
];

const OWNERSHIP_EDGE: Schema = &[("notes", Text)];

const STUDIES: Schema = &[("relevance", AttributeType::Relevance), ("confidence", UnitInterval)];

const INFORMS_MEDICATION_MANAGEMENT: Schema = &[
    ("relevance", Text),
    ("confidence", UnitInterval),
    ("notes", Text),
    ("medication_name", Text),
];

/// The attribute schema of a node kind.
pub fn node_schema(kind: NodeKind) -> Schema {
    match kind {
        NodeKind::Patient => PATIENT,
        NodeKind::Condition => CONDITION,
        NodeKind::Medication => MEDICATION,
        NodeKind::ResearchArticle => RESEARCH_ARTICLE,
        NodeKind::ClinicalTrial => CLINICAL_TRIAL,
    }
}

/// The attribute schema of a relationship kind.
pub fn relationship_schema(kind: RelationshipKind) -> Schema {
    match kind {
        RelationshipKind::HasCondition | RelationshipKind::TakesMedication => OWNERSHIP_EDGE,
        RelationshipKind::Studies => STUDIES,
        RelationshipKind::InformsMedicationManagement => INFORMS_MEDICATION_MANAGEMENT,
    }
}

/// Validate a node spec and return its normalized attributes.
pub fn normalize_node(spec: &NodeSpec) -> Result<Attributes, SchemaError> {
    let owner = spec.kind.label();
    if spec.id.trim().is_empty() {
        return Err(SchemaError::EmptyId {
            owner: owner.to_string(),
        });
    }
    normalize(owner, node_schema(spec.kind), &spec.attributes)
}

/// Validate a relationship spec and return its normalized attributes.
pub fn normalize_relationship(spec: &RelationshipSpec) -> Result<Attributes, SchemaError> {
    let owner = spec.kind.rel_type();
    if spec.from_id.trim().is_empty() || spec.to_id.trim().is_empty() {
        return Err(SchemaError::EmptyId {
            owner: owner.to_string(),
        });
    }
    normalize(owner, relationship_schema(spec.kind), &spec.attributes)
}

fn normalize(owner: &str, schema: Schema, attributes: &Attributes) -> Result<Attributes, SchemaError> {
    let mut out = Attributes::new();
    for (name, value) in attributes {
        if RESERVED_KEYS.contains(&name.as_str()) {
            return Err(SchemaError::ReservedAttribute { name: name.clone() });
        }
        let ty = schema
            .iter()
            .find(|(n, _)| *n == name.as_str())
            .map(|(_, ty)| *ty)
            .ok_or_else(|| SchemaError::UnknownAttribute {
                owner: owner.to_string(),
                name: name.clone(),
            })?;
        out.insert(name.clone(), normalize_value(name, ty, value)?);
    }
    Ok(out)
}

fn normalize_value(name: &str, ty: AttributeType, value: &Value) -> Result<Value, SchemaError> {
    let invalid_type = || SchemaError::InvalidType {
        name: name.to_string(),
        expected: ty.expected(),
    };

    match ty {
        Text => value.as_str().map(|s| Value::String(s.to_string())).ok_or_else(invalid_type),
        TextList | TextSet => {
            let items = value.as_array().ok_or_else(invalid_type)?;
            let mut out: Vec<Value> = Vec::with_capacity(items.len());
            for item in items {
                let s = item.as_str().ok_or_else(invalid_type)?;
                if ty == TextSet && out.iter().any(|v| v.as_str() == Some(s)) {
                    continue;
                }
                out.push(Value::String(s.to_string()));
            }
            Ok(Value::Array(out))
        }
        Integer => value.as_u64().map(Value::from).ok_or_else(invalid_type),
        UnitInterval => {
            let v = value.as_f64().ok_or_else(invalid_type)?;
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(SchemaError::OutOfRange {
                    name: name.to_string(),
                    value: v,
                });
            }
            Ok(Value::from(v))
        }
        AttributeType::Relevance => {
            let s = value.as_str().ok_or_else(invalid_type)?;
            let relevance: crate::types::Relevance =
                s.parse().map_err(|_| SchemaError::InvalidValue {
                    name: name.to_string(),
                    value: s.to_string(),
                })?;
            Ok(Value::String(relevance.as_str().to_string()))
        }
    }
}

/// Default `relevance` written when a relationship is created without one.
pub fn default_relevance(kind: RelationshipKind) -> Option<&'static str> {
    match kind {
        RelationshipKind::Studies => Some(Relevance::default().as_str()),
        RelationshipKind::InformsMedicationManagement => Some("general"),
        _ => None,
    }
}
