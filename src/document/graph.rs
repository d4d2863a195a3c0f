//! Annotation graph of one annotation document.
//!
//! Spans and relations live in flat arenas; relations refer to spans by
//! index, so a loaded graph has no reference cycles and rebuilding a segment
//! is a pure function of the source text and this arena.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Index of a span within [`AnnotationGraph::spans`]
pub type SpanId = u32;

/// Typed feature value as stored by the annotation editor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl FeatureValue {
    /// Value as indexed text; empty strings count as unset
    pub fn index_text(&self) -> Option<String> {
        match self {
            FeatureValue::Str(s) if s.is_empty() => None,
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Bool(b) => write!(f, "{}", b),
            FeatureValue::Int(i) => write!(f, "{}", i),
            FeatureValue::Float(x) => write!(f, "{}", x),
            FeatureValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for FeatureValue {
    fn from(s: &str) -> Self {
        FeatureValue::Str(s.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(s: String) -> Self {
        FeatureValue::Str(s)
    }
}

impl From<i64> for FeatureValue {
    fn from(i: i64) -> Self {
        FeatureValue::Int(i)
    }
}

impl From<bool> for FeatureValue {
    fn from(b: bool) -> Self {
        FeatureValue::Bool(b)
    }
}

/// Annotation over a character range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub layer: String,
    pub begin: u32,
    pub end: u32,
    #[serde(default)]
    pub features: BTreeMap<String, FeatureValue>,
}

impl SpanRecord {
    pub fn new(layer: impl Into<String>, begin: u32, end: u32) -> Self {
        Self {
            layer: layer.into(),
            begin,
            end,
            features: BTreeMap::new(),
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, value: impl Into<FeatureValue>) -> Self {
        self.features.insert(name.into(), value.into());
        self
    }
}

/// Directed link between two spans
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRecord {
    pub layer: String,
    pub source: SpanId,
    pub target: SpanId,
    #[serde(default)]
    pub features: BTreeMap<String, FeatureValue>,
}

impl RelationRecord {
    pub fn new(layer: impl Into<String>, source: SpanId, target: SpanId) -> Self {
        Self {
            layer: layer.into(),
            source,
            target,
            features: BTreeMap::new(),
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, value: impl Into<FeatureValue>) -> Self {
        self.features.insert(name.into(), value.into());
        self
    }
}

/// Arena of spans and relations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationGraph {
    #[serde(default)]
    pub spans: Vec<SpanRecord>,
    #[serde(default)]
    pub relations: Vec<RelationRecord>,
}

impl AnnotationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty() && self.relations.is_empty()
    }

    pub fn add_span(&mut self, span: SpanRecord) -> SpanId {
        self.spans.push(span);
        (self.spans.len() - 1) as SpanId
    }

    pub fn add_relation(&mut self, relation: RelationRecord) {
        self.relations.push(relation);
    }

    pub fn span(&self, id: SpanId) -> Option<&SpanRecord> {
        self.spans.get(id as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_ids() {
        let mut graph = AnnotationGraph::new();
        let gov = graph.add_span(SpanRecord::new("POS", 0, 3).with_feature("PosValue", "DT"));
        let dep = graph.add_span(SpanRecord::new("POS", 4, 11).with_feature("PosValue", "NN"));
        graph.add_relation(RelationRecord::new("Dependency", gov, dep).with_feature("DependencyType", "det"));

        assert_eq!(gov, 0);
        assert_eq!(dep, 1);
        assert_eq!(graph.span(dep).unwrap().begin, 4);
        assert!(graph.span(2).is_none());
    }

    #[test]
    fn test_json_feature_values() {
        let json = r#"{
            "spans": [
                {"layer": "Named entity", "begin": 15, "end": 22,
                 "features": {"value": "LOC", "identifier": "", "confidence": 0.5, "rank": 2, "negated": false}}
            ]
        }"#;
        let graph: AnnotationGraph = serde_json::from_str(json).unwrap();
        let features = &graph.spans[0].features;

        assert_eq!(features["value"], FeatureValue::Str("LOC".to_string()));
        assert_eq!(features["rank"], FeatureValue::Int(2));
        assert_eq!(features["confidence"].index_text().as_deref(), Some("0.5"));
        assert_eq!(features["negated"].index_text().as_deref(), Some("false"));
        assert_eq!(features["identifier"].index_text(), None);
        assert!(graph.relations.is_empty());
    }
}
