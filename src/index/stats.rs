//! Statistics engine.
//!
//! Computes descriptive statistics of per-document counts (tokens,
//! sentences, annotations per layer feature, query hits) over the documents
//! of a project, optionally restricted to documents within a token range.

use crate::document::LayerDef;
use crate::error::{Result, SearchError};
use crate::index::types::*;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub const TOKEN_COUNT: &str = "Token Count";
pub const SENTENCE_COUNT: &str = "Sentence Count";
pub const PER_SENTENCE_PREFIX: &str = "per Sentence: ";

/// Result key of the total number of query hits
pub const HITS_KEY: &str = "Number of Hits";

/// A descriptive statistic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Statistic {
    N,
    Min,
    Max,
    Mean,
    Median,
    StandardDeviation,
}

impl Statistic {
    pub const ALL: [Statistic; 6] = [
        Statistic::N,
        Statistic::Min,
        Statistic::Max,
        Statistic::Mean,
        Statistic::Median,
        Statistic::StandardDeviation,
    ];

    /// Name used in metric specs
    pub fn name(&self) -> &'static str {
        match self {
            Statistic::N => "n",
            Statistic::Min => "min",
            Statistic::Max => "max",
            Statistic::Mean => "mean",
            Statistic::Median => "median",
            Statistic::StandardDeviation => "standarddeviation",
        }
    }

    /// Key of the statistic in a result map
    pub fn key(&self) -> &'static str {
        match self {
            Statistic::N => "Number of Documents",
            other => other.name(),
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Statistic {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Statistic::ALL
            .into_iter()
            .find(|stat| stat.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| SearchError::InvalidStatistic(wanted.to_string()))
    }
}

/// Parse a comma-separated list of statistic names
pub fn parse_statistics(spec: &str) -> Result<BTreeSet<Statistic>> {
    let stats = spec
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(Statistic::from_str)
        .collect::<Result<BTreeSet<_>>>()?;

    if stats.is_empty() {
        return Err(SearchError::InvalidStatistic(spec.to_string()));
    }
    Ok(stats)
}

/// Statistics of one metric, keyed by [`Statistic::key`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MetricStats {
    pub values: BTreeMap<String, f64>,
}

impl MetricStats {
    pub fn get(&self, stat: Statistic) -> Option<f64> {
        self.values.get(stat.key()).copied()
    }

    /// Total query hits, for query metrics
    pub fn hits(&self) -> Option<f64> {
        self.values.get(HITS_KEY).copied()
    }

    /// False if any requested statistic is undefined
    pub fn is_defined(&self) -> bool {
        self.values.values().all(|v| !v.is_nan())
    }
}

/// Statistics over the documents of a project
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsResult {
    pub project: ProjectId,
    pub user: String,
    pub query: Option<String>,
    pub min_tokens_per_doc: Option<u32>,
    pub max_tokens_per_doc: Option<u32>,
    pub statistics: BTreeSet<Statistic>,
    /// Documents within the token range
    pub documents: usize,
    pub results: BTreeMap<String, MetricStats>,
}

impl StatisticsResult {
    pub fn metric(&self, name: &str) -> Option<&MetricStats> {
        self.results.get(name)
    }

    /// Metrics whose statistics are all defined
    pub fn non_null_results(&self) -> BTreeMap<&str, &MetricStats> {
        self.results
            .iter()
            .filter(|(_, stats)| stats.is_defined())
            .map(|(name, stats)| (name.as_str(), stats))
            .collect()
    }
}

/// Describe a sample of per-document values. An empty sample has `n = 0`
/// and every other statistic NaN. The standard deviation is the
/// bias-corrected sample deviation (0 for a single value).
pub fn describe(values: &[f64], stats: &BTreeSet<Statistic>) -> MetricStats {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();

    let mean = if n == 0 {
        f64::NAN
    } else {
        sorted.iter().sum::<f64>() / n as f64
    };

    let mut out = MetricStats::default();
    for stat in stats {
        let value = match stat {
            Statistic::N => n as f64,
            _ if n == 0 => f64::NAN,
            Statistic::Min => sorted[0],
            Statistic::Max => sorted[n - 1],
            Statistic::Mean => mean,
            Statistic::Median => {
                if n % 2 == 1 {
                    sorted[n / 2]
                } else {
                    (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
                }
            }
            Statistic::StandardDeviation => {
                if n == 1 {
                    0.0
                } else {
                    let sq: f64 = sorted.iter().map(|v| (v - mean) * (v - mean)).sum();
                    (sq / (n - 1) as f64).sqrt()
                }
            }
        };
        out.values.insert(stat.key().to_string(), value);
    }
    out
}

/// Segments whose token count lies within `[min, max]`
pub fn filter_by_tokens(
    segments: Vec<Arc<Segment>>,
    min_tokens: Option<u32>,
    max_tokens: Option<u32>,
) -> Vec<Arc<Segment>> {
    segments
        .into_iter()
        .filter(|seg| {
            let tokens = seg.token_count() as u32;
            min_tokens.map_or(true, |min| tokens >= min) && max_tokens.map_or(true, |max| tokens <= max)
        })
        .collect()
}

/// An annotation count metric
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct LayerMetric {
    name: String,
    layer: String,
    feature: Option<String>,
}

impl LayerMetric {
    fn new(layer: &str, feature: Option<&str>) -> Self {
        let name = match feature {
            Some(f) => format!("{}.{}", layer, f),
            None => layer.to_string(),
        };
        Self {
            name,
            layer: normalize_layer_name(layer),
            feature: feature.map(str::to_string),
        }
    }

    fn count(&self, segment: &Segment) -> f64 {
        segment
            .annotations
            .iter()
            .filter(|a| a.is_layer(&self.layer))
            .filter(|a| self.feature.as_deref().map_or(true, |f| a.feature(f).is_some()))
            .count() as f64
    }
}

/// Layer metrics from the schema, or from the indexed annotations when the
/// project declares no layers
fn layer_metrics(layers: &[LayerDef], segments: &[Arc<Segment>]) -> Vec<LayerMetric> {
    let mut metrics = BTreeSet::new();

    if layers.is_empty() {
        for ann in segments.iter().flat_map(|s| s.annotations.iter()) {
            if ann.features.is_empty() {
                metrics.insert(LayerMetric::new(&ann.layer, None));
            }
            for (name, _) in &ann.features {
                metrics.insert(LayerMetric::new(&ann.layer, Some(name)));
            }
        }
    } else {
        for layer in layers {
            if layer.features.is_empty() {
                metrics.insert(LayerMetric::new(&layer.name, None));
            }
            for feature in &layer.features {
                metrics.insert(LayerMetric::new(&layer.name, Some(feature)));
            }
        }
    }

    metrics.into_iter().collect()
}

fn per_sentence(count: f64, segment: &Segment) -> f64 {
    match segment.sentence_count() {
        0 => 0.0,
        sentences => count / sentences as f64,
    }
}

/// Token, sentence and annotation statistics over `segments`
pub fn project_statistics(
    segments: &[Arc<Segment>],
    layers: &[LayerDef],
    stats: &BTreeSet<Statistic>,
) -> BTreeMap<String, MetricStats> {
    let layer_metrics = layer_metrics(layers, segments);

    // One row of raw counts per document: tokens, sentences, layer metrics
    let rows: Vec<Vec<f64>> = segments
        .par_iter()
        .map(|seg| {
            let mut row = Vec::with_capacity(layer_metrics.len() + 2);
            row.push(seg.token_count() as f64);
            row.push(seg.sentence_count() as f64);
            row.extend(layer_metrics.iter().map(|m| m.count(seg)));
            row
        })
        .collect();

    let column = |i: usize| -> Vec<f64> { rows.iter().map(|r| r[i]).collect() };
    let per_sentence_column = |i: usize| -> Vec<f64> {
        rows.iter()
            .zip(segments)
            .map(|(r, seg)| per_sentence(r[i], seg))
            .collect()
    };

    let mut results = BTreeMap::new();
    results.insert(TOKEN_COUNT.to_string(), describe(&column(0), stats));
    results.insert(SENTENCE_COUNT.to_string(), describe(&column(1), stats));
    results.insert(
        format!("{}{}", PER_SENTENCE_PREFIX, TOKEN_COUNT),
        describe(&per_sentence_column(0), stats),
    );

    for (i, metric) in layer_metrics.iter().enumerate() {
        results.insert(metric.name.clone(), describe(&column(i + 2), stats));
        results.insert(
            format!("{}{}", PER_SENTENCE_PREFIX, metric.name),
            describe(&per_sentence_column(i + 2), stats),
        );
    }

    results
}

/// Hit statistics of a query over `segments`. `hits` holds the hit count of
/// each segment, in the same order.
pub fn query_statistics(
    query: &str,
    segments: &[Arc<Segment>],
    hits: &[usize],
    stats: &BTreeSet<Statistic>,
) -> BTreeMap<String, MetricStats> {
    let total: usize = hits.iter().sum();
    let counts: Vec<f64> = hits.iter().map(|&h| h as f64).collect();
    let per_sentence_counts: Vec<f64> = counts
        .iter()
        .zip(segments)
        .map(|(&c, seg)| per_sentence(c, seg))
        .collect();

    let mut results = BTreeMap::new();
    for (name, values) in [
        (query.to_string(), counts),
        (format!("{}{}", PER_SENTENCE_PREFIX, query), per_sentence_counts),
    ] {
        let mut metric = describe(&values, stats);
        metric.values.insert(HITS_KEY.to_string(), total as f64);
        results.insert(name, metric);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{AnnotationGraph, SourceDocument, SpanRecord};
    use crate::index::writer::IndexWriter;

    fn all() -> BTreeSet<Statistic> {
        Statistic::ALL.into_iter().collect()
    }

    fn segment(id: DocId, text: &str, graph: &AnnotationGraph) -> Arc<Segment> {
        let source = SourceDocument {
            id,
            project: 1,
            name: format!("doc{}", id),
            format: "text".to_string(),
            content: text.as_bytes().to_vec(),
        };
        Arc::new(
            IndexWriter::new(1 << 20)
                .index_document(&source, graph, &AnnotationVariant::Initial, &[])
                .unwrap(),
        )
    }

    fn corpus() -> Vec<Arc<Segment>> {
        let mut ne = AnnotationGraph::new();
        ne.add_span(SpanRecord::new("Named entity", 15, 22).with_feature("value", "LOC"));
        ne.add_span(SpanRecord::new("Named entity", 26, 48).with_feature("value", "LOC"));
        vec![
            segment(1, "The capital of Galicia is Santiago de Compostela.", &ne),
            segment(2, "Goodbye moon. Hello World.", &AnnotationGraph::new()),
        ]
    }

    fn assert_close(actual: Option<f64>, expected: f64) {
        let actual = actual.unwrap();
        assert!((actual - expected).abs() < 1e-9, "{} != {}", actual, expected);
    }

    #[test]
    fn test_parse_statistics() {
        let stats = parse_statistics("n, MIN,max,mean,median,StandardDeviation").unwrap();
        assert_eq!(stats.len(), 6);
        assert!(matches!(
            parse_statistics("n,mode"),
            Err(SearchError::InvalidStatistic(s)) if s == "mode"
        ));
        assert!(parse_statistics(" , ").is_err());
    }

    #[test]
    fn test_describe() {
        let m = describe(&[9.0, 6.0], &all());
        assert_close(m.get(Statistic::N), 2.0);
        assert_close(m.get(Statistic::Min), 6.0);
        assert_close(m.get(Statistic::Max), 9.0);
        assert_close(m.get(Statistic::Mean), 7.5);
        assert_close(m.get(Statistic::Median), 7.5);
        assert_close(m.get(Statistic::StandardDeviation), 4.5f64.sqrt());

        let m = describe(&[3.0, 1.0, 2.0], &all());
        assert_close(m.get(Statistic::Median), 2.0);

        let m = describe(&[4.0], &all());
        assert_close(m.get(Statistic::StandardDeviation), 0.0);
    }

    #[test]
    fn test_describe_empty_is_undefined() {
        let m = describe(&[], &all());
        assert_close(m.get(Statistic::N), 0.0);
        assert!(m.get(Statistic::Mean).unwrap().is_nan());
        assert!(m.get(Statistic::StandardDeviation).unwrap().is_nan());
        assert!(!m.is_defined());
    }

    #[test]
    fn test_project_statistics() {
        let layers = vec![LayerDef::new("Named entity", &["value"])];
        let results = project_statistics(&corpus(), &layers, &all());

        let names: Vec<&str> = results.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec![
                "Named entity.value",
                "Sentence Count",
                "Token Count",
                "per Sentence: Named entity.value",
                "per Sentence: Token Count",
            ]
        );

        let ne = &results["Named entity.value"];
        assert_close(ne.get(Statistic::Min), 0.0);
        assert_close(ne.get(Statistic::Max), 2.0);
        assert_close(ne.get(Statistic::StandardDeviation), 2f64.sqrt());

        let sentences = &results["Sentence Count"];
        assert_close(sentences.get(Statistic::Median), 1.5);
        assert_close(sentences.get(Statistic::StandardDeviation), 0.5f64.sqrt());

        let per_sentence = &results["per Sentence: Token Count"];
        assert_close(per_sentence.get(Statistic::Min), 3.0);
        assert_close(per_sentence.get(Statistic::Mean), 6.0);
        assert_close(per_sentence.get(Statistic::StandardDeviation), 18f64.sqrt());
    }

    #[test]
    fn test_layer_metrics_without_schema() {
        let results = project_statistics(&corpus(), &[], &all());
        assert!(results.contains_key("Named entity.value"));
    }

    #[test]
    fn test_query_statistics() {
        let segments = corpus();
        let results = query_statistics("moon", &segments, &[0, 1], &all());

        let moon = &results["moon"];
        assert_close(moon.get(Statistic::Median), 0.5);
        assert_close(moon.get(Statistic::StandardDeviation), 0.5f64.sqrt());
        assert_close(moon.hits(), 1.0);

        let per_sentence = &results["per Sentence: moon"];
        assert_close(per_sentence.get(Statistic::Max), 0.5);
        assert_close(per_sentence.get(Statistic::Median), 0.25);
        assert_close(per_sentence.get(Statistic::StandardDeviation), 0.125f64.sqrt());
        assert_close(per_sentence.hits(), 1.0);
    }

    #[test]
    fn test_filter_by_tokens() {
        assert_eq!(filter_by_tokens(corpus(), Some(7), None).len(), 1);
        assert_eq!(filter_by_tokens(corpus(), None, Some(6)).len(), 1);
        assert_eq!(filter_by_tokens(corpus(), Some(6), Some(9)).len(), 2);
        assert!(filter_by_tokens(corpus(), Some(10), None).is_empty());
    }
}
