use crate::config::QuerySettings;
use crate::index::types::*;
use crate::query::parser::{AnnotationPattern, Element, Query, Sequence};
use lru::LruCache;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// A match before it is turned into a [`SearchResult`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Hit {
    char_start: u32,
    char_end: u32,
    token_start: u32,
    token_end: u32,
    structural: bool,
}

/// Cache key of one query execution
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub project: ProjectId,
    pub user: String,
    pub query: String,
    pub scope: Option<DocId>,
    pub tolerance: Tolerance,
}

struct CachedResults {
    generation: u64,
    results: Arc<Vec<SearchResult>>,
}

/// Executes parsed queries against segments
pub struct QueryEngine {
    context_tokens: usize,
    context_chars: usize,
    cache: Option<Mutex<LruCache<CacheKey, CachedResults>>>,
}

impl QueryEngine {
    pub fn new(settings: &QuerySettings) -> Self {
        Self {
            context_tokens: settings.context_tokens,
            context_chars: settings.context_chars,
            cache: NonZeroUsize::new(settings.cache_size).map(|n| Mutex::new(LruCache::new(n))),
        }
    }

    /// Run a query over a set of segments. Segments are searched in
    /// parallel; results are grouped by document in document id order and
    /// ordered by offset within a document.
    pub fn execute(&self, segments: &[Arc<Segment>], query: &Query) -> Vec<SearchResult> {
        let mut per_doc: Vec<(DocId, Vec<SearchResult>)> = segments
            .par_iter()
            .map(|seg| (seg.doc_id(), self.search_segment(seg, query)))
            .collect();
        per_doc.sort_by_key(|(doc, _)| *doc);
        per_doc.into_iter().flat_map(|(_, results)| results).collect()
    }

    /// All hits of a query in one segment, ordered by offset
    pub fn search_segment(&self, segment: &Segment, query: &Query) -> Vec<SearchResult> {
        collect_hits(segment, query)
            .into_iter()
            .map(|hit| self.to_result(segment, hit))
            .collect()
    }

    /// Number of distinct hits of a query in one segment
    pub fn count_hits(&self, segment: &Segment, query: &Query) -> usize {
        collect_hits(segment, query).len()
    }

    fn to_result(&self, segment: &Segment, hit: Hit) -> SearchResult {
        let (text, left_context, right_context) = if hit.structural {
            (String::new(), String::new(), String::new())
        } else {
            (
                segment.slice(hit.char_start, hit.char_end).to_string(),
                self.left_context(segment, &hit),
                self.right_context(segment, &hit),
            )
        };

        SearchResult {
            document_id: segment.doc_id(),
            document_title: segment.title.clone(),
            text,
            left_context,
            right_context,
            offset_start: hit.char_start,
            offset_end: hit.char_end,
            token_start: hit.token_start,
            token_length: hit.token_end - hit.token_start,
        }
    }

    /// Up to `context_tokens` tokens before the hit, keeping at most
    /// `context_chars` chars closest to it
    fn left_context(&self, segment: &Segment, hit: &Hit) -> String {
        let start = hit.token_start as usize;
        if start == 0 || self.context_tokens == 0 {
            return String::new();
        }
        let from = segment.tokens[start.saturating_sub(self.context_tokens)].begin;
        let context = segment.slice(from, hit.char_start);
        keep_last_chars(context, self.context_chars).to_string()
    }

    fn right_context(&self, segment: &Segment, hit: &Hit) -> String {
        let end = hit.token_end as usize;
        let n = segment.token_count();
        if end >= n || self.context_tokens == 0 {
            return String::new();
        }
        let to = segment.tokens[(end + self.context_tokens).min(n) - 1].end;
        let context = segment.slice(hit.char_end, to);
        keep_first_chars(context, self.context_chars).to_string()
    }

    /// Cached results, if still current for `generation`
    pub fn cached(&self, key: &CacheKey, generation: u64) -> Option<Arc<Vec<SearchResult>>> {
        let mut cache = self.cache.as_ref()?.lock();
        let entry = cache.get(key).map(|e| (e.generation, e.results.clone()));
        match entry {
            Some((stamp, results)) if stamp == generation => Some(results),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn store(&self, key: CacheKey, generation: u64, results: Arc<Vec<SearchResult>>) {
        if let Some(cache) = &self.cache {
            cache.lock().put(key, CachedResults { generation, results });
        }
    }
}

fn keep_last_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    match s.char_indices().nth(count - max) {
        Some((i, _)) => &s[i..],
        None => "",
    }
}

fn keep_first_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Distinct hits of every alternative, in offset order
fn collect_hits(segment: &Segment, query: &Query) -> BTreeSet<Hit> {
    query
        .alternatives
        .iter()
        .flat_map(|seq| match_sequence(segment, seq))
        .collect()
}

/// Partial match: tokens `[token_start, token_end)` consumed so far
#[derive(Clone, Copy)]
struct Partial {
    token_start: u32,
    token_end: u32,
    char_start: u32,
    char_end: u32,
}

fn match_sequence(segment: &Segment, seq: &Sequence) -> Vec<Hit> {
    let Some((first, rest)) = seq.elements.split_first() else {
        return Vec::new();
    };

    let mut partials: Vec<Partial> = start_candidates(segment, first);
    for element in rest {
        if partials.is_empty() {
            break;
        }
        partials = partials
            .into_iter()
            .flat_map(|p| {
                matches_at(segment, element, p.token_end)
                    .into_iter()
                    .map(move |next| Partial {
                        token_start: p.token_start,
                        token_end: next.token_end,
                        char_start: p.char_start,
                        char_end: next.char_end,
                    })
            })
            .collect();
    }

    let structural = seq.is_structural();
    partials
        .into_iter()
        .map(|p| Hit {
            char_start: p.char_start,
            char_end: p.char_end,
            token_start: p.token_start,
            token_end: p.token_end,
            structural,
        })
        .collect()
}

/// Every place the first element of a sequence matches
fn start_candidates(segment: &Segment, element: &Element) -> Vec<Partial> {
    match element {
        Element::Token(term) => segment
            .term_positions(term)
            .map(|positions| {
                positions
                    .iter()
                    .map(|pos| token_partial(segment, pos))
                    .collect()
            })
            .unwrap_or_default(),
        Element::Annotation(pattern) => segment
            .annotations
            .iter()
            .filter(|a| a.token_end > a.token_begin && annotation_matches(a, pattern))
            .map(annotation_partial)
            .collect(),
    }
}

/// Matches of an element starting exactly at token `pos`
fn matches_at(segment: &Segment, element: &Element, pos: u32) -> Vec<Partial> {
    match element {
        Element::Token(term) => {
            let found = segment
                .term_positions(term)
                .is_some_and(|positions| positions.contains(pos));
            if found {
                vec![token_partial(segment, pos)]
            } else {
                Vec::new()
            }
        }
        Element::Annotation(pattern) => {
            // Annotations are sorted by span, hence by first token
            let first = segment.annotations.partition_point(|a| a.token_begin < pos);
            segment.annotations[first..]
                .iter()
                .take_while(|a| a.token_begin == pos)
                .filter(|a| a.token_end > a.token_begin && annotation_matches(a, pattern))
                .map(annotation_partial)
                .collect()
        }
    }
}

fn token_partial(segment: &Segment, pos: u32) -> Partial {
    let token = segment.tokens[pos as usize];
    Partial {
        token_start: pos,
        token_end: pos + 1,
        char_start: token.begin,
        char_end: token.end,
    }
}

fn annotation_partial(ann: &IndexedAnnotation) -> Partial {
    Partial {
        token_start: ann.token_begin,
        token_end: ann.token_end,
        char_start: ann.span.begin,
        char_end: ann.span.end,
    }
}

fn annotation_matches(ann: &IndexedAnnotation, pattern: &AnnotationPattern) -> bool {
    if !ann.is_layer(&pattern.layer) {
        return false;
    }
    match (&pattern.feature, &pattern.value) {
        (None, _) => true,
        (Some(feature), None) => ann.feature(feature).is_some(),
        (Some(feature), Some(value)) => ann.feature(feature) == Some(value.as_str()),
    }
}
