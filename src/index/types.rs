use crate::utils::tokenizer::{OffsetMap, TextSpan};
use roaring::RoaringBitmap;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of a project
pub type ProjectId = u64;

/// Identifier of a source document, unique within its project
pub type DocId = u64;

/// User name of the curated variant
pub const CURATION_USER: &str = "CURATION_USER";

/// Name of the variant built from the source text alone
pub const INITIAL_CAS: &str = "INITIAL_CAS";

/// Which annotation graph of a source document a segment is built from
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AnnotationVariant {
    /// Source text without user annotations
    Initial,
    /// Curated annotations
    Curation,
    /// One annotator's annotations
    User(String),
}

impl AnnotationVariant {
    /// Variant an annotation document of `user` maps to
    pub fn for_user(user: &str) -> Self {
        if user == CURATION_USER {
            AnnotationVariant::Curation
        } else {
            AnnotationVariant::User(user.to_string())
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AnnotationVariant::Initial => INITIAL_CAS,
            AnnotationVariant::Curation => CURATION_USER,
            AnnotationVariant::User(user) => user,
        }
    }

    /// Filesystem-safe name fragment
    pub fn file_slug(&self) -> String {
        match self {
            AnnotationVariant::Initial => "initial".to_string(),
            AnnotationVariant::Curation => "curation".to_string(),
            AnnotationVariant::User(user) => {
                let hex: String = user.bytes().map(|b| format!("{:02x}", b)).collect();
                format!("u-{}", hex)
            }
        }
    }
}

impl fmt::Display for AnnotationVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of one segment within a project
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentKey {
    pub doc: DocId,
    pub variant: AnnotationVariant,
}

impl SegmentKey {
    pub fn new(doc: DocId, variant: AnnotationVariant) -> Self {
        Self { doc, variant }
    }

    pub fn initial(doc: DocId) -> Self {
        Self::new(doc, AnnotationVariant::Initial)
    }

    /// Segment file name
    pub fn file_name(&self) -> String {
        format!("d{}-{}.seg", self.doc, self.variant.file_slug())
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.doc, self.variant)
    }
}

/// Lifecycle of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexState {
    NotIndexed,
    Queued,
    Indexing,
    Valid,
    Invalid,
}

impl IndexState {
    /// Queued or being indexed right now
    pub fn is_pending(&self) -> bool {
        matches!(self, IndexState::Queued | IndexState::Indexing)
    }
}

/// Which segments a read may see
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tolerance {
    /// Only segments in state `Valid`
    #[default]
    ValidOnly,
    /// Also the last committed segment of documents being reindexed
    LastCommitted,
}

impl Tolerance {
    pub fn admits(&self, state: IndexState) -> bool {
        match self {
            Tolerance::ValidOnly => state == IndexState::Valid,
            Tolerance::LastCommitted => state == IndexState::Valid || state.is_pending(),
        }
    }
}

/// Layer names compare with spaces and underscores treated as equal
pub fn normalize_layer_name(name: &str) -> String {
    name.trim().replace(' ', "_")
}

/// One annotation as stored in a segment
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexedAnnotation {
    pub span: TextSpan,
    pub layer: String,
    /// Feature name/value pairs sorted by name
    pub features: Vec<(String, String)>,
    /// Covered tokens `[token_begin, token_end)`
    pub token_begin: u32,
    pub token_end: u32,
}

impl IndexedAnnotation {
    pub fn feature(&self, name: &str) -> Option<&str> {
        self.features
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_layer(&self, normalized_layer: &str) -> bool {
        normalize_layer_name(&self.layer) == normalized_layer
    }
}

/// Indexed representation of one document variant. Never mutated after
/// construction; a reindex builds a fresh segment and swaps it in.
#[derive(Debug)]
pub struct Segment {
    pub key: SegmentKey,
    pub title: String,
    pub text: String,
    pub tokens: Vec<TextSpan>,
    pub sentences: Vec<TextSpan>,
    pub annotations: Vec<IndexedAnnotation>,
    offsets: OffsetMap,
    /// Token text -> token positions
    terms: FxHashMap<String, RoaringBitmap>,
}

impl Segment {
    pub fn new(
        key: SegmentKey,
        title: String,
        text: String,
        tokens: Vec<TextSpan>,
        sentences: Vec<TextSpan>,
        annotations: Vec<IndexedAnnotation>,
    ) -> Self {
        let offsets = OffsetMap::new(&text);

        let mut terms: FxHashMap<String, RoaringBitmap> = FxHashMap::default();
        for (i, token) in tokens.iter().enumerate() {
            let term = offsets.slice(&text, token.begin, token.end);
            terms.entry(term.to_string()).or_default().insert(i as u32);
        }

        Self {
            key,
            title,
            text,
            tokens,
            sentences,
            annotations,
            offsets,
            terms,
        }
    }

    pub fn doc_id(&self) -> DocId {
        self.key.doc
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn sentence_count(&self) -> usize {
        self.sentences.len()
    }

    pub fn char_len(&self) -> u32 {
        self.offsets.char_len()
    }

    /// Text between two char offsets
    pub fn slice(&self, begin: u32, end: u32) -> &str {
        self.offsets.slice(&self.text, begin, end)
    }

    pub fn token_text(&self, index: usize) -> &str {
        let t = self.tokens[index];
        self.slice(t.begin, t.end)
    }

    /// Positions of tokens whose text equals `term`
    pub fn term_positions(&self, term: &str) -> Option<&RoaringBitmap> {
        self.terms.get(term)
    }

    /// Number of distinct token texts
    pub fn term_count(&self) -> usize {
        self.terms.len()
    }
}

/// Project index metadata stored in meta.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub version: u32,
    pub project: ProjectId,
    pub created_at: u64,
    pub updated_at: u64,
}

impl IndexMeta {
    pub const VERSION: u32 = 1;
}

/// One query hit
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SearchResult {
    pub document_id: DocId,
    pub document_title: String,
    pub text: String,
    pub left_context: String,
    pub right_context: String,
    pub offset_start: u32,
    pub offset_end: u32,
    pub token_start: u32,
    pub token_length: u32,
}
