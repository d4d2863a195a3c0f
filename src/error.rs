//! Error taxonomy for indexing, querying and statistics.
//!
//! Per-document failures ([`IndexError`]) are confined to the document that
//! produced them; the scheduler records them and moves on. Everything a caller
//! can observe synchronously is a [`SearchError`].

use crate::index::types::{DocId, ProjectId};
use std::io;
use thiserror::Error;

/// Text that cannot be turned into a token stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenizationError {
    #[error("document text is not valid UTF-8 (valid up to byte {valid_up_to})")]
    InvalidUtf8 { valid_up_to: usize },

    #[error("document looks binary (NUL byte at offset {offset})")]
    BinaryContent { offset: usize },

    #[error("document is too large to index ({len} bytes)")]
    TooLarge { len: usize },
}

/// Failure while building or storing the segment of one document
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("document {doc}: tokenization failed: {source}")]
    Tokenization {
        doc: DocId,
        #[source]
        source: TokenizationError,
    },

    #[error("document {doc}: malformed annotation graph: {reason}")]
    MalformedAnnotation { doc: DocId, reason: String },

    #[error("document {doc}: failed to write segment: {source}")]
    IndexWrite {
        doc: DocId,
        #[source]
        source: io::Error,
    },

    #[error("document {doc}: {source}")]
    DocumentUnavailable {
        doc: DocId,
        #[source]
        source: DocumentError,
    },
}

impl IndexError {
    /// Document the failure belongs to
    pub fn doc_id(&self) -> DocId {
        match self {
            IndexError::Tokenization { doc, .. }
            | IndexError::MalformedAnnotation { doc, .. }
            | IndexError::IndexWrite { doc, .. }
            | IndexError::DocumentUnavailable { doc, .. } => *doc,
        }
    }

    /// The document was deleted before it could be indexed
    pub fn is_document_gone(&self) -> bool {
        matches!(
            self,
            IndexError::DocumentUnavailable {
                source: DocumentError::NotFound { .. } | DocumentError::ProjectNotFound(_),
                ..
            }
        )
    }
}

/// Malformed query syntax. Positions are byte offsets into the query string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryParseError {
    #[error("query is empty")]
    Empty,

    #[error("unterminated quoted text starting at {pos}")]
    UnterminatedPhrase { pos: usize },

    #[error("unterminated structural query starting at {pos}")]
    UnterminatedStructural { pos: usize },

    #[error("invalid structural query at {pos}: {reason}")]
    InvalidStructural { pos: usize, reason: String },

    #[error("empty alternative at {pos}")]
    DanglingAlternative { pos: usize },

    #[error("unexpected character '{ch}' at {pos}")]
    UnexpectedChar { pos: usize, ch: char },
}

/// Failure reported by a document collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("document {doc} not found in project {project}")]
    NotFound { project: ProjectId, doc: DocId },

    #[error("project {0} not found")]
    ProjectNotFound(ProjectId),

    #[error("document storage error: {0}")]
    Storage(String),
}

/// Errors surfaced to callers of the search service
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("query parse error: {0}")]
    QueryParse(#[from] QueryParseError),

    #[error("index of project {project} is corrupt: {reason}")]
    IndexCorrupt { project: ProjectId, reason: String },

    #[error("index of project {project} not ready ({pending} documents pending)")]
    IndexNotReady { project: ProjectId, pending: usize },

    #[error("unknown statistic: {0}")]
    InvalidStatistic(String),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("search service is shutting down")]
    ShuttingDown,
}

impl SearchError {
    /// Whether the caller should simply retry later
    pub fn is_retriable(&self) -> bool {
        matches!(self, SearchError::IndexNotReady { .. })
    }
}

/// Result type alias for search service operations
pub type Result<T> = std::result::Result<T, SearchError>;
