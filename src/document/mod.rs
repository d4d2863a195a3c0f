//! Document collaborators.
//!
//! The search index does not own documents. It reads source text and
//! annotation graphs through [`DocumentService`] and the layer catalogue
//! through [`AnnotationSchemaService`]. Mutations happen elsewhere and are
//! reported to the index as [`DocumentEvent`]s.
//!
//! ## Implementations
//!
//! - [`memory`] - In-memory services used by tests and the CLI
//! - [`corpus`] - Loads a directory of text and annotation files into memory

pub mod corpus;
pub mod graph;
pub mod memory;

pub use corpus::Corpus;
pub use graph::{AnnotationGraph, FeatureValue, RelationRecord, SpanId, SpanRecord};
pub use memory::{MemoryDocumentService, MemorySchemaService};

use crate::error::DocumentError;
use crate::index::types::{AnnotationVariant, DocId, ProjectId};
use serde::{Deserialize, Serialize};

/// Raw source document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    pub id: DocId,
    pub project: ProjectId,
    pub name: String,
    pub format: String,
    pub content: Vec<u8>,
}

/// Listing entry for a source document
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DocumentInfo {
    pub id: DocId,
    pub name: String,
}

/// Annotation layer and the features it defines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDef {
    pub name: String,
    #[serde(default)]
    pub features: Vec<String>,
}

impl LayerDef {
    pub fn new(name: impl Into<String>, features: &[&str]) -> Self {
        Self {
            name: name.into(),
            features: features.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// Read access to documents and annotation documents
pub trait DocumentService: Send + Sync {
    fn list_source_documents(&self, project: ProjectId) -> Result<Vec<DocumentInfo>, DocumentError>;

    fn get_source_document(&self, project: ProjectId, doc: DocId) -> Result<SourceDocument, DocumentError>;

    /// Annotation variants that exist for a document, excluding `Initial`
    fn list_annotation_variants(
        &self,
        project: ProjectId,
        doc: DocId,
    ) -> Result<Vec<AnnotationVariant>, DocumentError>;

    /// Annotation graph of one variant; `Initial` is always empty
    fn read_annotation_graph(
        &self,
        project: ProjectId,
        doc: DocId,
        variant: &AnnotationVariant,
    ) -> Result<AnnotationGraph, DocumentError>;
}

/// Layer catalogue of a project
pub trait AnnotationSchemaService: Send + Sync {
    fn list_layers(&self, project: ProjectId) -> Result<Vec<LayerDef>, DocumentError>;
}

/// Document mutation reported to the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    SourceDocumentUploaded { project: ProjectId, doc: DocId },
    AnnotationWritten { project: ProjectId, doc: DocId, user: String },
    CurationChanged { project: ProjectId, doc: DocId },
    /// Layers or features changed; every document must be reindexed
    LayersChanged { project: ProjectId },
    SourceDocumentRemoved { project: ProjectId, doc: DocId },
}

impl DocumentEvent {
    pub fn project(&self) -> ProjectId {
        match self {
            DocumentEvent::SourceDocumentUploaded { project, .. }
            | DocumentEvent::AnnotationWritten { project, .. }
            | DocumentEvent::CurationChanged { project, .. }
            | DocumentEvent::LayersChanged { project }
            | DocumentEvent::SourceDocumentRemoved { project, .. } => *project,
        }
    }
}
