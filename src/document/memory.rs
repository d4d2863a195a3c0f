//! In-memory document and schema services

use super::{
    AnnotationGraph, AnnotationSchemaService, DocumentEvent, DocumentInfo, DocumentService, LayerDef,
    SourceDocument,
};
use crate::error::DocumentError;
use crate::index::types::{AnnotationVariant, DocId, ProjectId, CURATION_USER};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

struct StoredDocument {
    source: SourceDocument,
    /// User name -> annotation graph
    annotations: BTreeMap<String, AnnotationGraph>,
}

#[derive(Default)]
struct ProjectDocuments {
    next_id: DocId,
    documents: BTreeMap<DocId, StoredDocument>,
}

/// Document store held entirely in memory. Every mutation returns the
/// event the search index must be told about.
#[derive(Default)]
pub struct MemoryDocumentService {
    projects: RwLock<HashMap<ProjectId, ProjectDocuments>>,
}

impl MemoryDocumentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new plain-text source document
    pub fn upload_source_document(
        &self,
        project: ProjectId,
        name: &str,
        content: impl Into<Vec<u8>>,
    ) -> (DocId, DocumentEvent) {
        let mut projects = self.projects.write();
        let docs = projects.entry(project).or_default();
        docs.next_id += 1;
        let id = docs.next_id;

        docs.documents.insert(
            id,
            StoredDocument {
                source: SourceDocument {
                    id,
                    project,
                    name: name.to_string(),
                    format: "text".to_string(),
                    content: content.into(),
                },
                annotations: BTreeMap::new(),
            },
        );

        (id, DocumentEvent::SourceDocumentUploaded { project, doc: id })
    }

    /// Annotation graph of `user`, created empty if it does not exist yet
    pub fn create_or_get_annotation_document(
        &self,
        project: ProjectId,
        doc: DocId,
        user: &str,
    ) -> Result<AnnotationGraph, DocumentError> {
        let mut projects = self.projects.write();
        let stored = stored_mut(&mut projects, project, doc)?;
        Ok(stored.annotations.entry(user.to_string()).or_default().clone())
    }

    /// Replace the annotation graph of `user`
    pub fn write_annotation_graph(
        &self,
        project: ProjectId,
        doc: DocId,
        user: &str,
        graph: AnnotationGraph,
    ) -> Result<DocumentEvent, DocumentError> {
        let mut projects = self.projects.write();
        let stored = stored_mut(&mut projects, project, doc)?;
        stored.annotations.insert(user.to_string(), graph);

        Ok(if user == CURATION_USER {
            DocumentEvent::CurationChanged { project, doc }
        } else {
            DocumentEvent::AnnotationWritten {
                project,
                doc,
                user: user.to_string(),
            }
        })
    }

    pub fn remove_source_document(&self, project: ProjectId, doc: DocId) -> Result<DocumentEvent, DocumentError> {
        let mut projects = self.projects.write();
        let docs = projects
            .get_mut(&project)
            .ok_or(DocumentError::ProjectNotFound(project))?;
        docs.documents
            .remove(&doc)
            .ok_or(DocumentError::NotFound { project, doc })?;
        Ok(DocumentEvent::SourceDocumentRemoved { project, doc })
    }
}

fn stored_mut(
    projects: &mut HashMap<ProjectId, ProjectDocuments>,
    project: ProjectId,
    doc: DocId,
) -> Result<&mut StoredDocument, DocumentError> {
    projects
        .get_mut(&project)
        .and_then(|p| p.documents.get_mut(&doc))
        .ok_or(DocumentError::NotFound { project, doc })
}

impl DocumentService for MemoryDocumentService {
    fn list_source_documents(&self, project: ProjectId) -> Result<Vec<DocumentInfo>, DocumentError> {
        let projects = self.projects.read();
        Ok(projects
            .get(&project)
            .map(|p| {
                p.documents
                    .values()
                    .map(|d| DocumentInfo {
                        id: d.source.id,
                        name: d.source.name.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_source_document(&self, project: ProjectId, doc: DocId) -> Result<SourceDocument, DocumentError> {
        let projects = self.projects.read();
        projects
            .get(&project)
            .and_then(|p| p.documents.get(&doc))
            .map(|d| d.source.clone())
            .ok_or(DocumentError::NotFound { project, doc })
    }

    fn list_annotation_variants(
        &self,
        project: ProjectId,
        doc: DocId,
    ) -> Result<Vec<AnnotationVariant>, DocumentError> {
        let projects = self.projects.read();
        let stored = projects
            .get(&project)
            .and_then(|p| p.documents.get(&doc))
            .ok_or(DocumentError::NotFound { project, doc })?;
        Ok(stored
            .annotations
            .keys()
            .map(|user| AnnotationVariant::for_user(user))
            .collect())
    }

    fn read_annotation_graph(
        &self,
        project: ProjectId,
        doc: DocId,
        variant: &AnnotationVariant,
    ) -> Result<AnnotationGraph, DocumentError> {
        let projects = self.projects.read();
        let stored = projects
            .get(&project)
            .and_then(|p| p.documents.get(&doc))
            .ok_or(DocumentError::NotFound { project, doc })?;

        match variant {
            AnnotationVariant::Initial => Ok(AnnotationGraph::new()),
            other => Ok(stored
                .annotations
                .get(other.name())
                .cloned()
                .unwrap_or_default()),
        }
    }
}

/// Layer catalogue held in memory
#[derive(Default)]
pub struct MemorySchemaService {
    layers: RwLock<HashMap<ProjectId, Vec<LayerDef>>>,
}

impl MemorySchemaService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the layers of a project
    pub fn set_layers(&self, project: ProjectId, layers: Vec<LayerDef>) -> DocumentEvent {
        self.layers.write().insert(project, layers);
        DocumentEvent::LayersChanged { project }
    }
}

impl AnnotationSchemaService for MemorySchemaService {
    fn list_layers(&self, project: ProjectId) -> Result<Vec<LayerDef>, DocumentError> {
        Ok(self.layers.read().get(&project).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SpanRecord;

    #[test]
    fn test_upload_assigns_ids_per_project() {
        let docs = MemoryDocumentService::new();
        let (a, ev) = docs.upload_source_document(1, "a.txt", "alpha");
        let (b, _) = docs.upload_source_document(1, "b.txt", "beta");
        let (c, _) = docs.upload_source_document(2, "c.txt", "gamma");

        assert_eq!((a, b, c), (1, 2, 1));
        assert_eq!(ev, DocumentEvent::SourceDocumentUploaded { project: 1, doc: 1 });
        assert_eq!(docs.list_source_documents(1).unwrap().len(), 2);
        assert!(docs.list_source_documents(9).unwrap().is_empty());
        assert_eq!(docs.get_source_document(1, 2).unwrap().content, b"beta");
    }

    #[test]
    fn test_annotation_variants() {
        let docs = MemoryDocumentService::new();
        let (doc, _) = docs.upload_source_document(1, "a.txt", "The capital of Galicia");

        let graph = docs.create_or_get_annotation_document(1, doc, "admin").unwrap();
        assert!(graph.is_empty());

        let mut graph = AnnotationGraph::new();
        graph.add_span(SpanRecord::new("Named entity", 15, 22).with_feature("value", "LOC"));
        let ev = docs.write_annotation_graph(1, doc, "admin", graph.clone()).unwrap();
        assert!(matches!(ev, DocumentEvent::AnnotationWritten { ref user, .. } if user == "admin"));

        let ev = docs.write_annotation_graph(1, doc, CURATION_USER, graph.clone()).unwrap();
        assert_eq!(ev, DocumentEvent::CurationChanged { project: 1, doc });

        let variants = docs.list_annotation_variants(1, doc).unwrap();
        assert!(variants.contains(&AnnotationVariant::Curation));
        assert!(variants.contains(&AnnotationVariant::User("admin".to_string())));

        let read = docs
            .read_annotation_graph(1, doc, &AnnotationVariant::User("admin".to_string()))
            .unwrap();
        assert_eq!(read, graph);
        assert!(docs
            .read_annotation_graph(1, doc, &AnnotationVariant::Initial)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_missing_documents() {
        let docs = MemoryDocumentService::new();
        assert_eq!(
            docs.get_source_document(1, 1),
            Err(DocumentError::NotFound { project: 1, doc: 1 })
        );
        assert_eq!(
            docs.remove_source_document(1, 1),
            Err(DocumentError::ProjectNotFound(1))
        );
    }
}
