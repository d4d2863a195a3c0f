//! Shared helpers for the integration tests

#![allow(dead_code)]

use annodex::config::SearchConfig;
use annodex::document::{
    AnnotationGraph, DocumentInfo, DocumentService, MemoryDocumentService, MemorySchemaService,
    SourceDocument,
};
use annodex::error::DocumentError;
use annodex::index::types::{AnnotationVariant, DocId, ProjectId};
use annodex::SearchService;
use parking_lot::{Condvar, Mutex};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const GALICIA: &str = "The capital of Galicia is Santiago de Compostela.";
pub const PORTUGAL: &str = "The capital of Portugal is Lissabon.";
pub const MOON: &str = "Goodbye moon. Hello World.";

/// Where a closed gate holds reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Source,
    Graph,
}

/// Document service that can hold builds before or after their document
/// reads until released, and counts the source reads per document
#[derive(Default)]
pub struct GatedDocuments {
    pub inner: MemoryDocumentService,
    closed: Mutex<Option<Gate>>,
    opened: Condvar,
    reads: Mutex<std::collections::HashMap<DocId, usize>>,
    waiting: AtomicUsize,
}

impl GatedDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block source reads until `open` is called
    pub fn close(&self) {
        *self.closed.lock() = Some(Gate::Source);
    }

    /// Hold builds once they have read their source and annotation graph
    pub fn hold_after_reads(&self) {
        *self.closed.lock() = Some(Gate::Graph);
    }

    pub fn open(&self) {
        *self.closed.lock() = None;
        self.opened.notify_all();
    }

    fn pass(&self, gate: Gate) {
        let mut closed = self.closed.lock();
        if *closed == Some(gate) {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            while *closed == Some(gate) {
                self.opened.wait(&mut closed);
            }
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Number of reads currently blocked
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn reads(&self, doc: DocId) -> usize {
        self.reads.lock().get(&doc).copied().unwrap_or(0)
    }

    /// Spin until `n` reads are blocked on the gate
    pub fn wait_for_blocked(&self, n: usize) {
        for _ in 0..1000 {
            if self.waiting() >= n {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("expected {} blocked reads, have {}", n, self.waiting());
    }
}

impl DocumentService for GatedDocuments {
    fn list_source_documents(&self, project: ProjectId) -> Result<Vec<DocumentInfo>, DocumentError> {
        self.inner.list_source_documents(project)
    }

    fn get_source_document(&self, project: ProjectId, doc: DocId) -> Result<SourceDocument, DocumentError> {
        *self.reads.lock().entry(doc).or_default() += 1;
        self.pass(Gate::Source);
        self.inner.get_source_document(project, doc)
    }

    fn list_annotation_variants(
        &self,
        project: ProjectId,
        doc: DocId,
    ) -> Result<Vec<AnnotationVariant>, DocumentError> {
        self.inner.list_annotation_variants(project, doc)
    }

    fn read_annotation_graph(
        &self,
        project: ProjectId,
        doc: DocId,
        variant: &AnnotationVariant,
    ) -> Result<AnnotationGraph, DocumentError> {
        let graph = self.inner.read_annotation_graph(project, doc, variant);
        self.pass(Gate::Graph);
        graph
    }
}

pub fn config(dir: &Path) -> SearchConfig {
    let mut config = SearchConfig::with_base_dir(dir);
    config.scheduler.workers = 2;
    config.scheduler.poll_interval_ms = 10;
    config.scheduler.poll_timeout_secs = 10;
    config
}

/// Service over plain in-memory collaborators
pub fn memory_service(
    dir: &Path,
) -> (SearchService, Arc<MemoryDocumentService>, Arc<MemorySchemaService>) {
    let docs = Arc::new(MemoryDocumentService::new());
    let schema = Arc::new(MemorySchemaService::new());
    let service = SearchService::new(config(dir), docs.clone(), schema.clone());
    (service, docs, schema)
}

/// Service whose source reads can be held back
pub fn gated_service(dir: &Path) -> (SearchService, Arc<GatedDocuments>, Arc<MemorySchemaService>) {
    let docs = Arc::new(GatedDocuments::new());
    let schema = Arc::new(MemorySchemaService::new());
    let service = SearchService::new(config(dir), docs.clone(), schema.clone());
    (service, docs, schema)
}

/// Upload a document and let the service react to it
pub fn upload(service: &SearchService, docs: &MemoryDocumentService, project: ProjectId, name: &str, text: &str) -> DocId {
    let (doc, event) = docs.upload_source_document(project, name, text);
    service.handle_event(event).unwrap();
    doc
}

pub fn wait(service: &SearchService, project: ProjectId) {
    service.await_index(project).unwrap();
}
