//! Search service facade.
//!
//! [`SearchService`] owns the per-project indexes, the state tracker, the
//! reindex scheduler and the query engine. Document mutations come in as
//! [`DocumentEvent`]s; queries and statistics read whatever is committed.

use crate::config::SearchConfig;
use crate::document::{AnnotationSchemaService, DocumentEvent, DocumentService, LayerDef};
use crate::error::{IndexError, Result, SearchError};
use crate::index::reader::{wipe_project_index, IndexRegistry, ProjectIndex};
use crate::index::state::IndexStateTracker;
use crate::index::stats::{
    filter_by_tokens, parse_statistics, project_statistics, query_statistics, StatisticsResult,
};
use crate::index::types::{
    AnnotationVariant, DocId, IndexState, ProjectId, SearchResult, Segment, SegmentKey, Tolerance,
};
use crate::index::writer::{input_fingerprint, IndexWriter};
use crate::query::{parse_query, CacheKey, Query, QueryEngine};
use crate::scheduler::{IndexTask, ReindexReason, Scheduler, TaskRunner};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A segment build that failed and has not been retried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTask {
    pub doc: DocId,
    pub variant: AnnotationVariant,
    pub cause: String,
}

/// Summary of one project's index
#[derive(Debug, Clone)]
pub struct IndexStatus {
    pub project: ProjectId,
    pub index_path: PathBuf,
    pub segments: usize,
    pub valid: usize,
    pub invalid: usize,
    pub pending: usize,
}

/// Builds segments for the scheduler workers
struct Indexer {
    documents: Arc<dyn DocumentService>,
    schema: Arc<dyn AnnotationSchemaService>,
    registry: Arc<IndexRegistry>,
    tracker: Arc<IndexStateTracker>,
    writer: IndexWriter,
}

impl TaskRunner for Indexer {
    fn run(&self, task: &IndexTask) -> std::result::Result<(), IndexError> {
        let doc = task.key.doc;
        let unavailable = |source| IndexError::DocumentUnavailable { doc, source };

        let Some(index) = self.registry.get(task.project) else {
            return Err(IndexError::IndexWrite {
                doc,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "project index is closed"),
            });
        };

        let source = self
            .documents
            .get_source_document(task.project, doc)
            .map_err(unavailable)?;
        let graph = self
            .documents
            .read_annotation_graph(task.project, doc, &task.key.variant)
            .map_err(unavailable)?;
        let layers = self.schema.list_layers(task.project).map_err(unavailable)?;
        let fingerprint = input_fingerprint(&source, &graph, &layers);

        let segment = self
            .writer
            .index_document(&source, &graph, &task.key.variant, &layers)?;
        index
            .commit(segment)
            .map_err(|source| IndexError::IndexWrite { doc, source })?;
        self.tracker.set_fingerprint(task.project, &task.key, fingerprint);
        Ok(())
    }

    fn discard(&self, task: &IndexTask) {
        if let Some(index) = self.registry.get(task.project) {
            if let Err(e) = index.remove_segment(&task.key) {
                tracing::warn!(project = task.project, key = %task.key, error = %e, "failed to delete discarded segment");
            }
        }
    }

    fn committed(&self, project: ProjectId) {
        if let Some(index) = self.registry.get(project) {
            if let Err(e) = index.save_state(&self.tracker) {
                tracing::warn!(project, error = %e, "failed to persist index state");
            }
        }
    }
}

/// Project-scoped annotation search
pub struct SearchService {
    config: SearchConfig,
    documents: Arc<dyn DocumentService>,
    tracker: Arc<IndexStateTracker>,
    registry: Arc<IndexRegistry>,
    schema: Arc<dyn AnnotationSchemaService>,
    engine: QueryEngine,
    scheduler: Scheduler,
    open_lock: Mutex<()>,
}

impl SearchService {
    pub fn new(
        config: SearchConfig,
        documents: Arc<dyn DocumentService>,
        schema: Arc<dyn AnnotationSchemaService>,
    ) -> Self {
        let tracker = Arc::new(IndexStateTracker::new());
        let registry = Arc::new(IndexRegistry::new());

        let indexer = Arc::new(Indexer {
            documents: documents.clone(),
            schema: schema.clone(),
            registry: registry.clone(),
            tracker: tracker.clone(),
            writer: IndexWriter::new(config.index.max_document_bytes),
        });
        let scheduler = Scheduler::start(
            config.scheduler.effective_workers(),
            tracker.clone(),
            indexer,
        );
        let engine = QueryEngine::new(&config.query);

        Self {
            config,
            documents,
            tracker,
            registry,
            schema,
            engine,
            scheduler,
            open_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Directory holding a project's index
    pub fn project_index_path(&self, project: ProjectId) -> PathBuf {
        self.config.index.base_dir.join(format!("project-{}", project))
    }

    /// Open a project's index and queue whatever is missing from it.
    ///
    /// A corrupt index is wiped and rebuilt from scratch in the background;
    /// the corruption is still reported to the caller.
    pub fn open_project(&self, project: ProjectId) -> Result<Arc<ProjectIndex>> {
        if let Some(index) = self.registry.get(project) {
            return Ok(index);
        }
        let _guard = self.open_lock.lock();
        if let Some(index) = self.registry.get(project) {
            return Ok(index);
        }

        let path = self.project_index_path(project);
        match ProjectIndex::open(&path, project, &self.tracker) {
            Ok(index) => {
                let index = self.registry.insert(index);
                let queued = self.reconcile(&index)?;
                tracing::info!(
                    project,
                    segments = index.segment_count(),
                    queued,
                    "project index opened"
                );
                Ok(index)
            }
            Err(SearchError::IndexCorrupt { project, reason }) => {
                tracing::error!(project, %reason, "index is corrupt, rebuilding");
                self.tracker.clear_project(project);
                wipe_project_index(&path)?;
                let index = self.registry.insert(ProjectIndex::open(&path, project, &self.tracker)?);
                self.reindex_all(&index, ReindexReason::Recovery)?;
                Err(SearchError::IndexCorrupt { project, reason })
            }
            Err(e) => Err(e),
        }
    }

    /// Every key a project's documents should have a segment for
    fn expected_keys(&self, project: ProjectId) -> Result<Vec<SegmentKey>> {
        let mut keys = Vec::new();
        for info in self.documents.list_source_documents(project)? {
            keys.push(SegmentKey::initial(info.id));
            for variant in self.documents.list_annotation_variants(project, info.id)? {
                keys.push(SegmentKey::new(info.id, variant));
            }
        }
        Ok(keys)
    }

    /// Fingerprint of what a key would be built from now, if its inputs can
    /// be read
    fn current_fingerprint(&self, project: ProjectId, key: &SegmentKey, layers: &[LayerDef]) -> Option<u32> {
        let source = self.documents.get_source_document(project, key.doc).ok()?;
        let graph = self
            .documents
            .read_annotation_graph(project, key.doc, &key.variant)
            .ok()?;
        Some(input_fingerprint(&source, &graph, layers))
    }

    /// Bring the stored index in line with the document store: queue keys
    /// without a segment or built from outdated input, and drop documents
    /// that no longer exist
    fn reconcile(&self, index: &ProjectIndex) -> Result<usize> {
        let project = index.project();
        let expected = self.expected_keys(project)?;
        let docs: HashSet<DocId> = expected.iter().map(|k| k.doc).collect();

        let stale: BTreeSet<DocId> = index
            .snapshot()
            .keys()
            .map(|k| k.doc)
            .chain(self.tracker.snapshot(project).into_iter().map(|(k, _)| k.doc))
            .filter(|doc| !docs.contains(doc))
            .collect();
        for doc in &stale {
            index.remove_document(*doc)?;
            self.tracker.remove_document(project, *doc);
        }
        if !stale.is_empty() {
            tracing::info!(project, removed = stale.len(), "dropped segments of deleted documents");
            index.save_state(&self.tracker)?;
        }

        let layers = self.schema.list_layers(project)?;
        let mut queued = 0;
        for key in expected {
            let reason = match self.tracker.state(project, &key) {
                IndexState::NotIndexed => ReindexReason::Recovery,
                IndexState::Valid if index.get(&key).is_none() => ReindexReason::Recovery,
                IndexState::Valid
                    if self.tracker.fingerprint(project, &key)
                        != self.current_fingerprint(project, &key, &layers) =>
                {
                    ReindexReason::Stale
                }
                _ => continue,
            };
            if self.scheduler.enqueue(project, key, reason) {
                queued += 1;
            }
        }
        Ok(queued)
    }

    fn reindex_all(&self, index: &ProjectIndex, reason: ReindexReason) -> Result<usize> {
        let project = index.project();
        let queued = self
            .expected_keys(project)?
            .into_iter()
            .filter(|key| self.scheduler.enqueue(project, key.clone(), reason))
            .count();
        tracing::info!(project, queued, %reason, "full reindex queued");
        Ok(queued)
    }

    /// Queue a build of one document variant
    pub fn enqueue(
        &self,
        project: ProjectId,
        doc: DocId,
        variant: AnnotationVariant,
        reason: ReindexReason,
    ) -> Result<bool> {
        self.open_project(project)?;
        Ok(self.scheduler.enqueue(project, SegmentKey::new(doc, variant), reason))
    }

    /// React to a change in the document store
    pub fn handle_event(&self, event: DocumentEvent) -> Result<()> {
        let project = event.project();
        let index = self.open_project(project)?;

        match event {
            DocumentEvent::SourceDocumentUploaded { doc, .. } => {
                self.scheduler
                    .enqueue(project, SegmentKey::initial(doc), ReindexReason::Upload);
            }
            DocumentEvent::AnnotationWritten { doc, user, .. } => {
                let key = SegmentKey::new(doc, AnnotationVariant::for_user(&user));
                self.scheduler.enqueue(project, key, ReindexReason::AnnotationWrite);
            }
            DocumentEvent::CurationChanged { doc, .. } => {
                let key = SegmentKey::new(doc, AnnotationVariant::Curation);
                self.scheduler.enqueue(project, key, ReindexReason::CurationChange);
            }
            DocumentEvent::LayersChanged { .. } => {
                self.reindex_all(&index, ReindexReason::SchemaChange)?;
            }
            DocumentEvent::SourceDocumentRemoved { doc, .. } => {
                // Tracker first: a build finishing after this point is discarded
                self.tracker.remove_document(project, doc);
                index.remove_document(doc)?;
                index.save_state(&self.tracker)?;
                tracing::debug!(project, doc, "document removed from index");
            }
        }
        Ok(())
    }

    /// Queue every document variant of a project for rebuilding
    pub fn rebuild_project(&self, project: ProjectId) -> Result<usize> {
        let index = self.open_project(project)?;
        self.reindex_all(&index, ReindexReason::Rebuild)
    }

    /// Segments a user's queries read. Per document this is the user's own
    /// variant once it has been committed, otherwise the initial variant.
    fn readable_segments(
        &self,
        index: &ProjectIndex,
        user: &str,
        scope: Option<DocId>,
        tolerance: Tolerance,
    ) -> Vec<Arc<Segment>> {
        let project = index.project();
        let snapshot = index.snapshot();
        let user_variant = AnnotationVariant::for_user(user);

        let docs: BTreeSet<DocId> = snapshot
            .keys()
            .map(|k| k.doc)
            .filter(|doc| scope.is_none_or(|s| s == *doc))
            .collect();

        docs.into_iter()
            .filter_map(|doc| {
                let own = SegmentKey::new(doc, user_variant.clone());
                if let Some(segment) = snapshot.get(&own) {
                    let state = self.tracker.state(project, &own);
                    if state != IndexState::NotIndexed {
                        return tolerance.admits(state).then(|| segment.clone());
                    }
                }
                let initial = SegmentKey::initial(doc);
                if !tolerance.admits(self.tracker.state(project, &initial)) {
                    return None;
                }
                snapshot.get(&initial).cloned()
            })
            .collect()
    }

    pub fn query(
        &self,
        user: &str,
        project: ProjectId,
        query: &str,
        scope: Option<DocId>,
    ) -> Result<Vec<SearchResult>> {
        self.query_with(user, project, query, scope, Tolerance::default())
    }

    /// Run a query over the project (or one document of it) as seen by `user`
    pub fn query_with(
        &self,
        user: &str,
        project: ProjectId,
        query: &str,
        scope: Option<DocId>,
        tolerance: Tolerance,
    ) -> Result<Vec<SearchResult>> {
        let parsed = parse_query(query)?;
        let index = self.open_project(project)?;

        let key = CacheKey {
            project,
            user: user.to_string(),
            query: query.to_string(),
            scope,
            tolerance,
        };
        let generation = self.tracker.generation(project);
        if let Some(results) = self.engine.cached(&key, generation) {
            return Ok(results.as_ref().clone());
        }

        let start = Instant::now();
        let segments = self.readable_segments(&index, user, scope, tolerance);
        let results = self.engine.execute(&segments, &parsed);
        tracing::debug!(
            project,
            user,
            query,
            documents = segments.len(),
            hits = results.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "query executed"
        );

        let results = Arc::new(results);
        self.engine.store(key, generation, results.clone());
        Ok(results.as_ref().clone())
    }

    fn statistics_segments(
        &self,
        project: ProjectId,
        user: &str,
        min_tokens: Option<u32>,
        max_tokens: Option<u32>,
    ) -> Result<Vec<Arc<Segment>>> {
        let index = self.open_project(project)?;
        let segments = self.readable_segments(&index, user, None, Tolerance::ValidOnly);
        Ok(filter_by_tokens(segments, min_tokens, max_tokens))
    }

    /// Token, sentence and layer statistics over the documents whose token
    /// count lies within `[min_tokens, max_tokens]`
    pub fn get_project_statistics(
        &self,
        user: &str,
        project: ProjectId,
        statistics: &str,
        min_tokens: Option<u32>,
        max_tokens: Option<u32>,
    ) -> Result<StatisticsResult> {
        let stats = parse_statistics(statistics)?;
        let segments = self.statistics_segments(project, user, min_tokens, max_tokens)?;
        let layers = self.schema.list_layers(project)?;
        let results = project_statistics(&segments, &layers, &stats);

        Ok(StatisticsResult {
            project,
            user: user.to_string(),
            query: None,
            min_tokens_per_doc: min_tokens,
            max_tokens_per_doc: max_tokens,
            statistics: stats,
            documents: segments.len(),
            results,
        })
    }

    /// Per-document hit statistics of a query
    pub fn get_query_statistics(
        &self,
        user: &str,
        project: ProjectId,
        statistics: &str,
        query: &str,
        min_tokens: Option<u32>,
        max_tokens: Option<u32>,
    ) -> Result<StatisticsResult> {
        let stats = parse_statistics(statistics)?;
        let parsed: Query = parse_query(query)?;
        let segments = self.statistics_segments(project, user, min_tokens, max_tokens)?;

        let hits: Vec<usize> = segments
            .par_iter()
            .map(|seg| self.engine.count_hits(seg, &parsed))
            .collect();
        let results = query_statistics(query, &segments, &hits, &stats);

        Ok(StatisticsResult {
            project,
            user: user.to_string(),
            query: Some(query.to_string()),
            min_tokens_per_doc: min_tokens,
            max_tokens_per_doc: max_tokens,
            statistics: stats,
            documents: segments.len(),
            results,
        })
    }

    /// True when every tracked key of the project is VALID
    pub fn is_index_valid(&self, project: ProjectId) -> bool {
        self.tracker.is_index_valid(project)
    }

    /// Documents with a queued or running build
    pub fn get_index_progress(&self, project: ProjectId) -> BTreeSet<DocId> {
        self.tracker.index_progress(project)
    }

    /// Wait until nothing is pending for the project, polling at the
    /// configured interval
    pub fn await_index(&self, project: ProjectId) -> Result<()> {
        self.await_index_for(
            project,
            self.config.scheduler.poll_timeout(),
            self.config.scheduler.poll_interval(),
        )
    }

    pub fn await_index_for(&self, project: ProjectId, timeout: Duration, interval: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            let pending = self.tracker.index_progress(project);
            if pending.is_empty() {
                return Ok(());
            }
            if !self.scheduler.is_running() {
                return Err(SearchError::ShuttingDown);
            }
            if start.elapsed() >= timeout {
                return Err(SearchError::IndexNotReady {
                    project,
                    pending: pending.len(),
                });
            }
            std::thread::sleep(interval);
        }
    }

    /// Builds that failed, by document
    pub fn failed_tasks(&self, project: ProjectId) -> Vec<FailedTask> {
        self.tracker
            .failures(project)
            .into_iter()
            .map(|(key, cause)| FailedTask {
                doc: key.doc,
                variant: key.variant,
                cause,
            })
            .collect()
    }

    pub fn status(&self, project: ProjectId) -> Result<IndexStatus> {
        let index = self.open_project(project)?;
        let (mut valid, mut invalid, mut pending) = (0, 0, 0);
        for (_, state) in self.tracker.snapshot(project) {
            match state {
                IndexState::Valid => valid += 1,
                IndexState::Invalid => invalid += 1,
                s if s.is_pending() => pending += 1,
                _ => {}
            }
        }

        Ok(IndexStatus {
            project,
            index_path: index.index_path().to_path_buf(),
            segments: index.segment_count(),
            valid,
            invalid,
            pending,
        })
    }

    /// Stop the indexing workers; queued builds are dropped
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        tracing::debug!("search service stopped");
    }
}
