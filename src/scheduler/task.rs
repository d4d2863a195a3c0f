use crate::error::IndexError;
use crate::index::types::{ProjectId, SegmentKey};
use std::fmt;
use std::time::Instant;

/// Why a segment is being (re)built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReindexReason {
    /// A source document was uploaded
    Upload,
    /// An annotator saved their annotations
    AnnotationWrite,
    /// Curated annotations changed
    CurationChange,
    /// Layers or features changed
    SchemaChange,
    /// A stored segment is missing or the index was found corrupt
    Recovery,
    /// A stored segment was built from a different text, annotation graph
    /// or schema
    Stale,
    /// Explicit rebuild request
    Rebuild,
}

impl fmt::Display for ReindexReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReindexReason::Upload => "upload",
            ReindexReason::AnnotationWrite => "annotation-write",
            ReindexReason::CurationChange => "curation-change",
            ReindexReason::SchemaChange => "schema-change",
            ReindexReason::Recovery => "recovery",
            ReindexReason::Stale => "stale",
            ReindexReason::Rebuild => "rebuild",
        };
        f.write_str(name)
    }
}

/// One queued segment build
#[derive(Debug, Clone)]
pub struct IndexTask {
    pub project: ProjectId,
    pub key: SegmentKey,
    pub reason: ReindexReason,
    pub enqueued_at: Instant,
}

impl IndexTask {
    pub fn new(project: ProjectId, key: SegmentKey, reason: ReindexReason) -> Self {
        Self {
            project,
            key,
            reason,
            enqueued_at: Instant::now(),
        }
    }
}

/// Executes index tasks on behalf of the scheduler workers
pub trait TaskRunner: Send + Sync + 'static {
    /// Build and commit the segment of a task
    fn run(&self, task: &IndexTask) -> Result<(), IndexError>;

    /// Undo the output of a task whose document was removed while it ran
    fn discard(&self, _task: &IndexTask) {}

    /// Called after a task's outcome was recorded in the state tracker
    fn committed(&self, _project: ProjectId) {}
}
