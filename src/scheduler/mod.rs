//! Reindex scheduler.
//!
//! Tasks are queued FIFO per project. A pool of worker threads drains the
//! queues; at most one worker serves a project at a time, so builds within a
//! project are serialized while different projects index in parallel.
//! Enqueueing a key that is already queued or in flight is a no-op.

mod task;

pub use task::{IndexTask, ReindexReason, TaskRunner};

use crate::index::state::IndexStateTracker;
use crate::index::types::{ProjectId, SegmentKey};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[derive(Default)]
struct QueueState {
    queues: HashMap<ProjectId, VecDeque<IndexTask>>,
    /// Projects with queued tasks and no active worker
    ready: VecDeque<ProjectId>,
    /// Projects a worker is currently serving
    busy: HashSet<ProjectId>,
    /// Keys queued or in flight
    pending: HashSet<(ProjectId, SegmentKey)>,
}

impl QueueState {
    fn next_task(&mut self) -> Option<IndexTask> {
        while let Some(project) = self.ready.pop_front() {
            if let Some(task) = self.queues.get_mut(&project).and_then(|q| q.pop_front()) {
                self.busy.insert(project);
                return Some(task);
            }
            self.queues.remove(&project);
        }
        None
    }

    /// Release a finished task's project; returns true if it has more work
    fn finish(&mut self, task: &IndexTask) -> bool {
        self.pending.remove(&(task.project, task.key.clone()));
        self.busy.remove(&task.project);

        let more = self.queues.get(&task.project).is_some_and(|q| !q.is_empty());
        if more {
            self.ready.push_back(task.project);
        } else {
            self.queues.remove(&task.project);
        }
        more
    }
}

struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
    shutdown: AtomicBool,
    tracker: Arc<IndexStateTracker>,
    runner: Arc<dyn TaskRunner>,
}

/// Background index task queue with its worker pool
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Start `workers` indexing threads
    pub fn start(workers: usize, tracker: Arc<IndexStateTracker>, runner: Arc<dyn TaskRunner>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            tracker,
            runner,
        });

        let workers = (0..workers.max(1))
            .filter_map(|i| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("annodex-indexer-{}", i))
                    .spawn(move || worker_loop(shared))
                    .map_err(|e| tracing::error!(error = %e, "failed to spawn indexing worker"))
                    .ok()
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a segment build. Returns false if the key is already queued or
    /// being indexed, or the scheduler is shutting down.
    pub fn enqueue(&self, project: ProjectId, key: SegmentKey, reason: ReindexReason) -> bool {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return false;
        }

        let mut state = self.shared.state.lock();
        if !state.pending.insert((project, key.clone())) {
            tracing::debug!(project, key = %key, %reason, "already pending, not queued again");
            return false;
        }

        self.shared.tracker.mark_queued(project, &key);
        tracing::debug!(project, key = %key, %reason, "queued");

        let queue = state.queues.entry(project).or_default();
        let was_idle = queue.is_empty();
        queue.push_back(IndexTask::new(project, key, reason));

        if was_idle && !state.busy.contains(&project) {
            state.ready.push_back(project);
            self.shared.available.notify_one();
        }
        true
    }

    /// Number of tasks queued or in flight for a project
    pub fn pending_count(&self, project: ProjectId) -> usize {
        self.shared
            .state
            .lock()
            .pending
            .iter()
            .filter(|(p, _)| *p == project)
            .count()
    }

    pub fn is_running(&self) -> bool {
        !self.shared.shutdown.load(Ordering::SeqCst)
            && self.workers.lock().iter().any(|w| !w.is_finished())
    }

    /// Stop accepting tasks and wait for the workers. Tasks still queued are
    /// dropped; a task in flight runs to completion.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let _state = self.shared.state.lock();
            self.shared.available.notify_all();
        }
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(task) = state.next_task() {
                    break task;
                }
                shared.available.wait(&mut state);
            }
        };

        shared.tracker.mark_indexing(task.project, &task.key);
        let outcome = shared.runner.run(&task);

        {
            // State transition and pending release happen together so an
            // enqueue never sees a finished key as still pending
            let mut state = shared.state.lock();
            match &outcome {
                Ok(()) => {
                    if shared.tracker.mark_valid(task.project, &task.key) {
                        tracing::debug!(
                            project = task.project,
                            key = %task.key,
                            reason = %task.reason,
                            elapsed_ms = task.enqueued_at.elapsed().as_millis() as u64,
                            "indexed"
                        );
                    } else {
                        shared.runner.discard(&task);
                        tracing::debug!(project = task.project, key = %task.key, "document removed during build, segment discarded");
                    }
                }
                Err(e) if e.is_document_gone() => {
                    shared.tracker.forget(task.project, &task.key);
                    shared.tracker.remove_document(task.project, task.key.doc);
                    tracing::debug!(project = task.project, key = %task.key, "document gone, task dropped");
                }
                Err(e) => {
                    if shared.tracker.mark_invalid(task.project, &task.key, e.to_string()) {
                        tracing::warn!(
                            project = task.project,
                            doc = task.key.doc,
                            variant = %task.key.variant,
                            reason = %task.reason,
                            error = %e,
                            "indexing failed"
                        );
                    } else {
                        tracing::debug!(project = task.project, key = %task.key, "document removed during build, failure dropped");
                    }
                }
            }
            if state.finish(&task) {
                shared.available.notify_one();
            }
        }

        shared.runner.committed(task.project);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DocumentError, IndexError};
    use crate::index::types::{AnnotationVariant, IndexState};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    /// Runner that blocks until released and counts executions
    struct GatedRunner {
        runs: AtomicUsize,
        active: Mutex<HashMap<ProjectId, usize>>,
        max_parallel_per_project: AtomicUsize,
        gate: Mutex<Option<mpsc::Receiver<()>>>,
        fail_doc: Option<u64>,
        discarded: AtomicUsize,
    }

    impl GatedRunner {
        fn new(gate: Option<mpsc::Receiver<()>>, fail_doc: Option<u64>) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                active: Mutex::new(HashMap::new()),
                max_parallel_per_project: AtomicUsize::new(0),
                gate: Mutex::new(gate),
                fail_doc,
                discarded: AtomicUsize::new(0),
            })
        }
    }

    impl TaskRunner for GatedRunner {
        fn run(&self, task: &IndexTask) -> Result<(), IndexError> {
            {
                let mut active = self.active.lock();
                let n = active.entry(task.project).or_default();
                *n += 1;
                self.max_parallel_per_project.fetch_max(*n, Ordering::SeqCst);
            }

            if let Some(rx) = self.gate.lock().as_ref() {
                let _ = rx.recv_timeout(Duration::from_secs(5));
            }
            thread::sleep(Duration::from_millis(5));

            *self.active.lock().entry(task.project).or_default() -= 1;
            self.runs.fetch_add(1, Ordering::SeqCst);

            if Some(task.key.doc) == self.fail_doc {
                return Err(IndexError::MalformedAnnotation {
                    doc: task.key.doc,
                    reason: "broken".to_string(),
                });
            }
            if task.key.doc == 404 {
                return Err(IndexError::DocumentUnavailable {
                    doc: 404,
                    source: DocumentError::NotFound { project: task.project, doc: 404 },
                });
            }
            Ok(())
        }

        fn discard(&self, _task: &IndexTask) {
            self.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_until(tracker: &IndexStateTracker, project: ProjectId) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !tracker.index_progress(project).is_empty() {
            assert!(Instant::now() < deadline, "indexing did not finish");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_dedupe_while_queued_or_indexing() {
        let (tx, rx) = mpsc::channel();
        let tracker = Arc::new(IndexStateTracker::new());
        let runner = GatedRunner::new(Some(rx), None);
        let scheduler = Scheduler::start(2, tracker.clone(), runner.clone());

        let key = SegmentKey::initial(1);
        assert!(scheduler.enqueue(1, key.clone(), ReindexReason::Upload));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let key = key.clone();
                let tracker = tracker.clone();
                thread::spawn(move || tracker.state(1, &key).is_pending())
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }

        for _ in 0..8 {
            assert!(!scheduler.enqueue(1, key.clone(), ReindexReason::AnnotationWrite));
        }
        assert_eq!(scheduler.pending_count(1), 1);

        tx.send(()).unwrap();
        wait_until(&tracker, 1);

        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.state(1, &key), IndexState::Valid);
        assert!(tracker.is_index_valid(1));
        scheduler.shutdown();
    }

    #[test]
    fn test_build_of_removed_document_is_discarded() {
        let (tx, rx) = mpsc::channel();
        let tracker = Arc::new(IndexStateTracker::new());
        let runner = GatedRunner::new(Some(rx), None);
        let scheduler = Scheduler::start(1, tracker.clone(), runner.clone());

        let key = SegmentKey::initial(1);
        scheduler.enqueue(1, key.clone(), ReindexReason::Upload);
        let deadline = Instant::now() + Duration::from_secs(10);
        while tracker.state(1, &key) != IndexState::Indexing {
            assert!(Instant::now() < deadline, "build did not start");
            thread::sleep(Duration::from_millis(1));
        }

        tracker.remove_document(1, 1);
        assert_eq!(tracker.index_progress(1).len(), 1);
        assert!(!tracker.is_index_valid(1));

        tx.send(()).unwrap();
        wait_until(&tracker, 1);

        assert_eq!(runner.discarded.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.state(1, &key), IndexState::NotIndexed);
        assert!(tracker.is_index_valid(1));
        scheduler.shutdown();
    }

    #[test]
    fn test_project_serialization() {
        let tracker = Arc::new(IndexStateTracker::new());
        let runner = GatedRunner::new(None, None);
        let scheduler = Scheduler::start(4, tracker.clone(), runner.clone());

        for doc in 1..=6 {
            scheduler.enqueue(1, SegmentKey::initial(doc), ReindexReason::Upload);
            scheduler.enqueue(2, SegmentKey::initial(doc), ReindexReason::Upload);
        }
        wait_until(&tracker, 1);
        wait_until(&tracker, 2);

        assert_eq!(runner.runs.load(Ordering::SeqCst), 12);
        assert_eq!(runner.max_parallel_per_project.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_failure_is_confined() {
        let tracker = Arc::new(IndexStateTracker::new());
        let runner = GatedRunner::new(None, Some(2));
        let scheduler = Scheduler::start(1, tracker.clone(), runner.clone());

        for doc in 1..=3 {
            scheduler.enqueue(1, SegmentKey::initial(doc), ReindexReason::Upload);
        }
        scheduler.enqueue(1, SegmentKey::initial(404), ReindexReason::Upload);
        wait_until(&tracker, 1);

        assert_eq!(tracker.state(1, &SegmentKey::initial(1)), IndexState::Valid);
        assert_eq!(tracker.state(1, &SegmentKey::initial(2)), IndexState::Invalid);
        assert_eq!(tracker.state(1, &SegmentKey::initial(3)), IndexState::Valid);
        assert_eq!(tracker.state(1, &SegmentKey::initial(404)), IndexState::NotIndexed);

        let failures = tracker.failures(1);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].1.contains("broken"));

        // Failed tasks are not retried until a new event arrives
        thread::sleep(Duration::from_millis(30));
        assert_eq!(runner.runs.load(Ordering::SeqCst), 4);
        assert!(scheduler.enqueue(
            1,
            SegmentKey::new(2, AnnotationVariant::Initial),
            ReindexReason::AnnotationWrite
        ));
        scheduler.shutdown();
    }

    #[test]
    fn test_enqueue_after_shutdown() {
        let tracker = Arc::new(IndexStateTracker::new());
        let scheduler = Scheduler::start(1, tracker.clone(), GatedRunner::new(None, None));
        scheduler.shutdown();
        assert!(!scheduler.enqueue(1, SegmentKey::initial(1), ReindexReason::Upload));
        assert_eq!(tracker.state(1, &SegmentKey::initial(1)), IndexState::NotIndexed);
    }
}
