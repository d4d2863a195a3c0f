//! Index state tracker.
//!
//! Holds the lifecycle state of every segment key of every project. This is
//! the one place the query side, the scheduler and pollers agree on whether a
//! segment may be read. Only `Valid` and `Invalid` survive a restart; they
//! are persisted as `state.json` next to the segments, together with the
//! input fingerprint each valid segment was built from.

use crate::index::types::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

#[derive(Default)]
struct ProjectState {
    states: HashMap<SegmentKey, IndexState>,
    failures: BTreeMap<SegmentKey, String>,
    /// Input fingerprint of each committed segment
    fingerprints: HashMap<SegmentKey, u32>,
    /// Removed documents that still have a build queued or running
    removed: HashSet<DocId>,
    /// Bumped on every transition; invalidates cached reads
    generation: u64,
}

impl ProjectState {
    fn set(&mut self, key: &SegmentKey, state: IndexState) {
        self.states.insert(key.clone(), state);
        self.generation += 1;
    }

    fn has_pending(&self, doc: DocId) -> bool {
        self.states.iter().any(|(k, s)| k.doc == doc && s.is_pending())
    }

    fn forget(&mut self, key: &SegmentKey) {
        self.states.remove(key);
        self.failures.remove(key);
        self.fingerprints.remove(key);
        if !self.has_pending(key.doc) {
            self.removed.remove(&key.doc);
        }
        self.generation += 1;
    }
}

/// Per project, per segment index state
#[derive(Default)]
pub struct IndexStateTracker {
    projects: RwLock<HashMap<ProjectId, ProjectState>>,
}

impl IndexStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a key to `Queued`. Returns false, leaving the state untouched,
    /// if it is already queued or being indexed. Queueing a key brings a
    /// removed document back.
    pub fn mark_queued(&self, project: ProjectId, key: &SegmentKey) -> bool {
        let mut projects = self.projects.write();
        let p = projects.entry(project).or_default();
        p.removed.remove(&key.doc);
        if p.states.get(key).is_some_and(|s| s.is_pending()) {
            return false;
        }
        p.set(key, IndexState::Queued);
        true
    }

    pub fn mark_indexing(&self, project: ProjectId, key: &SegmentKey) {
        self.projects.write().entry(project).or_default().set(key, IndexState::Indexing);
    }

    /// Record a successful build. Returns false, forgetting the key, if
    /// its document was removed while the build ran.
    pub fn mark_valid(&self, project: ProjectId, key: &SegmentKey) -> bool {
        let mut projects = self.projects.write();
        let p = projects.entry(project).or_default();
        if p.removed.contains(&key.doc) {
            p.forget(key);
            return false;
        }
        p.failures.remove(key);
        p.set(key, IndexState::Valid);
        true
    }

    /// Record a failed build. The failure is kept until the key is indexed
    /// successfully or removed. Returns false, forgetting the key, if its
    /// document was removed while the build ran.
    pub fn mark_invalid(&self, project: ProjectId, key: &SegmentKey, cause: impl Into<String>) -> bool {
        let mut projects = self.projects.write();
        let p = projects.entry(project).or_default();
        if p.removed.contains(&key.doc) {
            p.forget(key);
            return false;
        }
        p.fingerprints.remove(key);
        p.failures.insert(key.clone(), cause.into());
        p.set(key, IndexState::Invalid);
        true
    }

    /// Remember the input a committed segment was built from
    pub fn set_fingerprint(&self, project: ProjectId, key: &SegmentKey, fingerprint: u32) {
        let mut projects = self.projects.write();
        projects.entry(project).or_default().fingerprints.insert(key.clone(), fingerprint);
    }

    pub fn fingerprint(&self, project: ProjectId, key: &SegmentKey) -> Option<u32> {
        self.projects
            .read()
            .get(&project)
            .and_then(|p| p.fingerprints.get(key).copied())
    }

    /// Forget the keys of a document. Keys still queued or being indexed
    /// stay pending until their task finishes; the document is remembered
    /// as removed so that those builds are discarded.
    pub fn remove_document(&self, project: ProjectId, doc: DocId) {
        let mut projects = self.projects.write();
        if let Some(p) = projects.get_mut(&project) {
            p.states.retain(|k, s| k.doc != doc || s.is_pending());
            p.failures.retain(|k, _| k.doc != doc);
            p.fingerprints.retain(|k, _| k.doc != doc);
            if p.has_pending(doc) {
                p.removed.insert(doc);
            }
            p.generation += 1;
        }
    }

    /// Forget a single key
    pub fn forget(&self, project: ProjectId, key: &SegmentKey) {
        if let Some(p) = self.projects.write().get_mut(&project) {
            p.forget(key);
        }
    }

    pub fn is_removed(&self, project: ProjectId, doc: DocId) -> bool {
        self.projects
            .read()
            .get(&project)
            .is_some_and(|p| p.removed.contains(&doc))
    }

    /// Forget a whole project
    pub fn clear_project(&self, project: ProjectId) {
        let mut projects = self.projects.write();
        let p = projects.entry(project).or_default();
        p.states.clear();
        p.failures.clear();
        p.fingerprints.clear();
        p.removed.clear();
        p.generation += 1;
    }

    /// Make a project known even if it has no documents
    pub fn register_project(&self, project: ProjectId) {
        self.projects.write().entry(project).or_default();
    }

    pub fn state(&self, project: ProjectId, key: &SegmentKey) -> IndexState {
        self.projects
            .read()
            .get(&project)
            .and_then(|p| p.states.get(key).copied())
            .unwrap_or(IndexState::NotIndexed)
    }

    /// True iff every tracked key of the project is `Valid`
    pub fn is_index_valid(&self, project: ProjectId) -> bool {
        self.projects
            .read()
            .get(&project)
            .map(|p| p.states.values().all(|s| *s == IndexState::Valid))
            .unwrap_or(true)
    }

    /// Documents with at least one key queued or being indexed
    pub fn index_progress(&self, project: ProjectId) -> BTreeSet<DocId> {
        self.projects
            .read()
            .get(&project)
            .map(|p| {
                p.states
                    .iter()
                    .filter(|(_, s)| s.is_pending())
                    .map(|(k, _)| k.doc)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Failed keys with their cause
    pub fn failures(&self, project: ProjectId) -> Vec<(SegmentKey, String)> {
        self.projects
            .read()
            .get(&project)
            .map(|p| p.failures.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn generation(&self, project: ProjectId) -> u64 {
        self.projects.read().get(&project).map(|p| p.generation).unwrap_or(0)
    }

    /// Every tracked key with its state, sorted by key
    pub fn snapshot(&self, project: ProjectId) -> Vec<(SegmentKey, IndexState)> {
        let mut entries: Vec<_> = self
            .projects
            .read()
            .get(&project)
            .map(|p| p.states.iter().map(|(k, s)| (k.clone(), *s)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Persistable part of a project's state
    pub fn table(&self, project: ProjectId) -> StateTable {
        let projects = self.projects.read();
        let Some(p) = projects.get(&project) else {
            return StateTable::default();
        };

        let mut entries: Vec<StateEntry> = p
            .states
            .iter()
            .filter_map(|(key, state)| {
                // Pending keys are not persisted; they reopen as NotIndexed
                // and get queued again
                let persisted = match state {
                    IndexState::Valid | IndexState::Invalid => *state,
                    _ => return None,
                };
                Some(StateEntry {
                    key: key.clone(),
                    state: persisted,
                    error: p.failures.get(key).cloned(),
                    fingerprint: p.fingerprints.get(key).copied(),
                })
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        StateTable {
            version: StateTable::VERSION,
            entries,
        }
    }

    /// Replace a project's state with a loaded table
    pub fn restore(&self, project: ProjectId, table: &StateTable) {
        let mut projects = self.projects.write();
        let p = projects.entry(project).or_default();
        p.states.clear();
        p.failures.clear();
        p.fingerprints.clear();
        for entry in &table.entries {
            p.states.insert(entry.key.clone(), entry.state);
            if let Some(err) = &entry.error {
                p.failures.insert(entry.key.clone(), err.clone());
            }
            if let Some(fingerprint) = entry.fingerprint {
                p.fingerprints.insert(entry.key.clone(), fingerprint);
            }
        }
        p.generation += 1;
    }
}

/// One persisted row of the state table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: SegmentKey,
    pub state: IndexState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<u32>,
}

/// Contents of `state.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTable {
    pub version: u32,
    pub entries: Vec<StateEntry>,
}

impl StateTable {
    pub const VERSION: u32 = 1;

    pub fn load(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Write via temp file and rename
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut file = BufWriter::new(File::create(&tmp_path)?);
            serde_json::to_writer_pretty(&mut file, self)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            file.flush()?;
            file.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, path)
    }
}
