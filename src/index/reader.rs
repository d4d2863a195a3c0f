use crate::error::SearchError;
use crate::index::state::{IndexStateTracker, StateTable};
use crate::index::types::*;
use crate::index::writer::{
    payload_checksum, remove_segment, write_segment, SEGMENT_HEADER_LEN, SEGMENT_MAGIC, SEGMENT_VERSION,
};
use crate::utils::tokenizer::TextSpan;
use crate::utils::{DecodeError, Decoder};
use arc_swap::ArcSwap;
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Why a segment file could not be read
#[derive(Error, Debug)]
pub enum SegmentReadError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("not a segment file")]
    BadMagic,

    #[error("unsupported segment version {0}")]
    UnsupportedVersion(u32),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("inconsistent segment: {0}")]
    Inconsistent(&'static str),
}

/// Decode a complete segment file
pub fn decode_segment(bytes: &[u8]) -> Result<Segment, SegmentReadError> {
    if bytes.len() < SEGMENT_HEADER_LEN || &bytes[0..4] != SEGMENT_MAGIC {
        return Err(SegmentReadError::BadMagic);
    }

    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[4..8]);
    let version = u32::from_le_bytes(word);
    if version != SEGMENT_VERSION {
        return Err(SegmentReadError::UnsupportedVersion(version));
    }

    word.copy_from_slice(&bytes[8..12]);
    let payload = &bytes[SEGMENT_HEADER_LEN..];
    if payload_checksum(payload) != u32::from_le_bytes(word) {
        return Err(SegmentReadError::ChecksumMismatch);
    }

    let mut d = Decoder::new(payload);

    let doc = d.varint_u64("document id")?;
    let variant = match d.bytes(1, "variant tag")?[0] {
        0 => AnnotationVariant::Initial,
        1 => AnnotationVariant::Curation,
        2 => AnnotationVariant::User(d.string("variant user")?),
        _ => return Err(SegmentReadError::Inconsistent("unknown variant tag")),
    };
    let title = d.string("title")?;
    let text = d.string("text")?;
    let char_len = text.chars().count() as u32;

    let tokens = read_spans(&mut d, "token", char_len)?;
    let sentences = read_spans(&mut d, "sentence", char_len)?;

    let count = d.varint("annotation count")? as usize;
    let mut annotations = Vec::with_capacity(count.min(payload.len()));
    for _ in 0..count {
        let layer = d.string("annotation layer")?;
        let begin = d.varint("annotation begin")?;
        let len = d.varint("annotation length")?;
        let token_begin = d.varint("annotation token")?;
        let token_len = d.varint("annotation token length")?;

        let end = begin.checked_add(len).filter(|e| *e <= char_len);
        let token_end = token_begin
            .checked_add(token_len)
            .filter(|e| *e as usize <= tokens.len());
        let (Some(end), Some(token_end)) = (end, token_end) else {
            return Err(SegmentReadError::Inconsistent("annotation out of range"));
        };

        let feature_count = d.varint("feature count")? as usize;
        let mut features = Vec::with_capacity(feature_count.min(payload.len()));
        for _ in 0..feature_count {
            let name = d.string("feature name")?;
            let value = d.string("feature value")?;
            features.push((name, value));
        }

        annotations.push(IndexedAnnotation {
            span: TextSpan::new(begin, end),
            layer,
            features,
            token_begin,
            token_end,
        });
    }

    if !d.is_empty() {
        return Err(SegmentReadError::Inconsistent("trailing bytes"));
    }

    Ok(Segment::new(
        SegmentKey::new(doc, variant),
        title,
        text,
        tokens,
        sentences,
        annotations,
    ))
}

fn read_spans(
    d: &mut Decoder<'_>,
    what: &'static str,
    char_len: u32,
) -> Result<Vec<TextSpan>, SegmentReadError> {
    let count = d.varint(what)? as usize;
    let mut spans = Vec::with_capacity(count.min(char_len as usize + 1));
    let mut prev_end = 0u32;
    for _ in 0..count {
        let gap = d.varint(what)?;
        let len = d.varint(what)?;
        let begin = prev_end.checked_add(gap);
        let end = begin.and_then(|b| b.checked_add(len)).filter(|e| *e <= char_len);
        let (Some(begin), Some(end)) = (begin, end) else {
            return Err(SegmentReadError::Inconsistent("span out of range"));
        };
        spans.push(TextSpan::new(begin, end));
        prev_end = end;
    }
    Ok(spans)
}

/// Memory-map and decode one segment file
pub fn read_segment(path: &Path) -> Result<Segment, SegmentReadError> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Err(SegmentReadError::BadMagic);
    }
    let mmap = unsafe { Mmap::map(&file)? };
    decode_segment(&mmap)
}

type SegmentMap = HashMap<SegmentKey, Arc<Segment>>;

/// Persistent index of one project.
///
/// Committed segments are published through an [`ArcSwap`]: readers load
/// the current map without locking and keep using it while a writer swaps
/// in a new one.
pub struct ProjectIndex {
    project: ProjectId,
    index_path: PathBuf,
    segments: ArcSwap<SegmentMap>,
    /// Serializes state.json rewrites
    state_lock: Mutex<()>,
}

impl ProjectIndex {
    /// Open (or create) the index of a project and restore its state table
    /// into `tracker`. Any unreadable segment, meta or state file fails the
    /// whole open with `IndexCorrupt`.
    pub fn open(
        index_path: &Path,
        project: ProjectId,
        tracker: &IndexStateTracker,
    ) -> Result<Self, SearchError> {
        let corrupt = |reason: String| SearchError::IndexCorrupt { project, reason };

        fs::create_dir_all(index_path.join("segments"))?;

        let meta_path = index_path.join("meta.json");
        if meta_path.exists() {
            let meta_file = File::open(&meta_path)?;
            let meta: IndexMeta = serde_json::from_reader(meta_file)
                .map_err(|e| corrupt(format!("meta.json: {}", e)))?;
            if meta.version != IndexMeta::VERSION || meta.project != project {
                return Err(corrupt(format!(
                    "meta.json describes version {} of project {}",
                    meta.version, meta.project
                )));
            }
        } else {
            let now = unix_now();
            let meta = IndexMeta {
                version: IndexMeta::VERSION,
                project,
                created_at: now,
                updated_at: now,
            };
            let file = File::create(&meta_path)?;
            serde_json::to_writer_pretty(file, &meta).map_err(io::Error::other)?;
        }

        let state_path = index_path.join("state.json");
        let table = if state_path.exists() {
            StateTable::load(&state_path).map_err(|e| corrupt(format!("state.json: {}", e)))?
        } else {
            StateTable::default()
        };

        let mut seg_paths = Vec::new();
        for entry in fs::read_dir(index_path.join("segments"))? {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("seg") => seg_paths.push(path),
                // Leftover from an interrupted write
                Some("tmp") => {
                    let _ = fs::remove_file(&path);
                }
                _ => {}
            }
        }

        let loaded: Vec<Result<Segment, (PathBuf, SegmentReadError)>> = seg_paths
            .par_iter()
            .map(|path| read_segment(path).map_err(|e| (path.clone(), e)))
            .collect();

        let mut segments = SegmentMap::new();
        for result in loaded {
            let segment = result.map_err(|(path, e)| corrupt(format!("{}: {}", path.display(), e)))?;
            segments.insert(segment.key.clone(), Arc::new(segment));
        }

        for entry in &table.entries {
            if entry.state == IndexState::Valid && !segments.contains_key(&entry.key) {
                return Err(corrupt(format!("segment {} is missing", entry.key)));
            }
        }

        tracker.restore(project, &table);

        tracing::debug!(project, segments = segments.len(), "opened project index");

        Ok(Self {
            project,
            index_path: index_path.to_path_buf(),
            segments: ArcSwap::from_pointee(segments),
            state_lock: Mutex::new(()),
        })
    }

    pub fn project(&self) -> ProjectId {
        self.project
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    fn segments_dir(&self) -> PathBuf {
        self.index_path.join("segments")
    }

    /// Persist a segment and publish it, replacing the previous one
    pub fn commit(&self, segment: Segment) -> io::Result<Arc<Segment>> {
        write_segment(&self.segments_dir(), &segment)?;

        let segment = Arc::new(segment);
        let key = segment.key.clone();
        self.segments.rcu(|current| {
            let mut next = SegmentMap::clone(current);
            next.insert(key.clone(), segment.clone());
            next
        });
        tracing::debug!(project = self.project, key = %key, "segment swapped in");
        Ok(segment)
    }

    /// Drop one segment
    pub fn remove_segment(&self, key: &SegmentKey) -> io::Result<()> {
        remove_segment(&self.segments_dir(), key)?;
        self.segments.rcu(|current| {
            let mut next = SegmentMap::clone(current);
            next.remove(key);
            next
        });
        Ok(())
    }

    /// Drop every segment of a document
    pub fn remove_document(&self, doc: DocId) -> io::Result<()> {
        let keys: Vec<SegmentKey> = self
            .segments
            .load()
            .keys()
            .filter(|k| k.doc == doc)
            .cloned()
            .collect();

        for key in &keys {
            remove_segment(&self.segments_dir(), key)?;
        }
        self.segments.rcu(|current| {
            let mut next = SegmentMap::clone(current);
            next.retain(|k, _| k.doc != doc);
            next
        });
        Ok(())
    }

    pub fn get(&self, key: &SegmentKey) -> Option<Arc<Segment>> {
        self.segments.load().get(key).cloned()
    }

    /// Current set of committed segments
    pub fn snapshot(&self) -> Arc<SegmentMap> {
        self.segments.load_full()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.load().len()
    }

    /// Write the project's persistable state
    pub fn save_state(&self, tracker: &IndexStateTracker) -> io::Result<()> {
        let _guard = self.state_lock.lock();
        tracker.table(self.project).save(&self.index_path.join("state.json"))
    }
}

/// Delete everything stored for a project
pub fn wipe_project_index(index_path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(index_path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Open project indexes by project id
#[derive(Default)]
pub struct IndexRegistry {
    projects: RwLock<HashMap<ProjectId, Arc<ProjectIndex>>>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, project: ProjectId) -> Option<Arc<ProjectIndex>> {
        self.projects.read().get(&project).cloned()
    }

    pub fn insert(&self, index: ProjectIndex) -> Arc<ProjectIndex> {
        let index = Arc::new(index);
        self.projects.write().insert(index.project(), index.clone());
        index
    }

    pub fn remove(&self, project: ProjectId) -> Option<Arc<ProjectIndex>> {
        self.projects.write().remove(&project)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{AnnotationGraph, SourceDocument, SpanRecord};
    use crate::index::writer::{encode_segment, IndexWriter};

    fn galicia_segment(variant: AnnotationVariant) -> Segment {
        let source = SourceDocument {
            id: 1,
            project: 7,
            name: "galicia.txt".to_string(),
            format: "text".to_string(),
            content: "The capital of Galicia is Santiago de Compostela.".into(),
        };
        let mut graph = AnnotationGraph::new();
        graph.add_span(SpanRecord::new("Named entity", 15, 22).with_feature("value", "LOC"));
        IndexWriter::new(1 << 20)
            .index_document(&source, &graph, &variant, &[])
            .unwrap()
    }

    #[test]
    fn test_decode_roundtrip() {
        let seg = galicia_segment(AnnotationVariant::User("admin".to_string()));
        let bytes = encode_segment(&seg);
        let decoded = decode_segment(&bytes).unwrap();

        assert_eq!(decoded.key, seg.key);
        assert_eq!(decoded.text, seg.text);
        assert_eq!(decoded.tokens, seg.tokens);
        assert_eq!(decoded.sentences, seg.sentences);
        assert_eq!(decoded.annotations, seg.annotations);
        assert_eq!(encode_segment(&decoded), bytes);
    }

    #[test]
    fn test_decode_detects_corruption() {
        let seg = galicia_segment(AnnotationVariant::Initial);
        let mut bytes = encode_segment(&seg);
        let stored = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        assert_eq!(stored, crc32fast::hash(&bytes[SEGMENT_HEADER_LEN..]));

        let mut flipped = bytes.clone();
        flipped[9] ^= 0x01;
        assert!(matches!(decode_segment(&flipped), Err(SegmentReadError::ChecksumMismatch)));

        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;
        assert!(matches!(decode_segment(&bytes), Err(SegmentReadError::ChecksumMismatch)));

        assert!(matches!(decode_segment(b"XXXX"), Err(SegmentReadError::BadMagic)));

        let mut bytes = encode_segment(&seg);
        bytes[4] = 9;
        assert!(matches!(
            decode_segment(&bytes),
            Err(SegmentReadError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_commit_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = IndexStateTracker::new();

        let index = ProjectIndex::open(dir.path(), 7, &tracker).unwrap();
        let seg = index.commit(galicia_segment(AnnotationVariant::Initial)).unwrap();
        tracker.mark_valid(7, &seg.key);
        index.save_state(&tracker).unwrap();

        let reopened_tracker = IndexStateTracker::new();
        let reopened = ProjectIndex::open(dir.path(), 7, &reopened_tracker).unwrap();
        assert_eq!(reopened.segment_count(), 1);
        assert_eq!(reopened_tracker.state(7, &seg.key), IndexState::Valid);

        let loaded = reopened.get(&seg.key).unwrap();
        assert_eq!(loaded.term_positions("Galicia").unwrap().len(), 1);
    }

    #[test]
    fn test_snapshot_survives_swap() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = IndexStateTracker::new();
        let index = ProjectIndex::open(dir.path(), 7, &tracker).unwrap();

        index.commit(galicia_segment(AnnotationVariant::Initial)).unwrap();
        let before = index.snapshot();

        index.commit(galicia_segment(AnnotationVariant::Curation)).unwrap();
        index.remove_segment(&SegmentKey::new(1, AnnotationVariant::Curation)).unwrap();
        assert_eq!(index.segment_count(), 1);
        index.remove_document(1).unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(index.segment_count(), 0);
    }

    #[test]
    fn test_open_reports_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = IndexStateTracker::new();
        let index = ProjectIndex::open(dir.path(), 7, &tracker).unwrap();
        index.commit(galicia_segment(AnnotationVariant::Initial)).unwrap();

        let seg_path = dir.path().join("segments").join(SegmentKey::initial(1).file_name());
        let mut bytes = fs::read(&seg_path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        fs::write(&seg_path, bytes).unwrap();

        let err = ProjectIndex::open(dir.path(), 7, &IndexStateTracker::new())
            .err()
            .unwrap();
        assert!(matches!(err, SearchError::IndexCorrupt { project: 7, .. }));

        wipe_project_index(dir.path()).unwrap();
        assert!(ProjectIndex::open(dir.path(), 7, &IndexStateTracker::new()).is_ok());
    }

    #[test]
    fn test_missing_valid_segment_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = IndexStateTracker::new();
        let index = ProjectIndex::open(dir.path(), 7, &tracker).unwrap();
        tracker.mark_valid(7, &SegmentKey::initial(42));
        index.save_state(&tracker).unwrap();

        let err = ProjectIndex::open(dir.path(), 7, &IndexStateTracker::new())
            .err()
            .unwrap();
        assert!(matches!(err, SearchError::IndexCorrupt { .. }));
    }
}
