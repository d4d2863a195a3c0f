//! Directory corpus for the command line tool.
//!
//! Layout:
//! - `*.txt` - source documents, named by their path relative to the root
//! - `<stem>.<user>.ann.json` - annotation graph of `user` for `<stem>.txt`
//! - `schema.json` - optional list of layers with their features

use super::{AnnotationGraph, DocumentService, LayerDef, MemoryDocumentService, MemorySchemaService};
use crate::index::types::{DocId, ProjectId};
use anyhow::{Context, Result};
use ignore::WalkBuilder;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const ANNOTATION_SUFFIX: &str = ".ann.json";
const SCHEMA_FILE: &str = "schema.json";

/// A directory of documents loaded into memory
pub struct Corpus {
    pub root: PathBuf,
    pub documents: Arc<MemoryDocumentService>,
    pub schema: Arc<MemorySchemaService>,
    names: BTreeMap<String, DocId>,
    skipped: Vec<PathBuf>,
}

impl Corpus {
    /// Project id used for every directory corpus
    pub const PROJECT: ProjectId = 1;

    /// Load every document below `root`. Documents get ids in path order, so
    /// the same tree always yields the same ids.
    pub fn load(root: &Path) -> Result<Self> {
        let root = root.canonicalize().context("Invalid corpus path")?;

        let walker = WalkBuilder::new(&root)
            .hidden(true)
            .git_ignore(true)
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                !matches!(name.as_ref(), ".git" | "target" | ".annodex")
            })
            .build();

        let mut files: Vec<(PathBuf, String)> = walker
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| {
                let path = entry.path().to_path_buf();
                let rel = path.strip_prefix(&root).ok()?.to_string_lossy().replace('\\', "/");
                Some((path, rel))
            })
            .collect();
        files.sort_by(|a, b| a.1.cmp(&b.1));

        let documents = Arc::new(MemoryDocumentService::new());
        let schema = Arc::new(MemorySchemaService::new());
        let mut names = BTreeMap::new();
        let mut skipped = Vec::new();

        for (path, rel) in files.iter().filter(|(_, rel)| rel.ends_with(".txt")) {
            let content = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
            let (id, _) = documents.upload_source_document(Self::PROJECT, rel, content);
            names.insert(rel.clone(), id);
        }

        for (path, rel) in files.iter().filter(|(_, rel)| rel.ends_with(ANNOTATION_SUFFIX)) {
            let Some((doc_name, user)) = split_annotation_name(rel) else {
                skipped.push(path.clone());
                continue;
            };
            let Some(&doc) = names.get(&doc_name) else {
                skipped.push(path.clone());
                continue;
            };

            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let graph: AnnotationGraph = serde_json::from_str(&content)
                .with_context(|| format!("Invalid annotation file {}", path.display()))?;
            documents.write_annotation_graph(Self::PROJECT, doc, &user, graph)?;
        }

        let schema_path = root.join(SCHEMA_FILE);
        if schema_path.is_file() {
            let content = fs::read_to_string(&schema_path)?;
            let layers: Vec<LayerDef> = serde_json::from_str(&content)
                .with_context(|| format!("Invalid schema file {}", schema_path.display()))?;
            schema.set_layers(Self::PROJECT, layers);
        }

        tracing::debug!(
            root = %root.display(),
            documents = names.len(),
            skipped = skipped.len(),
            "loaded corpus"
        );

        Ok(Self {
            root,
            documents,
            schema,
            names,
            skipped,
        })
    }

    /// Id of a document by its relative path
    pub fn doc_id(&self, name: &str) -> Option<DocId> {
        self.names.get(name).copied()
    }

    pub fn document_count(&self) -> usize {
        self.names.len()
    }

    /// Annotation files that match no source document
    pub fn skipped(&self) -> &[PathBuf] {
        &self.skipped
    }

    /// Name of a document
    pub fn name_of(&self, doc: DocId) -> Option<String> {
        self.documents
            .get_source_document(Self::PROJECT, doc)
            .ok()
            .map(|d| d.name)
    }
}

/// `dir/stem.user.ann.json` -> (`dir/stem.txt`, `user`)
fn split_annotation_name(rel: &str) -> Option<(String, String)> {
    let base = rel.strip_suffix(ANNOTATION_SUFFIX)?;
    let (stem, user) = base.rsplit_once('.')?;
    if stem.is_empty() || user.is_empty() || user.contains('/') {
        return None;
    }
    Some((format!("{}.txt", stem), user.to_string()))
}
