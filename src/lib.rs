//! # annodex - annotation document search
//!
//! annodex keeps a per-project index over annotated text documents and
//! answers token, phrase and structural (layer/feature) queries with exact
//! character offsets and a short context on each side. It also computes
//! corpus statistics over token, sentence and annotation counts.
//!
//! ## Architecture
//!
//! - [`document`] - collaborator traits, annotation graphs, in-memory and on-disk corpora
//! - [`index`] - segment building, the per-project store, index state and statistics
//! - [`query`] - query parsing and execution
//! - [`scheduler`] - background reindex queue and worker pool
//! - [`service`] - the [`SearchService`] facade tying it all together
//! - [`output`] - terminal formatting for the CLI
//! - [`utils`] - tokenizer, binary encoding, app data directories
//!
//! ## Quick Start
//!
//! ```no_run
//! use annodex::config::SearchConfig;
//! use annodex::document::{MemoryDocumentService, MemorySchemaService};
//! use annodex::service::SearchService;
//! use std::sync::Arc;
//!
//! let docs = Arc::new(MemoryDocumentService::new());
//! let schema = Arc::new(MemorySchemaService::new());
//! let service = SearchService::new(SearchConfig::with_base_dir("/tmp/annodex"), docs.clone(), schema);
//!
//! let (_, event) = docs.upload_source_document(1, "galicia.txt", "The capital of Galicia is Santiago de Compostela.");
//! service.handle_event(event).unwrap();
//! service.await_index(1).unwrap();
//!
//! for hit in service.query("admin", 1, "Galicia", None).unwrap() {
//!     println!("{}[{}]{}", hit.left_context, hit.text, hit.right_context);
//! }
//! ```

pub mod config;
pub mod document;
pub mod error;
pub mod index;
pub mod output;
pub mod query;
pub mod scheduler;
pub mod service;
pub mod utils;

pub use error::{Result, SearchError};
pub use service::SearchService;
