pub mod reader;
pub mod state;
pub mod stats;
pub mod types;
pub mod writer;

pub use reader::{IndexRegistry, ProjectIndex};
pub use state::IndexStateTracker;
pub use types::*;
pub use writer::IndexWriter;
