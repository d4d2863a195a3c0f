//! Shared utilities.
//!
//! - [`app_data`] - application data and index directories
//! - [`encoding`] - varint codec for segment files
//! - [`tokenizer`] - tokens, sentences and char/byte offset mapping
//!
//! ```
//! use annodex::utils::tokenize_str;
//!
//! let tokenized = tokenize_str("Santiago de Compostela.");
//! assert_eq!(tokenized.tokens.len(), 4);
//! ```

pub mod app_data;
pub mod encoding;
pub mod tokenizer;

pub use app_data::*;
pub use encoding::*;
pub use tokenizer::*;
