pub mod executor;
pub mod parser;

pub use executor::{CacheKey, QueryEngine};
pub use parser::{parse_query, AnnotationPattern, Element, Query, Sequence};
