mod matcher;
mod tree;

pub use matcher::{DomainMatcher, LoadReport};
pub use tree::{normalize, parse_line, LabelTree, Line};
