//! Structured diffs of Kubernetes manifests.
//!
//! Turns the text produced by `kubectl diff` (or a comparison of two rendered
//! manifest trees) into change records keyed by namespace, kind and name.
//! Everything here is pure: no network access and no shared state.

mod error;
mod key;
mod model;
mod parser;
mod short;
pub mod tree;

pub use error::ParseError;
pub use key::ResourceKey;
pub use model::{ChangeKind, ChangeRecord, DiffLine, DiffResultSet, Hunk, LineOp, ParseOptions};
pub use parser::parse_diff;
pub use short::shorten_unified;
pub use tree::{diff_dirs, diff_trees, ManifestTree, TreeError};
