use thiserror::Error;

use crate::key::ResourceKey;

/// Raw diff text did not have the expected two-sided structure.
///
/// Line numbers are 1-based positions in the raw input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
	#[error("line {line}: unexpected content outside of a file diff: {content:?}")]
	UnexpectedLine { line: usize, content: String },

	#[error("line {line}: `diff` command line is not followed by `---`/`+++` file headers")]
	MissingFileHeaders { line: usize },

	#[error("line {line}: `---` header is not followed by a `+++` header")]
	MissingNewHeader { line: usize },

	#[error("line {line}: old and new sides name different objects ({old} vs {new})")]
	MismatchedPaths {
		line: usize,
		old: String,
		new: String,
	},

	#[error("line {line}: cannot derive a resource key from {path:?}")]
	UnrecognizedObjectName { line: usize, path: String },

	#[error("line {line}: malformed hunk header {content:?} for {key}")]
	MalformedHunkHeader {
		line: usize,
		key: ResourceKey,
		content: String,
	},

	#[error(
		"line {line}: hunk for {key} ended early, expected {old_left} more old and {new_left} more new line(s)"
	)]
	TruncatedHunk {
		line: usize,
		key: ResourceKey,
		old_left: usize,
		new_left: usize,
	},

	#[error("line {line}: unexpected line {content:?} inside hunk for {key}")]
	InvalidHunkLine {
		line: usize,
		key: ResourceKey,
		content: String,
	},

	#[error("{key} appears more than once in the diff")]
	DuplicateResource { key: ResourceKey },
}

impl ParseError {
	/// The object the error was found in, when one had been identified.
	pub fn resource_key(&self) -> Option<&ResourceKey> {
		match self {
			Self::MalformedHunkHeader { key, .. }
			| Self::TruncatedHunk { key, .. }
			| Self::InvalidHunkLine { key, .. }
			| Self::DuplicateResource { key } => Some(key),
			Self::UnexpectedLine { .. }
			| Self::MissingFileHeaders { .. }
			| Self::MissingNewHeader { .. }
			| Self::MismatchedPaths { .. }
			| Self::UnrecognizedObjectName { .. } => None,
		}
	}
}
