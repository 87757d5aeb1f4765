//! Structured change model produced by the parser.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{error::ParseError, key::ResourceKey, short::shorten_hunk};

/// Tag carried by every line inside a hunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineOp {
	Context,
	Added,
	Removed,
}

impl LineOp {
	/// Unified diff marker for this line.
	pub fn marker(self) -> char {
		match self {
			Self::Context => ' ',
			Self::Added => '+',
			Self::Removed => '-',
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffLine {
	pub op: LineOp,
	pub text: String,
	/// Set when the line was followed by `\ No newline at end of file`.
	#[serde(default)]
	pub no_newline: bool,
}

impl DiffLine {
	pub fn new(op: LineOp, text: impl Into<String>) -> Self {
		Self {
			op,
			text: text.into(),
			no_newline: false,
		}
	}

	pub fn is_change(&self) -> bool {
		self.op != LineOp::Context
	}
}

/// One `@@` block of a unified diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hunk {
	pub old_start: usize,
	pub old_lines: usize,
	pub new_start: usize,
	pub new_lines: usize,
	/// Text following the closing `@@`, usually empty.
	pub section: String,
	/// Raw lines dropped from `lines` by short diff mode.
	pub elided: usize,
	pub lines: Vec<DiffLine>,
}

impl Hunk {
	/// Render the `@@ -a,b +c,d @@` header line.
	pub fn header(&self) -> String {
		format!(
			"@@ -{} +{} @@{}",
			format_range(self.old_start, self.old_lines),
			format_range(self.new_start, self.new_lines),
			self.section
		)
	}

	pub fn added(&self) -> usize {
		self.count(LineOp::Added)
	}

	pub fn removed(&self) -> usize {
		self.count(LineOp::Removed)
	}

	fn count(&self, op: LineOp) -> usize {
		self.lines.iter().filter(|l| l.op == op).count()
	}

	/// Whether this hunk describes a side with no content at all.
	fn old_is_empty(&self) -> bool {
		self.old_start == 0 && self.old_lines == 0
	}

	fn new_is_empty(&self) -> bool {
		self.new_start == 0 && self.new_lines == 0
	}
}

fn format_range(start: usize, len: usize) -> String {
	if len == 1 {
		start.to_string()
	} else {
		format!("{start},{len}")
	}
}

/// How an object changed between the two sides of a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
	Added,
	Removed,
	Modified,
	Unchanged,
}

impl ChangeKind {
	/// Classify a segment from its hunks.
	///
	/// `old_absent` and `new_absent` report whether the tool marked a side as
	/// missing (`/dev/null`). A side whose only hunks cover an empty range is
	/// treated as missing as well, since `diff -N` renders absent files as
	/// empty ones.
	pub fn classify(old_absent: bool, new_absent: bool, hunks: &[Hunk]) -> Self {
		let added: usize = hunks.iter().map(Hunk::added).sum();
		let removed: usize = hunks.iter().map(Hunk::removed).sum();

		let old_absent = old_absent || (!hunks.is_empty() && hunks.iter().all(Hunk::old_is_empty));
		let new_absent = new_absent || (!hunks.is_empty() && hunks.iter().all(Hunk::new_is_empty));

		match (added, removed) {
			(0, 0) => Self::Unchanged,
			(_, 0) if old_absent => Self::Added,
			(0, _) if new_absent => Self::Removed,
			_ => Self::Modified,
		}
	}

	pub fn symbol(self) -> char {
		match self {
			Self::Added => '+',
			Self::Removed => '-',
			Self::Modified => '~',
			Self::Unchanged => ' ',
		}
	}
}

impl fmt::Display for ChangeKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Added => write!(f, "added"),
			Self::Removed => write!(f, "removed"),
			Self::Modified => write!(f, "modified"),
			Self::Unchanged => write!(f, "unchanged"),
		}
	}
}

/// Changes to a single object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
	pub key: ResourceKey,
	pub change: ChangeKind,
	/// File header lines (`diff ...`, `--- ...`, `+++ ...`) as emitted by the tool.
	pub headers: Vec<String>,
	pub num_added: usize,
	pub num_removed: usize,
	/// Hunk context was trimmed; see [`Hunk::elided`].
	#[serde(default)]
	pub short_diff: bool,
	pub hunks: Vec<Hunk>,
}

impl ChangeRecord {
	pub fn new(
		key: ResourceKey,
		change: ChangeKind,
		headers: Vec<String>,
		hunks: Vec<Hunk>,
	) -> Self {
		Self {
			num_added: hunks.iter().map(Hunk::added).sum(),
			num_removed: hunks.iter().map(Hunk::removed).sum(),
			key,
			change,
			headers,
			short_diff: false,
			hunks,
		}
	}

	/// Trim every hunk down to the context next to its changes.
	pub fn shorten(&mut self) {
		self.hunks.iter_mut().for_each(shorten_hunk);
		self.short_diff = true;
	}

	pub fn has_changes(&self) -> bool {
		self.change != ChangeKind::Unchanged
	}

	/// Number of raw input lines accounted for by this record, including
	/// headers, hunk headers, `\ No newline` markers and elided lines.
	pub fn line_count(&self) -> usize {
		self.headers.len()
			+ self
				.hunks
				.iter()
				.map(|h| {
					1 + h.elided
						+ h.lines.len()
						+ h.lines.iter().filter(|l| l.no_newline).count()
				})
				.sum::<usize>()
	}
}

/// Structured diff for one cluster run.
///
/// Serializes as `{"results": [...]}`; the shape does not depend on how many
/// records there are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResultSet {
	pub results: Vec<ChangeRecord>,
}

impl DiffResultSet {
	pub fn is_empty(&self) -> bool {
		self.results.is_empty()
	}

	pub fn has_changes(&self) -> bool {
		self.results.iter().any(ChangeRecord::has_changes)
	}

	/// Whether the records were produced in short diff mode.
	pub fn is_short(&self) -> bool {
		self.results.iter().any(|r| r.short_diff)
	}

	pub fn get(&self, key: &ResourceKey) -> Option<&ChangeRecord> {
		self.results.iter().find(|r| &r.key == key)
	}

	/// Serialize as indented JSON.
	pub fn to_json_pretty(&self) -> serde_json::Result<String> {
		serde_json::to_string_pretty(self)
	}
}

/// Options shared by the unified diff parser and the tree comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseOptions {
	/// Trim hunk context down to the lines adjacent to each change.
	pub short_diff: bool,
	/// Keep records for objects that did not change.
	pub include_unchanged: bool,
}

/// Collects records keyed by resource, rejecting duplicates, and produces
/// the ordered result set.
pub(crate) struct RecordCollector {
	options: ParseOptions,
	records: BTreeMap<ResourceKey, ChangeRecord>,
}

impl RecordCollector {
	pub(crate) fn new(options: ParseOptions) -> Self {
		Self {
			options,
			records: BTreeMap::new(),
		}
	}

	pub(crate) fn push(&mut self, record: ChangeRecord) -> Result<(), ParseError> {
		if self.records.contains_key(&record.key) {
			return Err(ParseError::DuplicateResource { key: record.key });
		}
		self.records.insert(record.key.clone(), record);
		Ok(())
	}

	pub(crate) fn finish(self) -> DiffResultSet {
		let ParseOptions {
			short_diff,
			include_unchanged,
		} = self.options;

		let results = self
			.records
			.into_values()
			.filter(|r| include_unchanged || r.has_changes())
			.map(|mut r| {
				if short_diff {
					r.shorten();
				}
				r
			})
			.collect();

		DiffResultSet { results }
	}
}
