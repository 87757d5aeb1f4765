//! Parser for the unified diff text produced by `kubectl diff`.
//!
//! kubectl writes the live and merged objects into two directories, one file
//! per object, and runs `diff -u -N` over them. Every file pair therefore
//! starts a new segment: an optional `diff <flags> <old> <new>` command line
//! followed by `---`/`+++` headers and zero or more hunks. Hunk bodies are
//! consumed by the line counts in their `@@` headers, so object content that
//! happens to start with `---` is never taken for a boundary.

use std::{
	iter::{Enumerate, Peekable},
	str::Lines,
	sync::OnceLock,
};

use regex::Regex;
use tracing::{debug, instrument, trace};

use crate::{
	error::ParseError,
	key::ResourceKey,
	model::{
		ChangeKind, ChangeRecord, DiffLine, DiffResultSet, Hunk, LineOp, ParseOptions,
		RecordCollector,
	},
};

pub(crate) const DEV_NULL: &str = "/dev/null";

static HUNK_HEADER: OnceLock<Regex> = OnceLock::new();

fn hunk_header() -> &'static Regex {
	HUNK_HEADER.get_or_init(|| {
		Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@(.*)$")
			.expect("hunk header pattern is valid")
	})
}

/// Old and new line counts from a `@@` header, if `line` is one.
pub(crate) fn hunk_line_counts(line: &str) -> Option<(usize, usize)> {
	let captures = hunk_header().captures(line)?;
	let count = |group: usize| {
		captures
			.get(group)
			.map_or(Some(1), |m| m.as_str().parse().ok())
	};
	Some((count(2)?, count(4)?))
}

/// Parse raw `kubectl diff` output into a result set ordered by resource key.
///
/// Any input that does not follow the expected two-sided structure fails the
/// whole parse; no partial result is returned.
#[instrument(skip_all, fields(bytes = raw.len(), short_diff = options.short_diff))]
pub fn parse_diff(raw: &str, options: ParseOptions) -> Result<DiffResultSet, ParseError> {
	let mut cursor = Cursor::new(raw);
	let mut collector = RecordCollector::new(options);

	while cursor.peek().is_some() {
		let record = read_segment(&mut cursor)?;
		trace!(key = %record.key, change = %record.change, "parsed segment");
		collector.push(record)?;
	}

	let result = collector.finish();
	debug!(records = result.results.len(), "parsed diff");
	Ok(result)
}

/// Input lines with 1-based numbering.
pub(crate) struct Cursor<'a> {
	lines: Peekable<Enumerate<Lines<'a>>>,
	position: usize,
}

impl<'a> Cursor<'a> {
	pub(crate) fn new(text: &'a str) -> Self {
		Self {
			lines: text.lines().enumerate().peekable(),
			position: 0,
		}
	}

	fn peek(&mut self) -> Option<&'a str> {
		self.lines.peek().map(|(_, line)| *line)
	}

	fn next(&mut self) -> Option<(usize, &'a str)> {
		let (index, line) = self.lines.next()?;
		self.position = index + 1;
		Some((self.position, line))
	}

	/// Number of the last consumed line.
	fn position(&self) -> usize {
		self.position
	}
}

fn read_segment(cursor: &mut Cursor<'_>) -> Result<ChangeRecord, ParseError> {
	let mut headers = Vec::with_capacity(3);

	let command = match cursor.peek() {
		Some(line) if line.starts_with("diff ") => cursor.next(),
		_ => None,
	};
	if let Some((_, line)) = command {
		headers.push(line.to_string());
	}

	let (old_no, old_path) = match cursor.next() {
		Some((no, line)) => match line.strip_prefix("--- ") {
			Some(rest) => {
				headers.push(line.to_string());
				(no, header_path(rest))
			}
			None => {
				return Err(match command {
					Some((command_no, _)) => ParseError::MissingFileHeaders { line: command_no },
					None => ParseError::UnexpectedLine {
						line: no,
						content: line.to_string(),
					},
				})
			}
		},
		None => {
			return Err(ParseError::MissingFileHeaders {
				line: cursor.position(),
			})
		}
	};

	let (new_no, new_path) = match cursor.next() {
		Some((no, line)) => match line.strip_prefix("+++ ") {
			Some(rest) => {
				headers.push(line.to_string());
				(no, header_path(rest))
			}
			None => return Err(ParseError::MissingNewHeader { line: old_no }),
		},
		None => return Err(ParseError::MissingNewHeader { line: old_no }),
	};

	let key = segment_key(new_no, old_path, new_path)?;

	let mut hunks = Vec::new();
	while cursor.peek().is_some_and(|line| line.starts_with("@@")) {
		hunks.push(read_hunk(cursor, &key)?);
	}

	let change = ChangeKind::classify(old_path == DEV_NULL, new_path == DEV_NULL, &hunks);
	Ok(ChangeRecord::new(key, change, headers, hunks))
}

/// Strip the tab-separated timestamp GNU diff appends to header paths.
fn header_path(rest: &str) -> &str {
	rest.split_once('\t').map_or(rest, |(path, _)| path).trim_end()
}

fn file_name(path: &str) -> &str {
	path.rsplit('/').next().unwrap_or(path)
}

fn segment_key(line: usize, old_path: &str, new_path: &str) -> Result<ResourceKey, ParseError> {
	let old_name = (old_path != DEV_NULL).then(|| file_name(old_path));
	let new_name = (new_path != DEV_NULL).then(|| file_name(new_path));

	let name = match (old_name, new_name) {
		(Some(old), Some(new)) if old != new => {
			return Err(ParseError::MismatchedPaths {
				line,
				old: old.to_string(),
				new: new.to_string(),
			})
		}
		(_, Some(name)) | (Some(name), None) => name,
		(None, None) => {
			return Err(ParseError::UnrecognizedObjectName {
				line,
				path: new_path.to_string(),
			})
		}
	};

	ResourceKey::from_object_file_name(name).ok_or_else(|| ParseError::UnrecognizedObjectName {
		line,
		path: name.to_string(),
	})
}

/// Read a body made of hunks only, as produced for a single object.
pub(crate) fn read_hunks(text: &str, key: &ResourceKey) -> Result<Vec<Hunk>, ParseError> {
	let mut cursor = Cursor::new(text);
	let mut hunks = Vec::new();

	while let Some(line) = cursor.peek() {
		if !line.starts_with("@@") {
			return Err(ParseError::UnexpectedLine {
				line: cursor.position() + 1,
				content: line.to_string(),
			});
		}
		hunks.push(read_hunk(&mut cursor, key)?);
	}

	Ok(hunks)
}

fn read_hunk(cursor: &mut Cursor<'_>, key: &ResourceKey) -> Result<Hunk, ParseError> {
	let Some((header_no, header)) = cursor.next() else {
		return Err(ParseError::TruncatedHunk {
			line: cursor.position(),
			key: key.clone(),
			old_left: 0,
			new_left: 0,
		});
	};

	let malformed = || ParseError::MalformedHunkHeader {
		line: header_no,
		key: key.clone(),
		content: header.to_string(),
	};
	let captures = hunk_header().captures(header).ok_or_else(malformed)?;
	let number = |group: usize, default: usize| -> Result<usize, ParseError> {
		captures
			.get(group)
			.map_or(Ok(default), |m| m.as_str().parse().map_err(|_| malformed()))
	};

	let old_start = number(1, 0)?;
	let old_lines = number(2, 1)?;
	let new_start = number(3, 0)?;
	let new_lines = number(4, 1)?;
	let section = captures.get(5).map_or("", |m| m.as_str()).to_string();

	let (mut old_left, mut new_left) = (old_lines, new_lines);
	let mut lines: Vec<DiffLine> = Vec::new();

	while old_left > 0 || new_left > 0 {
		let Some((no, raw)) = cursor.next() else {
			return Err(ParseError::TruncatedHunk {
				line: cursor.position(),
				key: key.clone(),
				old_left,
				new_left,
			});
		};
		let invalid = || ParseError::InvalidHunkLine {
			line: no,
			key: key.clone(),
			content: raw.to_string(),
		};

		let (op, text) = match raw.as_bytes().first() {
			// Some tools drop the leading space of empty context lines.
			None => (LineOp::Context, ""),
			Some(b' ') => (LineOp::Context, &raw[1..]),
			Some(b'+') => (LineOp::Added, &raw[1..]),
			Some(b'-') => (LineOp::Removed, &raw[1..]),
			Some(b'\\') => {
				mark_no_newline(&mut lines).ok_or_else(invalid)?;
				continue;
			}
			Some(_) => return Err(invalid()),
		};

		match op {
			LineOp::Context if old_left > 0 && new_left > 0 => {
				old_left -= 1;
				new_left -= 1;
			}
			LineOp::Added if new_left > 0 => new_left -= 1,
			LineOp::Removed if old_left > 0 => old_left -= 1,
			_ => return Err(invalid()),
		}
		lines.push(DiffLine::new(op, text));
	}

	if cursor.peek().is_some_and(|line| line.starts_with('\\')) {
		if let Some((no, raw)) = cursor.next() {
			mark_no_newline(&mut lines).ok_or_else(|| ParseError::InvalidHunkLine {
				line: no,
				key: key.clone(),
				content: raw.to_string(),
			})?;
		}
	}

	Ok(Hunk {
		old_start,
		old_lines,
		new_start,
		new_lines,
		section,
		elided: 0,
		lines,
	})
}

/// Attach a `\ No newline at end of file` marker to the preceding line.
fn mark_no_newline(lines: &mut [DiffLine]) -> Option<()> {
	match lines.last_mut() {
		Some(last) if !last.no_newline => {
			last.no_newline = true;
			Some(())
		}
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use indoc::indoc;

	use super::*;

	const SERVICE_SEGMENT: &str = indoc! {"
		diff -u -N /tmp/LIVE-1/v1.Service.default.web /tmp/MERGED-2/v1.Service.default.web
		--- /tmp/LIVE-1/v1.Service.default.web
		+++ /tmp/MERGED-2/v1.Service.default.web
		@@ -6,7 +6,7 @@
		   namespace: default
		 spec:
		   ports:
		-  - port: 80
		+  - port: 8080
		     protocol: TCP
		     targetPort: http
		   selector:
	"};

	const CONFIGMAP_SEGMENT: &str = indoc! {"
		diff -u -N /tmp/LIVE-1/v1.ConfigMap.default.settings /tmp/MERGED-2/v1.ConfigMap.default.settings
		--- /tmp/LIVE-1/v1.ConfigMap.default.settings
		+++ /tmp/MERGED-2/v1.ConfigMap.default.settings
		@@ -0,0 +1,6 @@
		+apiVersion: v1
		+data:
		+  mode: fast
		+kind: ConfigMap
		+metadata:
		+  name: settings
	"};

	fn total_lines(result: &DiffResultSet) -> usize {
		result.results.iter().map(ChangeRecord::line_count).sum()
	}

	#[test]
	fn test_parse_kubectl_diff() {
		let raw = format!("{SERVICE_SEGMENT}{CONFIGMAP_SEGMENT}");
		let result = parse_diff(&raw, ParseOptions::default()).unwrap();

		let keys: Vec<_> = result.results.iter().map(|r| (r.key.to_string(), r.change)).collect();
		assert_eq!(
			keys,
			vec![
				("default/ConfigMap/settings".to_string(), ChangeKind::Added),
				("default/Service/web".to_string(), ChangeKind::Modified),
			]
		);

		let service = &result.results[1];
		assert_eq!(service.num_added, 1);
		assert_eq!(service.num_removed, 1);
		assert_eq!(service.hunks.len(), 1);
		let changes: Vec<_> = service.hunks[0]
			.lines
			.iter()
			.filter(|l| l.is_change())
			.map(|l| (l.op, l.text.as_str()))
			.collect();
		assert_eq!(
			changes,
			vec![
				(LineOp::Removed, "  - port: 80"),
				(LineOp::Added, "  - port: 8080"),
			]
		);
		assert_eq!(
			service.hunks[0].lines[0],
			DiffLine::new(LineOp::Context, "  namespace: default")
		);
	}

	#[test]
	fn test_every_line_lands_in_one_record() {
		let raw = format!("{SERVICE_SEGMENT}{CONFIGMAP_SEGMENT}");
		let result = parse_diff(&raw, ParseOptions::default()).unwrap();
		assert_eq!(total_lines(&result), raw.lines().count());

		let short = parse_diff(
			&raw,
			ParseOptions {
				short_diff: true,
				..ParseOptions::default()
			},
		)
		.unwrap();
		assert_eq!(total_lines(&short), raw.lines().count());
	}

	#[test]
	fn test_unchanged_segments_need_verbosity() {
		let raw = format!(
			"{}{SERVICE_SEGMENT}",
			indoc! {"
				--- a/v1.Namespace..production
				+++ b/v1.Namespace..production
			"}
		);

		let quiet = parse_diff(&raw, ParseOptions::default()).unwrap();
		assert_eq!(quiet.results.len(), 1);

		let verbose = parse_diff(
			&raw,
			ParseOptions {
				include_unchanged: true,
				..ParseOptions::default()
			},
		)
		.unwrap();
		assert_eq!(verbose.results.len(), 2);
		assert_eq!(verbose.results[0].key, ResourceKey::new("", "Namespace", "production"));
		assert_eq!(verbose.results[0].change, ChangeKind::Unchanged);
		assert_eq!(total_lines(&verbose), raw.lines().count());
	}

	#[test]
	fn test_output_is_independent_of_segment_order() {
		let forward = format!("{SERVICE_SEGMENT}{CONFIGMAP_SEGMENT}");
		let backward = format!("{CONFIGMAP_SEGMENT}{SERVICE_SEGMENT}");

		let json = |raw: &str| {
			parse_diff(raw, ParseOptions::default())
				.unwrap()
				.to_json_pretty()
				.unwrap()
		};
		let first = json(&forward);
		let again = json(&forward);
		let reordered = json(&backward);

		assert_eq!(first, again);
		assert_eq!(first, reordered);
	}

	#[test]
	fn test_removed_object() {
		let raw = indoc! {"
			--- a/v1.Secret.default.legacy
			+++ /dev/null
			@@ -1,3 +0,0 @@
			-apiVersion: v1
			-kind: Secret
			-metadata: {}
		"};
		let result = parse_diff(raw, ParseOptions::default()).unwrap();
		assert_eq!(result.results[0].key, ResourceKey::new("default", "Secret", "legacy"));
		assert_eq!(result.results[0].change, ChangeKind::Removed);
		assert_eq!(result.results[0].num_removed, 3);
	}

	#[test]
	fn test_content_resembling_headers_stays_in_hunk() {
		let raw = indoc! {"
			--- a/v1.ConfigMap.default.script
			+++ b/v1.ConfigMap.default.script
			@@ -1,3 +1,3 @@
			 data:
			--- old banner
			++++ new banner
			 kind: ConfigMap
		"};
		let result = parse_diff(raw, ParseOptions::default()).unwrap();
		assert_eq!(result.results.len(), 1);
		let lines = &result.results[0].hunks[0].lines;
		assert_eq!(lines[1], DiffLine::new(LineOp::Removed, "-- old banner"));
		assert_eq!(lines[2], DiffLine::new(LineOp::Added, "+++ new banner"));
		assert_eq!(result.results[0].change, ChangeKind::Modified);
	}

	#[test]
	fn test_timestamps_and_missing_newline() {
		let raw = "--- /tmp/LIVE-1/v1.ConfigMap.default.a\t2024-01-01 00:00:00.000000000 +0000\n\
		           +++ /tmp/MERGED-1/v1.ConfigMap.default.a\t2024-01-01 00:00:01.000000000 +0000\n\
		           @@ -1 +1 @@\n\
		           -mode: slow\n\
		           \\ No newline at end of file\n\
		           +mode: fast\n\
		           \\ No newline at end of file\n";
		let result = parse_diff(raw, ParseOptions::default()).unwrap();
		let record = &result.results[0];
		assert_eq!(record.key, ResourceKey::new("default", "ConfigMap", "a"));
		assert!(record.hunks[0].lines.iter().all(|l| l.no_newline));
		assert_eq!(record.line_count(), raw.lines().count());
	}

	#[test]
	fn test_empty_input() {
		let result = parse_diff("", ParseOptions::default()).unwrap();
		assert!(result.is_empty());
	}

	#[test]
	fn test_stray_line_fails() {
		let raw = format!("{SERVICE_SEGMENT}Binary files differ\n");
		assert_matches!(
			parse_diff(&raw, ParseOptions::default()),
			Err(ParseError::UnexpectedLine { line: 13, content })
				if content == "Binary files differ"
		);
	}

	#[test]
	fn test_missing_new_header_fails() {
		let raw = "--- a/v1.Service.default.web\n@@ -1 +1 @@\n-a\n+b\n";
		assert_eq!(
			parse_diff(raw, ParseOptions::default()),
			Err(ParseError::MissingNewHeader { line: 1 })
		);
	}

	#[test]
	fn test_command_line_without_headers_fails() {
		let raw = "diff -u -N a/v1.Service.default.web b/v1.Service.default.web\n";
		assert_eq!(
			parse_diff(raw, ParseOptions::default()),
			Err(ParseError::MissingFileHeaders { line: 1 })
		);
	}

	#[test]
	fn test_mismatched_paths_fail() {
		let raw = "--- a/v1.Service.default.web\n+++ b/v1.Service.default.api\n";
		assert_matches!(
			parse_diff(raw, ParseOptions::default()),
			Err(ParseError::MismatchedPaths { line: 2, .. })
		);
	}

	#[test]
	fn test_unrecognized_name_fails() {
		let raw = "--- a/service.yaml\n+++ b/service.yaml\n";
		assert_matches!(
			parse_diff(raw, ParseOptions::default()),
			Err(ParseError::UnrecognizedObjectName { path, .. }) if path == "service.yaml"
		);
	}

	#[test]
	fn test_truncated_hunk_fails_with_key() {
		let raw = concat!(
			"--- a/v1.Service.default.web\n",
			"+++ b/v1.Service.default.web\n",
			"@@ -1,3 +1,3 @@\n a\n-b\n",
		);
		let err = parse_diff(raw, ParseOptions::default()).unwrap_err();
		assert_matches!(
			&err,
			ParseError::TruncatedHunk { old_left: 1, new_left: 2, .. }
		);
		assert_eq!(
			err.resource_key(),
			Some(&ResourceKey::new("default", "Service", "web"))
		);
	}

	#[test]
	fn test_hunk_overflow_fails() {
		let raw = concat!(
			"--- a/v1.Service.default.web\n",
			"+++ b/v1.Service.default.web\n",
			"@@ -1 +1 @@\n-a\n-b\n",
		);
		assert_matches!(
			parse_diff(raw, ParseOptions::default()),
			Err(ParseError::InvalidHunkLine { line: 5, .. })
		);
	}

	#[test]
	fn test_malformed_hunk_header_fails() {
		let raw = "--- a/v1.Service.default.web\n+++ b/v1.Service.default.web\n@@ nonsense @@\n";
		assert_matches!(
			parse_diff(raw, ParseOptions::default()),
			Err(ParseError::MalformedHunkHeader { line: 3, .. })
		);
	}

	#[test]
	fn test_duplicate_segment_fails() {
		let raw = format!("{SERVICE_SEGMENT}{SERVICE_SEGMENT}");
		assert_eq!(
			parse_diff(&raw, ParseOptions::default()),
			Err(ParseError::DuplicateResource {
				key: ResourceKey::new("default", "Service", "web")
			})
		);
	}

	#[test]
	fn test_short_diff_is_flagged() {
		let raw = indoc! {"
			--- a/v1.ConfigMap.default.a
			+++ b/v1.ConfigMap.default.a
			@@ -1,7 +1,7 @@
			 one
			 two
			 three
			-four
			+FOUR
			 five
			 six
			 seven
		"};
		let result = parse_diff(
			raw,
			ParseOptions {
				short_diff: true,
				..ParseOptions::default()
			},
		)
		.unwrap();
		assert!(result.is_short());
		assert!(result.results[0].short_diff);
		let hunk = &result.results[0].hunks[0];
		assert_eq!(hunk.elided, 4);
		let texts: Vec<_> = hunk.lines.iter().map(|l| l.text.as_str()).collect();
		assert_eq!(texts, ["three", "four", "FOUR", "five"]);
	}
}
