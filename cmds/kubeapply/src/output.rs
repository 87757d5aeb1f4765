//! Rendering diff results for humans and machines.

use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use kubeapply_diff::{ChangeKind, ChangeRecord, DiffLine, DiffResultSet, Hunk, LineOp};
use nu_ansi_term::{Color, Style};
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum OutputError {
	#[error("writing diff output")]
	Write(#[from] std::io::Error),

	#[error("serializing diff results")]
	Json(#[from] serde_json::Error),
}

/// When to emit ANSI colors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
	/// Color when stdout is a terminal.
	#[default]
	Auto,
	Always,
	Never,
}

impl ColorMode {
	pub fn should_colorize(self) -> bool {
		match self {
			Self::Auto => std::io::stdout().is_terminal(),
			Self::Always => true,
			Self::Never => false,
		}
	}
}

fn change_color(change: ChangeKind) -> Option<Color> {
	match change {
		ChangeKind::Added => Some(Color::Green),
		ChangeKind::Removed => Some(Color::Red),
		ChangeKind::Modified => Some(Color::Yellow),
		ChangeKind::Unchanged => None,
	}
}

/// Writes a [`DiffResultSet`] to a sink. Never modifies the results.
pub struct ResultPresenter<W: Write> {
	writer: W,
	use_color: bool,
	include_unchanged: bool,
}

impl<W: Write> ResultPresenter<W> {
	pub fn new(writer: W, color: ColorMode) -> Self {
		Self {
			writer,
			use_color: color.should_colorize(),
			include_unchanged: false,
		}
	}

	/// Also print records without changes.
	pub fn include_unchanged(mut self, include: bool) -> Self {
		self.include_unchanged = include;
		self
	}

	pub fn into_inner(self) -> W {
		self.writer
	}

	fn paint(&self, style: Style, text: &str) -> String {
		if self.use_color {
			style.paint(text).to_string()
		} else {
			text.to_string()
		}
	}

	/// Every record with its hunks.
	#[instrument(skip_all, fields(records = results.results.len()))]
	pub fn write_full(&mut self, results: &DiffResultSet) -> Result<(), OutputError> {
		let mut written = 0;
		for record in &results.results {
			if !record.has_changes() && !self.include_unchanged {
				continue;
			}
			if written > 0 {
				writeln!(self.writer)?;
			}
			self.write_record(record)?;
			written += 1;
		}

		if written == 0 {
			writeln!(self.writer, "No differences.")?;
		}
		self.writer.flush()?;
		Ok(())
	}

	fn write_record(&mut self, record: &ChangeRecord) -> Result<(), OutputError> {
		let header = format!(
			"{} {} ({}, +{} -{})",
			record.change.symbol(),
			record.key,
			record.change,
			record.num_added,
			record.num_removed
		);
		let style = match change_color(record.change) {
			Some(color) => Style::new().bold().fg(color),
			None => Style::new().bold(),
		};
		let header = self.paint(style, &header);
		writeln!(self.writer, "{}", header.trim_end())?;

		for hunk in &record.hunks {
			self.write_hunk(hunk)?;
		}
		Ok(())
	}

	fn write_hunk(&mut self, hunk: &Hunk) -> Result<(), OutputError> {
		let header = self.paint(Style::new().fg(Color::Cyan), &hunk.header());
		writeln!(self.writer, "{header}")?;

		for line in &hunk.lines {
			self.write_line(line)?;
		}

		if hunk.elided > 0 {
			let note = format!("  ... {} unchanged line(s) hidden", hunk.elided);
			let note = self.paint(Style::new().dimmed(), &note);
			writeln!(self.writer, "{note}")?;
		}
		Ok(())
	}

	fn write_line(&mut self, line: &DiffLine) -> Result<(), OutputError> {
		let text = format!("{}{}", line.op.marker(), line.text);
		let text = match line.op {
			LineOp::Added => self.paint(Style::new().fg(Color::Green), &text),
			LineOp::Removed => self.paint(Style::new().fg(Color::Red), &text),
			LineOp::Context => text,
		};
		writeln!(self.writer, "{text}")?;

		if line.no_newline {
			writeln!(self.writer, "\\ No newline at end of file")?;
		}
		Ok(())
	}

	/// Keys of changed records grouped by kind of change.
	#[instrument(skip_all, fields(records = results.results.len()))]
	pub fn write_summary(&mut self, results: &DiffResultSet) -> Result<(), OutputError> {
		let mut added = Vec::new();
		let mut modified = Vec::new();
		let mut removed = Vec::new();

		for record in &results.results {
			let name = record.key.to_string();
			match record.change {
				ChangeKind::Added => added.push(name),
				ChangeKind::Modified => modified.push(name),
				ChangeKind::Removed => removed.push(name),
				ChangeKind::Unchanged => {}
			}
		}

		for (title, items, color) in [
			("Added", &added, Color::Green),
			("Modified", &modified, Color::Yellow),
			("Removed", &removed, Color::Red),
		] {
			if !items.is_empty() {
				self.write_section(title, items, color)?;
			}
		}

		let total = added.len() + modified.len() + removed.len();
		writeln!(self.writer)?;
		let line = self.paint(
			Style::new().bold(),
			&format!("Total: {total} resource(s) with changes"),
		);
		writeln!(self.writer, "{line}")?;
		self.writer.flush()?;
		Ok(())
	}

	fn write_section(
		&mut self,
		title: &str,
		items: &[String],
		color: Color,
	) -> Result<(), OutputError> {
		let title = self.paint(Style::new().bold().fg(color), &format!("{title}:"));
		writeln!(self.writer, "\n{title}")?;
		for item in items {
			let item = self.paint(Style::new().fg(color), item);
			writeln!(self.writer, "  {item}")?;
		}
		Ok(())
	}

	/// The JSON envelope, indented, with a trailing newline.
	pub fn write_json(&mut self, results: &DiffResultSet) -> Result<(), OutputError> {
		serde_json::to_writer_pretty(&mut self.writer, results)?;
		writeln!(self.writer)?;
		self.writer.flush()?;
		Ok(())
	}

	/// Diff tool output, verbatim.
	pub fn write_raw(&mut self, raw: &str) -> Result<(), OutputError> {
		self.writer.write_all(raw.as_bytes())?;
		self.writer.flush()?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use indoc::indoc;
	use kubeapply_diff::{parse_diff, ParseOptions};

	use super::*;

	const RAW: &str = indoc! {"
		--- /tmp/LIVE-1/v1.ConfigMap.default.settings
		+++ /tmp/MERGED-1/v1.ConfigMap.default.settings
		@@ -0,0 +1,2 @@
		+data:
		+  mode: fast
		--- /tmp/LIVE-1/v1.Service.default.web
		+++ /tmp/MERGED-1/v1.Service.default.web
		@@ -1,3 +1,3 @@
		 spec:
		   ports:
		-  - port: 80
		+  - port: 8080
	"};

	fn render(f: impl FnOnce(&mut ResultPresenter<Vec<u8>>) -> Result<(), OutputError>) -> String {
		let mut presenter = ResultPresenter::new(Vec::new(), ColorMode::Never);
		f(&mut presenter).unwrap();
		String::from_utf8(presenter.into_inner()).unwrap()
	}

	#[test]
	fn test_color_mode() {
		assert!(ColorMode::Always.should_colorize());
		assert!(!ColorMode::Never.should_colorize());
	}

	#[test]
	fn test_full_output() {
		let results = parse_diff(RAW, ParseOptions::default()).unwrap();
		let out = render(|p| p.write_full(&results));
		assert_eq!(
			out,
			indoc! {"
				+ default/ConfigMap/settings (added, +2 -0)
				@@ -0,0 +1,2 @@
				+data:
				+  mode: fast

				~ default/Service/web (modified, +1 -1)
				@@ -1,3 +1,3 @@
				 spec:
				   ports:
				-  - port: 80
				+  - port: 8080
			"}
		);
	}

	#[test]
	fn test_short_diff_shows_elided_lines() {
		let options = ParseOptions {
			short_diff: true,
			..Default::default()
		};
		let results = parse_diff(RAW, options).unwrap();
		let out = render(|p| p.write_full(&results));
		assert!(out.contains("  ... 1 unchanged line(s) hidden\n"), "{out}");
		assert!(!out.contains(" spec:\n"), "{out}");
	}

	#[test]
	fn test_empty_results() {
		let out = render(|p| p.write_full(&DiffResultSet::default()));
		assert_eq!(out, "No differences.\n");

		let out = render(|p| p.write_json(&DiffResultSet::default()));
		assert_eq!(out, "{\n  \"results\": []\n}\n");
	}

	#[test]
	fn test_summary() {
		let results = parse_diff(RAW, ParseOptions::default()).unwrap();
		let out = render(|p| p.write_summary(&results));
		assert_eq!(
			out,
			indoc! {"

				Added:
				  default/ConfigMap/settings

				Modified:
				  default/Service/web

				Total: 2 resource(s) with changes
			"}
		);
	}

	#[test]
	fn test_colored_output() {
		let results = parse_diff(RAW, ParseOptions::default()).unwrap();
		let mut presenter = ResultPresenter::new(Vec::new(), ColorMode::Always);
		presenter.write_full(&results).unwrap();
		let out = String::from_utf8(presenter.into_inner()).unwrap();
		assert!(out.contains(&Color::Green.paint("+data:").to_string()));
		assert!(out.contains(&Color::Red.paint("-  - port: 80").to_string()));
	}
}
