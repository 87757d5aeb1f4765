//! Context trimming for short diff output.

use crate::{
	model::{DiffLine, Hunk},
	parser::hunk_line_counts,
};

/// Drop every context line that is not directly next to a change, so each
/// run of changes keeps at most one line of context on either side.
///
/// Dropped raw lines are counted in [`Hunk::elided`].
pub(crate) fn shorten_hunk(hunk: &mut Hunk) {
	let keep: Vec<bool> = (0..hunk.lines.len())
		.map(|i| {
			hunk.lines[i].is_change()
				|| (i > 0 && hunk.lines[i - 1].is_change())
				|| hunk.lines.get(i + 1).is_some_and(DiffLine::is_change)
		})
		.collect();

	let lines = std::mem::take(&mut hunk.lines);
	for (line, keep) in lines.into_iter().zip(keep) {
		if keep {
			hunk.lines.push(line);
		} else {
			hunk.elided += 1 + usize::from(line.no_newline);
		}
	}
}

/// Apply short diff trimming to unified diff text without parsing it into
/// records.
///
/// Only hunks whose bodies agree with their `@@` line counts are trimmed;
/// everything else passes through byte for byte. Each dropped run of context
/// becomes a single `  ... N unchanged line(s) hidden` line.
pub fn shorten_unified(raw: &str) -> String {
	let lines: Vec<&str> = raw.split_inclusive('\n').collect();
	let mut out = String::with_capacity(raw.len());

	let mut i = 0;
	while i < lines.len() {
		let line = lines[i];
		out.push_str(line);
		i += 1;

		let Some((old, new)) = hunk_line_counts(line.trim_end_matches(['\n', '\r'])) else {
			continue;
		};
		if let Some(len) = hunk_body_len(&lines[i..], old, new) {
			shorten_body(&lines[i..i + len], &mut out);
			i += len;
		}
	}
	out
}

/// Number of lines making up a hunk body, or `None` if the lines do not add
/// up to the given counts.
fn hunk_body_len(lines: &[&str], mut old: usize, mut new: usize) -> Option<usize> {
	let mut len = 0;
	while old > 0 || new > 0 {
		let line = lines.get(len)?;
		match line.as_bytes().first() {
			Some(b' ' | b'\n' | b'\r') if old > 0 && new > 0 => {
				old -= 1;
				new -= 1;
			}
			Some(b'+') if new > 0 => new -= 1,
			Some(b'-') if old > 0 => old -= 1,
			Some(b'\\') => {}
			_ => return None,
		}
		len += 1;
	}
	if lines.get(len).is_some_and(|line| line.starts_with('\\')) {
		len += 1;
	}
	Some(len)
}

fn shorten_body(body: &[&str], out: &mut String) {
	let is_change = |line: &str| line.starts_with(['+', '-']);
	let real: Vec<usize> = (0..body.len()).filter(|&i| !body[i].starts_with('\\')).collect();

	let mut keep = vec![false; body.len()];
	for (n, &i) in real.iter().enumerate() {
		keep[i] = is_change(body[i])
			|| (n > 0 && is_change(body[real[n - 1]]))
			|| real.get(n + 1).is_some_and(|&next| is_change(body[next]));
	}
	// `\ No newline` markers follow the line they belong to.
	for i in 1..body.len() {
		if body[i].starts_with('\\') {
			keep[i] = keep[i - 1];
		}
	}

	let mut hidden = 0;
	for (line, keep) in body.iter().zip(keep) {
		if keep {
			flush_hidden(&mut hidden, out);
			out.push_str(line);
		} else {
			hidden += 1;
		}
	}
	flush_hidden(&mut hidden, out);
}

fn flush_hidden(hidden: &mut usize, out: &mut String) {
	if *hidden > 0 {
		out.push_str(&format!("  ... {hidden} unchanged line(s) hidden\n"));
		*hidden = 0;
	}
}
