//! Shell-style path globbing for config and subpath arguments.

use std::path::{Component, Path, PathBuf};

use globset::GlobBuilder;
use tracing::debug;
use walkdir::WalkDir;

fn is_pattern(s: &str) -> bool {
	s.contains(['*', '?', '[', '{'])
}

/// Expand `pattern` into the existing paths it matches, sorted.
///
/// A pattern without glob characters is returned as-is when it exists. Each
/// `*` stays within one path component. Unreadable directories are skipped.
pub fn expand(pattern: &Path) -> Result<Vec<PathBuf>, globset::Error> {
	let mut base = PathBuf::new();
	let mut rest = Vec::new();
	for component in pattern.components() {
		let text = component.as_os_str().to_string_lossy();
		let literal = !(matches!(component, Component::Normal(_)) && is_pattern(&text));
		if rest.is_empty() && literal {
			base.push(component);
		} else {
			rest.push(text.into_owned());
		}
	}

	if rest.is_empty() {
		return Ok(if base.exists() { vec![base] } else { Vec::new() });
	}

	let matcher = GlobBuilder::new(&rest.join("/"))
		.literal_separator(true)
		.build()?
		.compile_matcher();
	let root = if base.as_os_str().is_empty() {
		Path::new(".")
	} else {
		base.as_path()
	};

	let mut matches: Vec<PathBuf> = WalkDir::new(root)
		.min_depth(rest.len())
		.max_depth(rest.len())
		.into_iter()
		.filter_map(Result::ok)
		.filter_map(|entry| {
			let relative = entry.path().strip_prefix(root).ok()?;
			matcher.is_match(relative).then(|| base.join(relative))
		})
		.collect();
	matches.sort();
	debug!(pattern = %pattern.display(), matches = matches.len(), "expanded glob");
	Ok(matches)
}
