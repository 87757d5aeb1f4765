//! Structured comparison of two rendered manifest trees.
//!
//! Used as an external diff program: `kubeapply kdiff <old> <new> [shortDiff]`
//! prints the JSON envelope for the two directories.

use std::{io::Write, path::PathBuf};

use anyhow::{Context, Result};
use clap::{builder::BoolishValueParser, Args};
use kubeapply_diff::{diff_dirs, ParseOptions};

use crate::output::{ColorMode, ResultPresenter};

#[derive(Args)]
pub struct KdiffArgs {
	/// Directory holding the current objects
	pub old: PathBuf,

	/// Directory holding the desired objects
	pub new: PathBuf,

	/// Trim context around changes (true/false/1/0)
	#[arg(value_parser = BoolishValueParser::new())]
	pub short_diff: Option<bool>,

	/// Also include unchanged objects
	#[arg(short = 'v', long)]
	pub verbose: bool,

	/// Log level (possible values: error, warn, info, debug, trace)
	#[arg(long)]
	pub log_level: Option<String>,
}

pub fn run<W: Write>(args: KdiffArgs, writer: W) -> Result<()> {
	let options = ParseOptions {
		short_diff: args.short_diff.unwrap_or(false),
		include_unchanged: args.verbose,
	};
	let results = diff_dirs(&args.old, &args.new, options).with_context(|| {
		format!(
			"comparing {} with {}",
			args.old.display(),
			args.new.display()
		)
	})?;

	ResultPresenter::new(writer, ColorMode::Never).write_json(&results)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use clap::Parser;
	use tempfile::TempDir;

	use super::*;

	#[derive(Parser)]
	struct Cli {
		#[command(flatten)]
		args: KdiffArgs,
	}

	#[test]
	fn test_short_diff_argument() {
		let cli = Cli::parse_from(["kdiff", "old", "new"]);
		assert_eq!(cli.args.short_diff, None);

		let cli = Cli::parse_from(["kdiff", "old", "new", "true"]);
		assert_eq!(cli.args.short_diff, Some(true));

		let cli = Cli::parse_from(["kdiff", "old", "new", "0"]);
		assert_eq!(cli.args.short_diff, Some(false));

		assert!(Cli::try_parse_from(["kdiff", "old", "new", "maybe"]).is_err());
	}

	#[test]
	fn test_prints_envelope() {
		let old = TempDir::new().unwrap();
		let new = TempDir::new().unwrap();
		std::fs::write(old.path().join("v1.ConfigMap.default.settings"), "mode: slow\n").unwrap();
		std::fs::write(new.path().join("v1.ConfigMap.default.settings"), "mode: fast\n").unwrap();

		let mut out = Vec::new();
		let args = KdiffArgs {
			old: old.path().to_path_buf(),
			new: new.path().to_path_buf(),
			short_diff: Some(true),
			verbose: false,
			log_level: None,
		};
		run(args, &mut out).unwrap();

		let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
		assert_eq!(value["results"][0]["shortDiff"], true);
		assert_eq!(value["results"][0]["change"], "modified");
		assert_eq!(value["results"][0]["key"]["name"], "settings");
		assert!(out.ends_with(b"}\n"));
	}
}
