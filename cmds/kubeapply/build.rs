use std::process::Command;

/// Version used by release builds; anything else is a local build.
const PLACEHOLDER_VERSION: &str = "0.1.0";

fn main() {
	println!("cargo:rerun-if-changed=.git/HEAD");
	println!("cargo:rerun-if-changed=.git/refs/");

	println!("cargo:rustc-env=KUBEAPPLY_VERSION={}", version());
}

fn version() -> String {
	let cargo_version = env!("CARGO_PKG_VERSION");
	if cargo_version != PLACEHOLDER_VERSION {
		return cargo_version.to_string();
	}

	// Exact tag (v1.2.3 -> 1.2.3), then short commit hash
	git(&["describe", "--tags", "--exact-match", "HEAD"])
		.map(|tag| tag.trim_start_matches('v').to_string())
		.or_else(|| git(&["rev-parse", "--short", "HEAD"]))
		.unwrap_or_else(|| cargo_version.to_string())
}

fn git(args: &[&str]) -> Option<String> {
	let output = Command::new("git").args(args).output().ok()?;
	if !output.status.success() {
		return None;
	}
	let text = String::from_utf8(output.stdout).ok()?;
	let text = text.trim();
	(!text.is_empty()).then(|| text.to_string())
}
