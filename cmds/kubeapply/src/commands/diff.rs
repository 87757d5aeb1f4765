//! Diff command handler.

use std::{
	io::Write,
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
	config::{expand_config_paths, resolve_kubeconfig, ClusterConfig, KUBECONFIG_ENV},
	error::DiffError,
	k8s::{DiffExecutor, KubeUidLookup, Kubectl, UidLookup},
	lock::{ConcurrencyGuard, FileLocks},
	orchestrator::{DiffOrchestrator, DiffOutput, DiffRequest, OutputMode},
	output::{ColorMode, ResultPresenter},
};

#[derive(Args)]
pub struct DiffArgs {
	/// Cluster config files; globs are allowed
	#[arg(required = true)]
	pub configs: Vec<PathBuf>,

	/// Path to the kubeconfig; defaults to the KUBECONFIG env variable
	#[arg(long)]
	pub kubeconfig: Option<PathBuf>,

	/// Only diff these subpaths of the expanded manifests (repeatable, globs
	/// are allowed)
	#[arg(long)]
	pub subpath: Vec<PathBuf>,

	/// Print kubectl's diff output as-is instead of parsing it
	#[arg(long)]
	pub simple_output: bool,

	/// Only show changed lines and the lines right next to them
	#[arg(long)]
	pub short_diff: bool,

	/// Also show resources without changes
	#[arg(short = 'v', long)]
	pub verbose: bool,

	/// Print results as JSON
	#[arg(long, conflicts_with = "summarize")]
	pub json: bool,

	/// Print summary of the differences, not the actual contents
	#[arg(short = 's', long)]
	pub summarize: bool,

	/// Hold a per-cluster lock while diffing
	#[arg(long)]
	pub use_locks: bool,

	/// Directory holding lock files
	#[arg(long)]
	pub lock_dir: Option<PathBuf>,

	/// Seconds to wait for a cluster lock before giving up
	#[arg(long)]
	pub lock_timeout: Option<u64>,

	/// Seconds after which a lock file is considered abandoned
	#[arg(long)]
	pub lock_stale_after: Option<u64>,

	/// kubectl binary to run
	#[arg(long, default_value = "kubectl")]
	pub kubectl: String,

	/// Controls color in diff output
	#[arg(long, value_enum, default_value_t = ColorMode::Auto)]
	pub color: ColorMode,

	/// Log level (possible values: error, warn, info, debug, trace)
	#[arg(long)]
	pub log_level: Option<String>,

	/// Keep diffing the remaining clusters after one fails
	#[arg(long)]
	pub keep_going: bool,
}

impl DiffArgs {
	fn mode(&self) -> OutputMode {
		if self.simple_output {
			OutputMode::Raw
		} else {
			OutputMode::Structured
		}
	}

	fn lock_dir(&self) -> PathBuf {
		self.lock_dir
			.clone()
			.unwrap_or_else(|| std::env::temp_dir().join("kubeapply-locks"))
	}

	fn locks(&self) -> ConcurrencyGuard {
		let mut locks = FileLocks::new(self.lock_dir());
		if let Some(secs) = self.lock_stale_after {
			locks = locks.with_stale_after(Duration::from_secs(secs));
		}
		ConcurrencyGuard::new(Arc::new(locks))
	}

	/// Build the request for one cluster config file.
	fn request(&self, config_path: &Path) -> Result<DiffRequest, DiffError> {
		let configuration_error = |source| DiffError::Configuration {
			cluster: config_path.display().to_string(),
			source,
		};

		let config = ClusterConfig::load(config_path).map_err(configuration_error)?;
		let kubeconfig = resolve_kubeconfig(
			self.kubeconfig.as_deref(),
			std::env::var_os(KUBECONFIG_ENV).as_deref(),
		)
		.map_err(|source| DiffError::Configuration {
			cluster: config.descriptive_name(),
			source,
		})?;

		let mut target = config.into_target(kubeconfig, Vec::new());
		target.use_locks |= self.use_locks;

		Ok(DiffRequest::builder()
			.target(target)
			.mode(self.mode())
			.scope(self.subpath.clone())
			.short_diff(self.short_diff)
			.include_unchanged(self.verbose)
			.maybe_lock_timeout(self.lock_timeout.map(Duration::from_secs))
			.build())
	}

	fn present<W: Write>(&self, output: &DiffOutput, writer: W) -> Result<()> {
		let mut presenter =
			ResultPresenter::new(writer, self.color).include_unchanged(self.verbose);
		match output {
			DiffOutput::Raw(raw) => presenter.write_raw(raw)?,
			DiffOutput::Structured(results) if self.json => presenter.write_json(results)?,
			DiffOutput::Structured(results) if self.summarize => presenter.write_summary(results)?,
			DiffOutput::Structured(results) => presenter.write_full(results)?,
		}
		Ok(())
	}
}

/// Run the diff command.
pub fn run<W: Write>(args: DiffArgs, writer: W) -> Result<()> {
	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("starting async runtime")?;
	runtime.block_on(run_async(args, writer))
}

async fn run_async<W: Write>(args: DiffArgs, mut writer: W) -> Result<()> {
	let cancel = CancellationToken::new();
	let interrupt = {
		let cancel = cancel.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				warn!("Interrupted, cancelling diff");
				cancel.cancel();
			}
		})
	};

	let orchestrator = DiffOrchestrator::new(
		KubeUidLookup,
		Kubectl::new(args.kubectl.clone()),
		args.locks(),
	);

	let result = diff_all(&args, &orchestrator, &cancel, &mut writer).await;
	interrupt.abort();
	result
}

/// Diff every cluster named by the config arguments, in order.
///
/// Stops at the first failure unless `--keep-going` is set, and always stops
/// once cancelled. Fails if any cluster failed.
async fn diff_all<L: UidLookup, X: DiffExecutor, W: Write>(
	args: &DiffArgs,
	orchestrator: &DiffOrchestrator<L, X>,
	cancel: &CancellationToken,
	mut writer: W,
) -> Result<()> {
	let config_paths = expand_config_paths(&args.configs)?;

	let mut failed = 0;
	for config_path in &config_paths {
		let result = match args.request(config_path) {
			Ok(request) => orchestrator.run(&request, cancel).await,
			Err(e) => Err(e),
		};

		match result {
			Ok(outcome) => args
				.present(&outcome.output, &mut writer)
				.with_context(|| format!("writing diff for {}", config_path.display()))?,
			Err(e) => {
				failed += 1;
				report(e);
				if !args.keep_going || cancel.is_cancelled() {
					break;
				}
			}
		}
	}

	if failed > 0 {
		anyhow::bail!("{failed} of {} cluster diff(s) failed", config_paths.len());
	}
	Ok(())
}

fn report(e: DiffError) {
	let kind = e.kind();
	let cluster = e.cluster().to_string();
	let resource = e.resource_key().map(ToString::to_string);
	let hint = e.hint();

	error!(
		%cluster,
		%kind,
		resource = resource.as_deref(),
		"{:#}",
		anyhow::Error::new(e)
	);
	if let Some(hint) = hint {
		info!("{hint}");
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use clap::Parser;
	use indoc::indoc;
	use tempfile::TempDir;

	use super::*;
	use crate::k8s::{DiffInvocation, ExecutionError};

	#[derive(Parser)]
	struct Cli {
		#[command(flatten)]
		args: DiffArgs,
	}

	/// Reports no differences and counts its runs.
	#[derive(Default)]
	struct NoChanges {
		runs: Arc<AtomicUsize>,
	}

	impl DiffExecutor for NoChanges {
		async fn diff(&self, _invocation: &DiffInvocation) -> Result<String, ExecutionError> {
			self.runs.fetch_add(1, Ordering::SeqCst);
			Ok(String::new())
		}
	}

	/// `dev.yaml` is a working config; `broken.yaml` has no expanded manifests.
	struct Fixture {
		dir: TempDir,
		runs: Arc<AtomicUsize>,
		orchestrator: DiffOrchestrator<KubeUidLookup, NoChanges>,
	}

	impl Fixture {
		fn new() -> Self {
			let dir = TempDir::new().unwrap();
			std::fs::write(dir.path().join("dev.yaml"), "cluster: dev\n").unwrap();
			std::fs::write(dir.path().join("broken.yaml"), "cluster: broken\n").unwrap();
			std::fs::create_dir_all(dir.path().join("expanded/dev")).unwrap();
			std::fs::write(
				dir.path().join("kubeconfig"),
				indoc! {"
					apiVersion: v1
					kind: Config
					clusters:
					- name: dev
					  cluster:
					    server: https://127.0.0.1:6443
					contexts:
					- name: dev
					  context:
					    cluster: dev
					    user: admin
					users:
					- name: admin
					  user: {}
					current-context: dev
				"},
			)
			.unwrap();

			let executor = NoChanges::default();
			let runs = executor.runs.clone();
			let orchestrator =
				DiffOrchestrator::new(KubeUidLookup, executor, ConcurrencyGuard::in_memory());
			Self {
				dir,
				runs,
				orchestrator,
			}
		}

		fn args(&self, extra: &[&str], configs: &[&str]) -> DiffArgs {
			let kubeconfig = self.dir.path().join("kubeconfig");
			let mut argv = vec![
				"diff".to_string(),
				"--color".to_string(),
				"never".to_string(),
				"--kubeconfig".to_string(),
				kubeconfig.display().to_string(),
			];
			argv.extend(extra.iter().map(ToString::to_string));
			argv.extend(
				configs
					.iter()
					.map(|c| self.dir.path().join(c).display().to_string()),
			);
			Cli::parse_from(argv).args
		}

		async fn run(&self, args: &DiffArgs, cancel: &CancellationToken) -> (Result<()>, String) {
			let mut out = Vec::new();
			let result = diff_all(args, &self.orchestrator, cancel, &mut out).await;
			(result, String::from_utf8(out).unwrap())
		}
	}

	#[tokio::test]
	async fn test_globbed_configs_all_succeed() {
		let fixture = Fixture::new();
		let args = fixture.args(&[], &["d*.yaml"]);

		let (result, out) = fixture.run(&args, &CancellationToken::new()).await;
		result.unwrap();
		assert_eq!(out, "No differences.\n");
		assert_eq!(fixture.runs.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_first_failure_stops_the_batch() {
		let fixture = Fixture::new();
		let args = fixture.args(&[], &["broken.yaml", "dev.yaml"]);

		let (result, out) = fixture.run(&args, &CancellationToken::new()).await;
		assert_eq!(result.unwrap_err().to_string(), "1 of 2 cluster diff(s) failed");
		assert_eq!(out, "");
		assert_eq!(fixture.runs.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn test_keep_going_runs_remaining_clusters() {
		let fixture = Fixture::new();
		let args = fixture.args(&["--keep-going"], &["broken.yaml", "dev.yaml"]);

		let (result, out) = fixture.run(&args, &CancellationToken::new()).await;
		assert_eq!(result.unwrap_err().to_string(), "1 of 2 cluster diff(s) failed");
		assert_eq!(out, "No differences.\n");
		assert_eq!(fixture.runs.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_cancel_stops_even_with_keep_going() {
		let fixture = Fixture::new();
		let args = fixture.args(&["--keep-going"], &["dev.yaml", "dev.yaml"]);
		let cancel = CancellationToken::new();
		cancel.cancel();

		let (result, out) = fixture.run(&args, &cancel).await;
		assert_eq!(result.unwrap_err().to_string(), "1 of 2 cluster diff(s) failed");
		assert_eq!(out, "");
		assert_eq!(fixture.runs.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn test_unmatched_config_glob_fails() {
		let fixture = Fixture::new();
		let args = fixture.args(&[], &["staging-*.yaml"]);

		let (result, _) = fixture.run(&args, &CancellationToken::new()).await;
		assert!(result
			.unwrap_err()
			.to_string()
			.starts_with("no cluster configs match"));
		assert_eq!(fixture.runs.load(Ordering::SeqCst), 0);
	}
}
