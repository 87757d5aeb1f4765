//! Drives one diff for one cluster.
//!
//! A run moves through `Idle → Verifying → (Locking) → Running → Parsing →
//! Done`, ending in `Failed` from any earlier phase. The identity check always
//! comes first; nothing touches the cluster through kubectl until it passes.

use std::{fmt, future::Future, path::PathBuf, time::Duration};

use bon::Builder;
use kubeapply_diff::{parse_diff, shorten_unified, DiffResultSet, ParseOptions};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::{
	config::ClusterTarget,
	error::DiffError,
	k8s::{ClusterIdentityGuard, DiffExecutor, DiffInvocation, UidLookup},
	lock::ConcurrencyGuard,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffPhase {
	Idle,
	Verifying,
	Locking,
	Running,
	Parsing,
	Done,
	Failed,
}

impl fmt::Display for DiffPhase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Idle => "idle",
			Self::Verifying => "verifying",
			Self::Locking => "locking",
			Self::Running => "running",
			Self::Parsing => "parsing",
			Self::Done => "done",
			Self::Failed => "failed",
		})
	}
}

/// What the caller wants back from a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
	/// kubectl's own output, only trimmed when short diff is requested.
	Raw,
	/// Parsed change records.
	#[default]
	Structured,
}

/// A single diff to perform.
#[derive(Debug, Clone, Builder)]
pub struct DiffRequest {
	pub target: ClusterTarget,
	#[builder(default)]
	pub mode: OutputMode,
	/// Subpaths to restrict the run to; empty means the target's own scope.
	#[builder(default)]
	pub scope: Vec<PathBuf>,
	#[builder(default)]
	pub short_diff: bool,
	#[builder(default)]
	pub include_unchanged: bool,
	/// How long to wait for the cluster lock; `None` waits indefinitely.
	pub lock_timeout: Option<Duration>,
}

impl DiffRequest {
	fn parse_options(&self) -> ParseOptions {
		ParseOptions {
			short_diff: self.short_diff,
			include_unchanged: self.include_unchanged,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutput {
	Raw(String),
	Structured(DiffResultSet),
}

/// Successful result of [`DiffOrchestrator::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffOutcome {
	pub output: DiffOutput,
	/// Phases visited, in order, ending with [`DiffPhase::Done`].
	pub phases: Vec<DiffPhase>,
}

/// Records phase transitions and logs each one.
struct PhaseLog<'a> {
	cluster: &'a str,
	phases: Vec<DiffPhase>,
}

impl<'a> PhaseLog<'a> {
	fn new(cluster: &'a str) -> Self {
		Self {
			cluster,
			phases: vec![DiffPhase::Idle],
		}
	}

	fn current(&self) -> DiffPhase {
		self.phases.last().copied().unwrap_or(DiffPhase::Idle)
	}

	fn enter(&mut self, phase: DiffPhase) {
		debug!(cluster = %self.cluster, from = %self.current(), to = %phase, "diff phase");
		self.phases.push(phase);
	}
}

pub struct DiffOrchestrator<L, X> {
	identity: ClusterIdentityGuard<L>,
	executor: X,
	locks: ConcurrencyGuard,
}

impl<L: UidLookup, X: DiffExecutor> DiffOrchestrator<L, X> {
	pub fn new(lookup: L, executor: X, locks: ConcurrencyGuard) -> Self {
		Self {
			identity: ClusterIdentityGuard::new(lookup),
			executor,
			locks,
		}
	}

	/// Run the diff described by `request`.
	///
	/// The cluster lock, when taken, is released before this returns, whatever
	/// the outcome. Cancelling `cancel` aborts the current phase.
	#[instrument(skip_all, fields(cluster = %request.target.name))]
	pub async fn run(
		&self,
		request: &DiffRequest,
		cancel: &CancellationToken,
	) -> Result<DiffOutcome, DiffError> {
		info!("Diffing cluster {}", request.target.name);

		let mut phases = PhaseLog::new(&request.target.name);
		match self.drive(request, cancel, &mut phases).await {
			Ok(output) => {
				phases.enter(DiffPhase::Done);
				Ok(DiffOutcome {
					output,
					phases: phases.phases,
				})
			}
			Err(e) => {
				let failed_in = phases.current();
				phases.enter(DiffPhase::Failed);
				debug!(
					phase = %failed_in,
					phases = ?phases.phases,
					kind = %e.kind(),
					"diff failed"
				);
				Err(e)
			}
		}
	}

	async fn drive(
		&self,
		request: &DiffRequest,
		cancel: &CancellationToken,
		phases: &mut PhaseLog<'_>,
	) -> Result<DiffOutput, DiffError> {
		let target = &request.target;
		let cluster = || target.name.clone();

		let paths = target
			.diff_paths(&request.scope)
			.map_err(|source| DiffError::Configuration {
				cluster: cluster(),
				source,
			})?;

		phases.enter(DiffPhase::Verifying);
		let verified = cancellable(
			cancel,
			target,
			DiffPhase::Verifying,
			self.identity.verify(target),
		)
		.await?
			.map_err(|source| DiffError::Identity {
				cluster: cluster(),
				source,
			})?;

		let _lock = if target.use_locks {
			phases.enter(DiffPhase::Locking);
			let lock = cancellable(
				cancel,
				target,
				DiffPhase::Locking,
				self.locks.acquire(target.lock_key(), request.lock_timeout),
			)
			.await?
			.map_err(|source| DiffError::Lock {
				cluster: cluster(),
				source,
			})?;
			Some(lock)
		} else {
			None
		};

		phases.enter(DiffPhase::Running);
		let invocation = DiffInvocation {
			kubeconfig: target.kubeconfig.clone(),
			context: verified.context,
			paths,
			server_side: target.server_side_apply,
			mode: request.mode,
		};
		let raw = cancellable(
			cancel,
			target,
			DiffPhase::Running,
			self.executor.diff(&invocation),
		)
		.await?
			.map_err(|source| DiffError::Execution {
				cluster: cluster(),
				source,
			})?;

		match request.mode {
			OutputMode::Raw if request.short_diff => Ok(DiffOutput::Raw(shorten_unified(&raw))),
			OutputMode::Raw => Ok(DiffOutput::Raw(raw)),
			OutputMode::Structured => {
				phases.enter(DiffPhase::Parsing);
				let results =
					parse_diff(&raw, request.parse_options()).map_err(|source| DiffError::Parse {
						cluster: cluster(),
						source,
					})?;
				debug!(records = results.results.len(), "parsed diff");
				Ok(DiffOutput::Structured(results))
			}
		}
	}
}

/// Await `fut` unless `cancel` fires first.
async fn cancellable<T>(
	cancel: &CancellationToken,
	target: &ClusterTarget,
	phase: DiffPhase,
	fut: impl Future<Output = T>,
) -> Result<T, DiffError> {
	tokio::select! {
		biased;
		() = cancel.cancelled() => Err(DiffError::Cancelled {
			cluster: target.name.clone(),
			phase,
		}),
		value = fut => Ok(value),
	}
}
