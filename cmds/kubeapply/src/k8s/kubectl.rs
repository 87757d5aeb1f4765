//! Running `kubectl diff`.

use std::{future::Future, path::PathBuf, process::Stdio};

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::orchestrator::OutputMode;

/// External diff program forced in structured mode so the output is plain
/// unified diff with absent files rendered as empty.
pub const STRUCTURED_EXTERNAL_DIFF: &str = "diff -u -N";

#[derive(Debug, Error)]
pub enum ExecutionError {
	#[error("starting {program}")]
	Spawn {
		program: String,
		#[source]
		source: std::io::Error,
	},

	#[error("kubectl diff exited with {}: {stderr}", describe_status(*status))]
	Failed { status: Option<i32>, stderr: String },

	#[error("kubectl diff output is not valid UTF-8")]
	Utf8(#[from] std::string::FromUtf8Error),
}

fn describe_status(status: Option<i32>) -> String {
	match status {
		Some(code) => format!("status {code}"),
		None => "a signal".to_string(),
	}
}

/// One `kubectl diff` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffInvocation {
	pub kubeconfig: PathBuf,
	pub context: String,
	pub paths: Vec<PathBuf>,
	pub server_side: bool,
	pub mode: OutputMode,
}

impl DiffInvocation {
	/// Arguments after the program name.
	pub fn args(&self) -> Vec<String> {
		let mut args = vec![
			"--kubeconfig".to_string(),
			self.kubeconfig.display().to_string(),
			"--context".to_string(),
			self.context.clone(),
			"diff".to_string(),
		];
		for path in &self.paths {
			args.push("-R".to_string());
			args.push("-f".to_string());
			args.push(path.display().to_string());
		}
		if self.server_side {
			args.push("--server-side".to_string());
			args.push("--force-conflicts".to_string());
		}
		args
	}
}

/// Produces raw diff text for a cluster.
pub trait DiffExecutor: Send + Sync {
	fn diff(
		&self,
		invocation: &DiffInvocation,
	) -> impl Future<Output = Result<String, ExecutionError>> + Send;
}

/// [`DiffExecutor`] that shells out to kubectl.
#[derive(Debug, Clone)]
pub struct Kubectl {
	program: String,
	base_args: Vec<String>,
}

impl Default for Kubectl {
	fn default() -> Self {
		Self::new("kubectl")
	}
}

impl Kubectl {
	pub fn new(program: impl Into<String>) -> Self {
		Self {
			program: program.into(),
			base_args: Vec::new(),
		}
	}

	/// Arguments placed before the generated ones.
	pub fn with_base_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
		self.base_args = args.into_iter().map(Into::into).collect();
		self
	}

	fn command(&self, invocation: &DiffInvocation) -> Command {
		let mut command = Command::new(&self.program);
		command
			.args(&self.base_args)
			.args(invocation.args())
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);
		if invocation.mode == OutputMode::Structured {
			command.env("KUBECTL_EXTERNAL_DIFF", STRUCTURED_EXTERNAL_DIFF);
		}
		command
	}
}

impl DiffExecutor for Kubectl {
	#[instrument(skip_all, fields(program = %self.program, context = %invocation.context))]
	async fn diff(&self, invocation: &DiffInvocation) -> Result<String, ExecutionError> {
		let output = self
			.command(invocation)
			.output()
			.await
			.map_err(|source| ExecutionError::Spawn {
				program: self.program.clone(),
				source,
			})?;

		// kubectl diff exits 1 when differences were found
		match output.status.code() {
			Some(0 | 1) => {}
			status => {
				return Err(ExecutionError::Failed {
					status,
					stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
				})
			}
		}

		debug!(
			bytes = output.stdout.len(),
			stderr = %String::from_utf8_lossy(&output.stderr).trim(),
			"kubectl diff finished"
		);
		Ok(String::from_utf8(output.stdout)?)
	}
}
