//! Errors surfaced by a diff run.

use std::fmt;

use kubeapply_diff::{ParseError, ResourceKey};
use thiserror::Error;

use crate::{
	config::ConfigError,
	k8s::{ExecutionError, IdentityError},
	lock::LockError,
	orchestrator::DiffPhase,
};

/// Advice printed after execution and parse failures.
pub const DIFF_HINT: &str = "Try re-running with --simple-output, then with --log-level=debug to \
	see verbose output. Note that diffs will not work if target namespace(s) don't exist yet.";

/// Coarse classification of a [`DiffError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	Configuration,
	IdentityMismatch,
	LockTimeout,
	Execution,
	Parse,
	Cancelled,
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Configuration => "configuration error",
			Self::IdentityMismatch => "identity mismatch",
			Self::LockTimeout => "lock timeout",
			Self::Execution => "execution error",
			Self::Parse => "parse error",
			Self::Cancelled => "cancelled",
		})
	}
}

/// Failure of one cluster's diff. Every variant names the cluster; the cause
/// is kept as the error source.
#[derive(Debug, Error)]
pub enum DiffError {
	#[error("invalid configuration for cluster {cluster}")]
	Configuration {
		cluster: String,
		#[source]
		source: ConfigError,
	},

	#[error("verifying identity of cluster {cluster}")]
	Identity {
		cluster: String,
		#[source]
		source: IdentityError,
	},

	#[error("locking cluster {cluster}")]
	Lock {
		cluster: String,
		#[source]
		source: LockError,
	},

	#[error("running diff for cluster {cluster}")]
	Execution {
		cluster: String,
		#[source]
		source: ExecutionError,
	},

	#[error("parsing diff for cluster {cluster}")]
	Parse {
		cluster: String,
		#[source]
		source: ParseError,
	},

	#[error("diff for cluster {cluster} cancelled while {phase}")]
	Cancelled { cluster: String, phase: DiffPhase },
}

impl DiffError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::Configuration { .. } => ErrorKind::Configuration,
			Self::Identity { source, .. } => source.kind(),
			Self::Lock { source, .. } => match source {
				LockError::Timeout { .. } => ErrorKind::LockTimeout,
				LockError::Io { .. } | LockError::Metadata(_) => ErrorKind::Configuration,
			},
			Self::Execution { .. } => ErrorKind::Execution,
			Self::Parse { .. } => ErrorKind::Parse,
			Self::Cancelled { .. } => ErrorKind::Cancelled,
		}
	}

	pub fn cluster(&self) -> &str {
		match self {
			Self::Configuration { cluster, .. }
			| Self::Identity { cluster, .. }
			| Self::Lock { cluster, .. }
			| Self::Execution { cluster, .. }
			| Self::Parse { cluster, .. }
			| Self::Cancelled { cluster, .. } => cluster,
		}
	}

	/// Resource the failure is attributed to, for parse errors that have one.
	pub fn resource_key(&self) -> Option<&ResourceKey> {
		match self {
			Self::Parse { source, .. } => source.resource_key(),
			_ => None,
		}
	}

	pub fn hint(&self) -> Option<&'static str> {
		matches!(self.kind(), ErrorKind::Execution | ErrorKind::Parse).then_some(DIFF_HINT)
	}
}
