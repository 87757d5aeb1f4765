//! Cluster diffing for kubeapply.
//!
//! Compares the rendered manifests of a cluster with what is live, after
//! making sure the kubeconfig in use really points at that cluster.

pub mod commands;
pub mod config;
pub mod error;
pub mod glob;
pub mod k8s;
pub mod lock;
pub mod orchestrator;
pub mod output;
pub mod telemetry;

pub use config::{ClusterConfig, ClusterTarget};
pub use error::{DiffError, ErrorKind};
pub use lock::ConcurrencyGuard;
pub use orchestrator::{
	DiffOrchestrator, DiffOutcome, DiffOutput, DiffPhase, DiffRequest, OutputMode,
};
pub use output::{ColorMode, ResultPresenter};
