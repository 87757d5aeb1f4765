//! Kubernetes-facing pieces: the identity check and the diff tool.

pub mod identity;
pub mod kubectl;

pub use identity::{ClusterIdentityGuard, IdentityError, KubeUidLookup, UidLookup, VerifiedCluster};
pub use kubectl::{DiffExecutor, DiffInvocation, ExecutionError, Kubectl};
