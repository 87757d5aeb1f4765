//! Checks that a kubeconfig really points at the cluster a config describes.

use std::{future::Future, path::PathBuf, time::Duration};

use k8s_openapi::api::core::v1::Namespace;
use kube::{
	config::{KubeConfigOptions, Kubeconfig, KubeconfigError},
	Api, Client, Config,
};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::{config::ClusterTarget, error::ErrorKind};

/// Default timeout for Kubernetes API requests.
const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

/// Namespace whose UID identifies a cluster.
pub const IDENTITY_NAMESPACE: &str = "kube-system";

#[derive(Debug, Error)]
pub enum IdentityError {
	#[error(
		"kubeconfig in {} does not appear to reference cluster {expected} \
		 (context {context} uses cluster {actual})",
		kubeconfig.display()
	)]
	ContextMismatch {
		kubeconfig: PathBuf,
		expected: String,
		context: String,
		actual: String,
	},

	#[error(
		"kubeapply config does not match this cluster (wrong kube context?): \
		 kube-system uids do not match ({expected}!={actual})"
	)]
	UidMismatch { expected: String, actual: String },

	#[error("reading kubeconfig {}", path.display())]
	Kubeconfig {
		path: PathBuf,
		#[source]
		source: KubeconfigError,
	},

	#[error("kubeconfig {} has no current context", .0.display())]
	NoCurrentContext(PathBuf),

	#[error("kubeconfig {} has no context named {context}", path.display())]
	UnknownContext { path: PathBuf, context: String },

	#[error("building client config for context {context}")]
	ClientConfig {
		context: String,
		#[source]
		source: KubeconfigError,
	},

	#[error("connecting to cluster")]
	Connect(#[source] Box<kube::Error>),

	#[error("fetching namespace {namespace}")]
	Lookup {
		namespace: String,
		#[source]
		source: Box<kube::Error>,
	},

	#[error("namespace {0} has no uid")]
	MissingUid(String),
}

impl IdentityError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::ContextMismatch { .. } | Self::UidMismatch { .. } => ErrorKind::IdentityMismatch,
			Self::Kubeconfig { .. }
			| Self::NoCurrentContext(_)
			| Self::UnknownContext { .. }
			| Self::ClientConfig { .. } => ErrorKind::Configuration,
			Self::Connect(_) | Self::Lookup { .. } | Self::MissingUid(_) => ErrorKind::Execution,
		}
	}
}

/// Fetches namespace UIDs from a live cluster.
pub trait UidLookup: Send + Sync {
	fn namespace_uid(
		&self,
		kubeconfig: &Kubeconfig,
		context: &str,
		namespace: &str,
	) -> impl Future<Output = Result<String, IdentityError>> + Send;
}

/// [`UidLookup`] backed by the Kubernetes API.
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeUidLookup;

impl UidLookup for KubeUidLookup {
	#[instrument(skip(self, kubeconfig))]
	async fn namespace_uid(
		&self,
		kubeconfig: &Kubeconfig,
		context: &str,
		namespace: &str,
	) -> Result<String, IdentityError> {
		let mut config = Config::from_custom_kubeconfig(
			kubeconfig.clone(),
			&KubeConfigOptions {
				context: Some(context.to_string()),
				..Default::default()
			},
		)
		.await
		.map_err(|source| IdentityError::ClientConfig {
			context: context.to_string(),
			source,
		})?;
		config.read_timeout = Some(DEFAULT_API_TIMEOUT);

		let client = Client::try_from(config).map_err(|e| IdentityError::Connect(Box::new(e)))?;
		let ns = Api::<Namespace>::all(client)
			.get(namespace)
			.await
			.map_err(|e| IdentityError::Lookup {
				namespace: namespace.to_string(),
				source: Box::new(e),
			})?;

		ns.metadata
			.uid
			.filter(|uid| !uid.is_empty())
			.ok_or_else(|| IdentityError::MissingUid(namespace.to_string()))
	}
}

/// Outcome of a successful identity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCluster {
	/// Context that will be passed to the diff tool.
	pub context: String,
	/// Whether the live UID was compared.
	pub uid_checked: bool,
}

/// Refuses to let a diff run against the wrong cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterIdentityGuard<L> {
	lookup: L,
}

impl<L: UidLookup> ClusterIdentityGuard<L> {
	pub fn new(lookup: L) -> Self {
		Self { lookup }
	}

	/// Check the target's kubeconfig.
	///
	/// The current context must reference the target cluster. When the target
	/// records a UID, the live `kube-system` UID must equal it byte for byte.
	#[instrument(skip_all, fields(cluster = %target.cluster))]
	pub async fn verify(&self, target: &ClusterTarget) -> Result<VerifiedCluster, IdentityError> {
		let kubeconfig =
			Kubeconfig::read_from(&target.kubeconfig).map_err(|source| IdentityError::Kubeconfig {
				path: target.kubeconfig.clone(),
				source,
			})?;

		let context = check_context(&kubeconfig, target)?;
		debug!(%context, "kubeconfig context references cluster");

		let Some(expected) = target.uid.as_deref() else {
			info!("No uid recorded for cluster, skipping uid check");
			return Ok(VerifiedCluster {
				context,
				uid_checked: false,
			});
		};

		let actual = self
			.lookup
			.namespace_uid(&kubeconfig, &context, IDENTITY_NAMESPACE)
			.await?;
		if actual.as_bytes() != expected.as_bytes() {
			return Err(IdentityError::UidMismatch {
				expected: expected.to_string(),
				actual,
			});
		}

		debug!(uid = %actual, "kube-system uid matches");
		Ok(VerifiedCluster {
			context,
			uid_checked: true,
		})
	}
}

/// Return the current context if it references the target cluster.
///
/// Only the cluster entry the context uses counts, never the context's own
/// name. The entry must be named after the cluster, either exactly or as the
/// last `/` segment (as with EKS ARNs).
fn check_context(kubeconfig: &Kubeconfig, target: &ClusterTarget) -> Result<String, IdentityError> {
	let context_name = kubeconfig
		.current_context
		.clone()
		.filter(|c| !c.is_empty())
		.ok_or_else(|| IdentityError::NoCurrentContext(target.kubeconfig.clone()))?;

	let context = kubeconfig
		.contexts
		.iter()
		.find(|c| c.name == context_name)
		.ok_or_else(|| IdentityError::UnknownContext {
			path: target.kubeconfig.clone(),
			context: context_name.clone(),
		})?;
	let referenced = context
		.context
		.as_ref()
		.map(|c| c.cluster.clone())
		.unwrap_or_default();

	let expected = target.cluster.as_str();
	let names_cluster = referenced == expected
		|| referenced
			.rsplit_once('/')
			.is_some_and(|(_, last)| last == expected);

	if names_cluster {
		Ok(context_name)
	} else {
		Err(IdentityError::ContextMismatch {
			kubeconfig: target.kubeconfig.clone(),
			expected: expected.to_string(),
			context: context_name,
			actual: referenced,
		})
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use kube::config::{Context, NamedContext};
	use rstest::rstest;

	use super::*;

	fn kubeconfig(context: &str, cluster: &str) -> Kubeconfig {
		Kubeconfig {
			contexts: vec![NamedContext {
				name: context.to_string(),
				context: Some(Context {
					cluster: cluster.to_string(),
					..Default::default()
				}),
			}],
			current_context: Some(context.to_string()),
			..Default::default()
		}
	}

	fn target(cluster: &str) -> ClusterTarget {
		ClusterTarget::builder()
			.name(cluster)
			.cluster(cluster)
			.expanded_path("expanded")
			.kubeconfig("/kube/config")
			.build()
	}

	#[rstest]
	#[case::cluster_entry("admin", "prod-east")]
	#[case::eks_arn("admin", "arn:aws:eks:us-east-1:123456789012:cluster/prod-east")]
	fn test_context_matches(#[case] context: &str, #[case] cluster: &str) {
		let kubeconfig = kubeconfig(context, cluster);
		assert_eq!(check_context(&kubeconfig, &target("prod-east")).unwrap(), context);
	}

	#[rstest]
	#[case::other_cluster("prod-west", "prod-west")]
	#[case::context_named_after_cluster("prod-east", "prod-west")]
	#[case::prefix_only("admin", "prod-east-2")]
	#[case::suffix_without_separator("admin", "staging-prod-east")]
	fn test_context_mismatch(#[case] context: &str, #[case] cluster: &str) {
		let kubeconfig = kubeconfig(context, cluster);
		let err = check_context(&kubeconfig, &target("prod-east")).unwrap_err();
		assert_eq!(err.kind(), ErrorKind::IdentityMismatch);
		assert_matches!(err, IdentityError::ContextMismatch { actual, .. } if actual == cluster);
	}

	#[test]
	fn test_missing_current_context() {
		let mut kubeconfig = kubeconfig("prod-east", "prod-east");
		kubeconfig.current_context = None;
		assert_matches!(
			check_context(&kubeconfig, &target("prod-east")),
			Err(IdentityError::NoCurrentContext(_))
		);

		kubeconfig.current_context = Some("gone".to_string());
		assert_matches!(
			check_context(&kubeconfig, &target("prod-east")),
			Err(IdentityError::UnknownContext { context, .. }) if context == "gone"
		);
	}

	#[test]
	fn test_uid_mismatch_message() {
		let err = IdentityError::UidMismatch {
			expected: "abc-123".to_string(),
			actual: "xyz-789".to_string(),
		};
		assert_eq!(
			err.to_string(),
			"kubeapply config does not match this cluster (wrong kube context?): \
			 kube-system uids do not match (abc-123!=xyz-789)"
		);
	}
}
