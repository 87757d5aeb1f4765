//! Cluster identity checks against a mock API server.

use std::path::Path;

use assert_matches::assert_matches;
use k8s_mock::HttpMockK8sServer;
use kubeapply::{
	k8s::{ClusterIdentityGuard, IdentityError, KubeUidLookup},
	ClusterTarget, ErrorKind,
};
use tempfile::TempDir;

fn target(cluster: &str, uid: Option<&str>, kubeconfig: &Path) -> ClusterTarget {
	ClusterTarget::builder()
		.name(cluster)
		.cluster(cluster)
		.expanded_path("expanded")
		.maybe_uid(uid.map(str::to_string))
		.kubeconfig(kubeconfig)
		.build()
}

#[tokio::test]
async fn test_context_for_other_cluster_is_rejected() {
	let server = HttpMockK8sServer::builder()
		.cluster_name("prod-west")
		.build()
		.start()
		.await;
	let dir = TempDir::new().unwrap();
	let kubeconfig = dir.path().join("kubeconfig");
	server.write_kubeconfig(&kubeconfig).unwrap();

	let guard = ClusterIdentityGuard::new(KubeUidLookup);
	let err = guard
		.verify(&target("prod-east", None, &kubeconfig))
		.await
		.unwrap_err();

	assert_eq!(err.kind(), ErrorKind::IdentityMismatch);
	assert_matches!(&err, IdentityError::ContextMismatch { expected, actual, .. }
		if expected == "prod-east" && actual == "prod-west");
	let expected_prefix = format!(
		"kubeconfig in {} does not appear to reference cluster prod-east",
		kubeconfig.display()
	);
	assert!(err.to_string().starts_with(&expected_prefix), "{err}");
}

#[tokio::test]
async fn test_uid_mismatch_is_rejected() {
	let server = HttpMockK8sServer::builder()
		.cluster_name("prod-east")
		.kube_system_uid("xyz-789")
		.build()
		.start()
		.await;
	let dir = TempDir::new().unwrap();
	let kubeconfig = dir.path().join("kubeconfig");
	server.write_kubeconfig(&kubeconfig).unwrap();

	let guard = ClusterIdentityGuard::new(KubeUidLookup);
	let err = guard
		.verify(&target("prod-east", Some("abc-123"), &kubeconfig))
		.await
		.unwrap_err();

	assert_eq!(err.kind(), ErrorKind::IdentityMismatch);
	assert_matches!(err, IdentityError::UidMismatch { expected, actual }
		if expected == "abc-123" && actual == "xyz-789");
}

#[tokio::test]
async fn test_matching_uid_passes() {
	let server = HttpMockK8sServer::builder()
		.cluster_name("prod-east")
		.kube_system_uid("abc-123")
		.build()
		.start()
		.await;
	let dir = TempDir::new().unwrap();
	let kubeconfig = dir.path().join("kubeconfig");
	server.write_kubeconfig(&kubeconfig).unwrap();

	let guard = ClusterIdentityGuard::new(KubeUidLookup);
	let verified = guard
		.verify(&target("prod-east", Some("abc-123"), &kubeconfig))
		.await
		.unwrap();

	assert_eq!(verified.context, "mock-context");
	assert!(verified.uid_checked);
}

#[tokio::test]
async fn test_name_only_check_skips_api() {
	// No server behind this kubeconfig; the check must not need one
	let server = HttpMockK8sServer::builder()
		.cluster_name("dev")
		.build()
		.start()
		.await;
	let dir = TempDir::new().unwrap();
	let kubeconfig = dir.path().join("kubeconfig");
	server.write_kubeconfig(&kubeconfig).unwrap();
	drop(server);

	let guard = ClusterIdentityGuard::new(KubeUidLookup);
	let verified = guard.verify(&target("dev", None, &kubeconfig)).await.unwrap();
	assert!(!verified.uid_checked);
}

#[tokio::test]
async fn test_missing_kubeconfig_is_configuration_error() {
	let dir = TempDir::new().unwrap();

	let guard = ClusterIdentityGuard::new(KubeUidLookup);
	let err = guard
		.verify(&target("prod-east", None, &dir.path().join("missing")))
		.await
		.unwrap_err();

	assert_eq!(err.kind(), ErrorKind::Configuration);
	assert_matches!(err, IdentityError::Kubeconfig { .. });
}
