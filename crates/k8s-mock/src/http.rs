//! HTTP-based mock Kubernetes server using wiremock.
//!
//! This provides a real HTTP server that can be used with actual kubeconfig-based
//! connections. It serves namespaces, which is all the cluster identity check
//! talks to.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use bon::Builder;
use kube::config::{
	AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use tracing::debug;
use wiremock::{
	matchers::{method, path_regex},
	Mock, MockServer, Request, ResponseTemplate,
};

/// UID reported for `kube-system` when none is configured.
pub const DEFAULT_KUBE_SYSTEM_UID: &str = "5c3e0a4b-9f61-4d8e-a2b7-000000000001";

/// A mock Kubernetes server exposed over HTTP.
#[derive(Builder)]
pub struct HttpMockK8sServer {
	/// Name of the cluster entry written into generated kubeconfigs.
	#[builder(default = "mock-cluster".to_string(), into)]
	cluster_name: String,
	/// UID of the `kube-system` namespace.
	#[builder(into)]
	kube_system_uid: Option<String>,
}

/// A running HTTP mock server instance.
pub struct RunningHttpMockK8sServer {
	server: MockServer,
	cluster_name: String,
}

impl HttpMockK8sServer {
	/// Start the mock server.
	pub async fn start(self) -> RunningHttpMockK8sServer {
		let server = MockServer::start().await;
		debug!(uri = %server.uri(), cluster = %self.cluster_name, "Started mock K8s server");

		let kube_system_uid = self
			.kube_system_uid
			.unwrap_or_else(|| DEFAULT_KUBE_SYSTEM_UID.to_string());

		let mut namespaces = BTreeMap::new();
		namespaces.insert("default".to_string(), namespace("default", "uid-default"));
		namespaces.insert(
			"kube-system".to_string(),
			namespace("kube-system", &kube_system_uid),
		);

		mount_namespaces(&server, Arc::new(namespaces)).await;

		RunningHttpMockK8sServer {
			server,
			cluster_name: self.cluster_name,
		}
	}
}

fn namespace(name: &str, uid: &str) -> serde_json::Value {
	serde_json::json!({
		"apiVersion": "v1",
		"kind": "Namespace",
		"metadata": {
			"name": name,
			"uid": uid,
			"resourceVersion": "1"
		},
		"status": {
			"phase": "Active"
		}
	})
}

impl RunningHttpMockK8sServer {
	/// Get the server's URI (e.g., "http://127.0.0.1:12345").
	pub fn uri(&self) -> String {
		self.server.uri()
	}

	/// Create a Kubeconfig pointing to this mock server.
	pub fn kubeconfig(&self) -> Kubeconfig {
		self.kubeconfig_with_context("mock-context")
	}

	/// Create a Kubeconfig pointing to this mock server with a custom context name.
	pub fn kubeconfig_with_context(&self, context_name: &str) -> Kubeconfig {
		let user_name = "mock-user";

		Kubeconfig {
			clusters: vec![NamedCluster {
				name: self.cluster_name.clone(),
				cluster: Some(Cluster {
					server: Some(self.uri()),
					insecure_skip_tls_verify: Some(true),
					..Default::default()
				}),
			}],
			contexts: vec![NamedContext {
				name: context_name.to_string(),
				context: Some(Context {
					cluster: self.cluster_name.clone(),
					user: Some(user_name.to_string()),
					namespace: Some("default".to_string()),
					..Default::default()
				}),
			}],
			auth_infos: vec![NamedAuthInfo {
				name: user_name.to_string(),
				auth_info: Some(AuthInfo::default()),
			}],
			current_context: Some(context_name.to_string()),
			..Default::default()
		}
	}

	/// Write [`Self::kubeconfig`] as YAML to `path`.
	pub fn write_kubeconfig(&self, path: &Path) -> std::io::Result<()> {
		let yaml = serde_yaml::to_string(&self.kubeconfig()).map_err(std::io::Error::other)?;
		std::fs::write(path, yaml)
	}
}

async fn mount_namespaces(
	server: &MockServer,
	namespaces: Arc<BTreeMap<String, serde_json::Value>>,
) {
	Mock::given(method("GET"))
		.and(path_regex(r"^/api/v1/namespaces/[^/]+$"))
		.respond_with(move |req: &Request| {
			let name = req.url.path().rsplit('/').next().unwrap_or_default();

			match namespaces.get(name) {
				Some(ns) => ResponseTemplate::new(200).set_body_json(ns.clone()),
				None => ResponseTemplate::new(404).set_body_json(serde_json::json!({
					"kind": "Status",
					"apiVersion": "v1",
					"metadata": {},
					"status": "Failure",
					"message": format!("namespaces \"{name}\" not found"),
					"reason": "NotFound",
					"code": 404
				})),
			}
		})
		.mount(server)
		.await;
}
