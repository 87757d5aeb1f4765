//! Identity of a single Kubernetes object within a diff.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Uniquely identifies one object in a diff.
///
/// Ordering is lexicographic by namespace, then kind, then name; field
/// order below is load-bearing for the derived `Ord`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
	/// Empty for cluster-scoped objects.
	pub namespace: String,
	pub kind: String,
	pub name: String,
}

impl ResourceKey {
	pub fn new(
		namespace: impl Into<String>,
		kind: impl Into<String>,
		name: impl Into<String>,
	) -> Self {
		Self {
			namespace: namespace.into(),
			kind: kind.into(),
			name: name.into(),
		}
	}

	/// Parse the file name kubectl gives an object when it writes the live and
	/// merged trees for `kubectl diff`.
	///
	/// The format is `[group.]version.Kind.namespace.name`, for example
	/// `apps.v1.Deployment.kube-system.coredns` or `v1.Namespace..production`.
	/// Groups and names may contain dots, so the version/kind pair is located
	/// first and everything after the namespace is treated as the name.
	pub fn from_object_file_name(file_name: &str) -> Option<Self> {
		let parts: Vec<&str> = file_name.split('.').collect();
		if parts.len() < 4 {
			return None;
		}

		for i in 0..parts.len() - 3 {
			if !is_version(parts[i]) || !is_kind(parts[i + 1]) {
				continue;
			}
			if parts[..i].iter().any(|p| p.is_empty()) {
				return None;
			}
			let name = parts[i + 3..].join(".");
			if name.is_empty() {
				return None;
			}
			return Some(Self::new(parts[i + 2], parts[i + 1], name));
		}

		None
	}

	/// Build a key from a parsed manifest using `kind`, `metadata.namespace`
	/// and `metadata.name`.
	pub fn from_manifest(manifest: &serde_yaml::Value) -> Option<Self> {
		let kind = manifest.get("kind")?.as_str()?;
		let metadata = manifest.get("metadata")?;
		let name = metadata.get("name")?.as_str()?;
		let namespace = metadata
			.get("namespace")
			.and_then(serde_yaml::Value::as_str)
			.unwrap_or_default();

		if kind.is_empty() || name.is_empty() {
			return None;
		}

		Some(Self::new(namespace, kind, name))
	}

	pub fn is_cluster_scoped(&self) -> bool {
		self.namespace.is_empty()
	}
}

impl fmt::Display for ResourceKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_cluster_scoped() {
			write!(f, "{}/{}", self.kind, self.name)
		} else {
			write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
		}
	}
}

/// `v1`, `v2`, `v1beta1`, `v2alpha3`...
fn is_version(s: &str) -> bool {
	let Some(rest) = s.strip_prefix('v') else {
		return false;
	};
	let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
	if digits == 0 {
		return false;
	}
	let rest = &rest[digits..];
	if rest.is_empty() {
		return true;
	}
	let Some(level) = rest
		.strip_prefix("alpha")
		.or_else(|| rest.strip_prefix("beta"))
	else {
		return false;
	};
	!level.is_empty() && level.bytes().all(|b| b.is_ascii_digit())
}

fn is_kind(s: &str) -> bool {
	s.starts_with(|c: char| c.is_ascii_uppercase()) && s.chars().all(|c| c.is_ascii_alphanumeric())
}
