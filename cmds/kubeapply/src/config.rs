//! Cluster configuration and kubeconfig resolution.

use std::{
	ffi::OsStr,
	path::{Path, PathBuf},
};

use bon::Builder;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::glob;

/// Environment variable consulted when no kubeconfig is passed explicitly.
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("reading cluster config {path}")]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("parsing cluster config {path}")]
	Parse {
		path: PathBuf,
		#[source]
		source: serde_yaml::Error,
	},

	#[error("cluster config {0} does not set a cluster name")]
	MissingCluster(PathBuf),

	#[error("must either set --kubeconfig flag or KUBECONFIG env variable")]
	NoKubeconfig,

	#[error("expanded path {0} does not exist")]
	MissingExpandedPath(PathBuf),

	#[error("subpath {subpath} does not exist under {root}")]
	MissingSubpath { root: PathBuf, subpath: PathBuf },

	#[error("invalid glob {pattern}")]
	Glob {
		pattern: PathBuf,
		#[source]
		source: globset::Error,
	},

	#[error("no cluster configs match {0}")]
	NoConfigs(PathBuf),
}

/// On-disk cluster configuration.
///
/// Only the fields the diff needs are read; anything else in the file is
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
	pub cluster: String,
	#[serde(default)]
	pub region: Option<String>,
	#[serde(default)]
	pub env: Option<String>,
	/// UID of the cluster's `kube-system` namespace.
	#[serde(default)]
	pub uid: Option<String>,
	#[serde(default)]
	pub expanded_path: Option<PathBuf>,
	#[serde(default)]
	pub server_side_apply: bool,
	#[serde(default)]
	pub use_locks: bool,

	/// Directory of the config file; relative paths resolve against it.
	#[serde(skip)]
	pub root: PathBuf,
}

impl ClusterConfig {
	#[instrument(skip_all, fields(path = %path.display()))]
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.to_path_buf(),
			source,
		})?;
		let mut config: Self =
			serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
				path: path.to_path_buf(),
				source,
			})?;

		if config.cluster.trim().is_empty() {
			return Err(ConfigError::MissingCluster(path.to_path_buf()));
		}

		config.root = path.parent().map(Path::to_path_buf).unwrap_or_default();
		debug!(cluster = %config.cluster, "loaded cluster config");
		Ok(config)
	}

	/// `env:region:cluster`, skipping whatever is not set.
	pub fn descriptive_name(&self) -> String {
		[self.env.as_deref(), self.region.as_deref(), Some(self.cluster.as_str())]
			.into_iter()
			.flatten()
			.filter(|s| !s.is_empty())
			.collect::<Vec<_>>()
			.join(":")
	}

	/// Where the rendered manifests live, `expanded/<env>/<region>/<cluster>`
	/// next to the config file unless configured otherwise.
	pub fn expanded_path(&self) -> PathBuf {
		match &self.expanded_path {
			Some(path) => self.root.join(path),
			None => {
				let mut path = self.root.join("expanded");
				for segment in [self.env.as_deref(), self.region.as_deref()]
					.into_iter()
					.flatten()
					.filter(|s| !s.is_empty())
				{
					path.push(segment);
				}
				path.push(&self.cluster);
				path
			}
		}
	}

	/// Combine the config with invocation settings into a diff target.
	pub fn into_target(self, kubeconfig: PathBuf, subpaths: Vec<PathBuf>) -> ClusterTarget {
		ClusterTarget {
			name: self.descriptive_name(),
			expanded_path: self.expanded_path(),
			cluster: self.cluster,
			uid: self.uid.filter(|uid| !uid.is_empty()),
			kubeconfig,
			subpaths,
			server_side_apply: self.server_side_apply,
			use_locks: self.use_locks,
		}
	}
}

/// One cluster to diff. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct ClusterTarget {
	/// Human-readable name used in logs.
	#[builder(into)]
	pub name: String,
	/// Cluster name the kubeconfig context must reference.
	#[builder(into)]
	pub cluster: String,
	#[builder(into)]
	pub expanded_path: PathBuf,
	#[builder(into)]
	pub uid: Option<String>,
	#[builder(into)]
	pub kubeconfig: PathBuf,
	#[builder(default)]
	pub subpaths: Vec<PathBuf>,
	#[builder(default)]
	pub server_side_apply: bool,
	#[builder(default)]
	pub use_locks: bool,
}

impl ClusterTarget {
	/// Key of the per-cluster lock.
	pub fn lock_key(&self) -> &str {
		&self.cluster
	}

	/// Directories handed to the diff tool.
	///
	/// `scope` narrows the run further than the target's own subpaths; with
	/// neither set the whole expanded tree is diffed. Subpaths may be globs;
	/// each must match at least one directory.
	pub fn diff_paths(&self, scope: &[PathBuf]) -> Result<Vec<PathBuf>, ConfigError> {
		if !self.expanded_path.is_dir() {
			return Err(ConfigError::MissingExpandedPath(self.expanded_path.clone()));
		}

		let subpaths = if scope.is_empty() { &self.subpaths } else { scope };
		if subpaths.is_empty() {
			return Ok(vec![self.expanded_path.clone()]);
		}

		let mut paths = Vec::new();
		for subpath in subpaths {
			let pattern = self.expanded_path.join(subpath);
			let matched: Vec<PathBuf> = glob::expand(&pattern)
				.map_err(|source| ConfigError::Glob { pattern, source })?
				.into_iter()
				.filter(|path| path.is_dir())
				.collect();
			if matched.is_empty() {
				return Err(ConfigError::MissingSubpath {
					root: self.expanded_path.clone(),
					subpath: subpath.clone(),
				});
			}
			for path in matched {
				if !paths.contains(&path) {
					paths.push(path);
				}
			}
		}
		Ok(paths)
	}
}

/// Expand config file arguments, which may be globs, in argument order.
///
/// A pattern that matches nothing is an error, so a typo does not pass as a
/// run with nothing to diff.
pub fn expand_config_paths(patterns: &[PathBuf]) -> Result<Vec<PathBuf>, ConfigError> {
	let mut paths = Vec::new();
	for pattern in patterns {
		let matched = glob::expand(pattern).map_err(|source| ConfigError::Glob {
			pattern: pattern.clone(),
			source,
		})?;
		if matched.is_empty() {
			return Err(ConfigError::NoConfigs(pattern.clone()));
		}
		paths.extend(matched);
	}
	Ok(paths)
}

/// Resolve the kubeconfig path: the explicit flag first, then the value of
/// `KUBECONFIG`, otherwise an error.
///
/// When `KUBECONFIG` lists several files only the first is used, since
/// `kubectl --kubeconfig` accepts a single path.
pub fn resolve_kubeconfig(
	explicit: Option<&Path>,
	env_value: Option<&OsStr>,
) -> Result<PathBuf, ConfigError> {
	if let Some(path) = explicit.filter(|p| !p.as_os_str().is_empty()) {
		return Ok(path.to_path_buf());
	}

	let env_value = env_value
		.filter(|v| !v.is_empty())
		.ok_or(ConfigError::NoKubeconfig)?;

	let mut paths = std::env::split_paths(env_value).filter(|p| !p.as_os_str().is_empty());
	let first = paths.next().ok_or(ConfigError::NoKubeconfig)?;
	if paths.next().is_some() {
		warn!(
			kubeconfig = %first.display(),
			"{KUBECONFIG_ENV} lists several files, using the first one"
		);
	}
	Ok(first)
}
