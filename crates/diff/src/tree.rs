//! Comparison of two rendered manifest trees.
//!
//! This is the path `kubeapply kdiff` uses when kubectl hands it the live and
//! merged directories directly: instead of parsing `diff` output, each object
//! is diffed with `similar` and the resulting hunks go through the same reader
//! as [`parse_diff`](crate::parse_diff).

use std::{
	collections::{BTreeMap, BTreeSet},
	path::{Path, PathBuf},
};

use similar::TextDiff;
use thiserror::Error;
use tracing::{debug, instrument, trace};
use walkdir::WalkDir;

use crate::{
	error::ParseError,
	key::ResourceKey,
	model::{ChangeKind, ChangeRecord, DiffResultSet, ParseOptions, RecordCollector},
	parser::{read_hunks, DEV_NULL},
};

/// Context lines around each change, matching `diff -u`.
const CONTEXT_RADIUS: usize = 3;

#[derive(Debug, Error)]
pub enum TreeError {
	#[error("walking {path}")]
	Walk {
		path: PathBuf,
		#[source]
		source: walkdir::Error,
	},

	#[error("reading {path}")]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("parsing document {index} of {path}")]
	Yaml {
		path: PathBuf,
		index: usize,
		#[source]
		source: serde_yaml::Error,
	},

	#[error("document {index} of {path} has no kind or metadata.name")]
	UnidentifiedObject { path: PathBuf, index: usize },

	#[error("{key} is defined in both {first} and {second}")]
	DuplicateObject {
		key: ResourceKey,
		first: PathBuf,
		second: PathBuf,
	},

	#[error(transparent)]
	Parse(#[from] ParseError),
}

/// A single object loaded from a manifest tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestObject {
	/// File the object came from, relative to the tree root.
	pub source: PathBuf,
	pub content: String,
}

/// Objects of a rendered manifest tree, keyed by resource.
#[derive(Debug, Clone, Default)]
pub struct ManifestTree {
	objects: BTreeMap<ResourceKey, ManifestObject>,
}

impl ManifestTree {
	/// Load every object below `root`.
	///
	/// Files named after kubectl's object convention (see
	/// [`ResourceKey::from_object_file_name`]) hold exactly one object. Other
	/// `.yaml`/`.yml` files may hold several `---`-separated documents, each
	/// keyed by its own `kind` and `metadata`. Anything else is skipped.
	#[instrument(skip_all, fields(root = %root.display()))]
	pub fn load(root: &Path) -> Result<Self, TreeError> {
		let mut tree = Self::default();

		for entry in WalkDir::new(root).sort_by_file_name() {
			let entry = entry.map_err(|source| TreeError::Walk {
				path: root.to_path_buf(),
				source,
			})?;
			if !entry.file_type().is_file() {
				continue;
			}

			let path = entry.path();
			let relative = path.strip_prefix(root).unwrap_or(path).to_path_buf();
			let file_name = entry.file_name().to_string_lossy();

			if let Some(key) = ResourceKey::from_object_file_name(&file_name) {
				let content = read(path)?;
				tree.insert(key, relative, content)?;
				continue;
			}

			if !is_yaml(path) {
				trace!(path = %relative.display(), "skipping non-manifest file");
				continue;
			}

			let content = read(path)?;
			for (index, document) in split_documents(&content).into_iter().enumerate() {
				let value: serde_yaml::Value =
					serde_yaml::from_str(&document).map_err(|source| TreeError::Yaml {
						path: relative.clone(),
						index,
						source,
					})?;
				if value.is_null() {
					continue;
				}
				let key = ResourceKey::from_manifest(&value).ok_or_else(|| {
					TreeError::UnidentifiedObject {
						path: relative.clone(),
						index,
					}
				})?;
				tree.insert(key, relative.clone(), document)?;
			}
		}

		debug!(objects = tree.objects.len(), "loaded manifest tree");
		Ok(tree)
	}

	/// Add an object, rejecting a second definition of the same key.
	pub fn insert(
		&mut self,
		key: ResourceKey,
		source: PathBuf,
		content: String,
	) -> Result<(), TreeError> {
		if let Some(existing) = self.objects.get(&key) {
			return Err(TreeError::DuplicateObject {
				key,
				first: existing.source.clone(),
				second: source,
			});
		}
		self.objects.insert(key, ManifestObject { source, content });
		Ok(())
	}

	pub fn get(&self, key: &ResourceKey) -> Option<&ManifestObject> {
		self.objects.get(key)
	}

	pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
		self.objects.keys()
	}

	pub fn len(&self) -> usize {
		self.objects.len()
	}

	pub fn is_empty(&self) -> bool {
		self.objects.is_empty()
	}
}

fn read(path: &Path) -> Result<String, TreeError> {
	std::fs::read_to_string(path).map_err(|source| TreeError::Read {
		path: path.to_path_buf(),
		source,
	})
}

fn is_yaml(path: &Path) -> bool {
	path.extension()
		.is_some_and(|ext| ext == "yaml" || ext == "yml")
}

/// Split a multi-document YAML stream on `---` marker lines.
fn split_documents(content: &str) -> Vec<String> {
	let mut documents = vec![String::new()];
	for line in content.lines() {
		if line.trim_end() == "---" {
			documents.push(String::new());
			continue;
		}
		if let Some(current) = documents.last_mut() {
			current.push_str(line);
			current.push('\n');
		}
	}
	documents.retain(|d| !d.trim().is_empty());
	documents
}

/// Compare two loaded trees object by object.
#[instrument(skip_all, fields(old = old.len(), new = new.len()))]
pub fn diff_trees(
	old: &ManifestTree,
	new: &ManifestTree,
	options: ParseOptions,
) -> Result<DiffResultSet, TreeError> {
	let keys: BTreeSet<&ResourceKey> = old.keys().chain(new.keys()).collect();
	let mut collector = RecordCollector::new(options);

	for key in keys {
		let old_object = old.get(key);
		let new_object = new.get(key);

		let old_text = old_object.map_or("", |o| o.content.as_str());
		let new_text = new_object.map_or("", |o| o.content.as_str());

		let body = TextDiff::from_lines(old_text, new_text)
			.unified_diff()
			.context_radius(CONTEXT_RADIUS)
			.to_string();
		let hunks = read_hunks(&body, key)?;

		let headers = vec![
			format!("--- {}", side_label("old", old_object)),
			format!("+++ {}", side_label("new", new_object)),
		];
		let change = ChangeKind::classify(old_object.is_none(), new_object.is_none(), &hunks);
		trace!(key = %key, change = %change, "compared object");

		collector.push(ChangeRecord::new(key.clone(), change, headers, hunks))?;
	}

	Ok(collector.finish())
}

fn side_label(side: &str, object: Option<&ManifestObject>) -> String {
	match object {
		Some(o) => format!("{side}/{}", o.source.display()),
		None => DEV_NULL.to_string(),
	}
}

/// Load two directories and compare them.
pub fn diff_dirs(
	old: &Path,
	new: &Path,
	options: ParseOptions,
) -> Result<DiffResultSet, TreeError> {
	let old = ManifestTree::load(old)?;
	let new = ManifestTree::load(new)?;
	diff_trees(&old, &new, options)
}
