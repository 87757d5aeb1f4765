//! Per-cluster mutual exclusion for diff runs.
//!
//! Locks are advisory: they only keep kubeapply processes (or tasks sharing a
//! [`ConcurrencyGuard`]) from running against the same cluster at once.

use std::{
	collections::{HashMap, HashSet},
	fs::OpenOptions,
	io::{ErrorKind as IoErrorKind, Write},
	path::{Path, PathBuf},
	sync::{Arc, Mutex, PoisonError},
	time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// How often a contended lock is retried.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum LockError {
	#[error("timed out after {waited:?} waiting for lock on {key}")]
	Timeout { key: String, waited: Duration },

	#[error("lock file {}", path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("encoding lock metadata")]
	Metadata(#[from] serde_json::Error),
}

/// Storage for held locks.
pub trait LockBackend: Send + Sync {
	/// Take the lock if it is free. Returns `false` when someone else holds it.
	fn try_acquire(&self, key: &str) -> Result<bool, LockError>;

	fn release(&self, key: &str) -> Result<(), LockError>;

	fn is_held(&self, key: &str) -> bool;
}

/// Locks shared by everything in the current process.
#[derive(Debug, Default)]
pub struct MemoryLocks {
	held: Mutex<HashSet<String>>,
}

impl LockBackend for MemoryLocks {
	fn try_acquire(&self, key: &str) -> Result<bool, LockError> {
		let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
		Ok(held.insert(key.to_string()))
	}

	fn release(&self, key: &str) -> Result<(), LockError> {
		let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
		held.remove(key);
		Ok(())
	}

	fn is_held(&self, key: &str) -> bool {
		let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
		held.contains(key)
	}
}

/// Metadata written into each lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
	pub key: String,
	pub holder: String,
	pub hostname: String,
	pub pid: u32,
	pub lock_id: String,
	pub locked_at: String,
}

impl LockInfo {
	fn new(key: &str) -> Self {
		Self {
			key: key.to_string(),
			holder: whoami::username(),
			hostname: local_hostname(),
			pid: std::process::id(),
			lock_id: uuid::Uuid::new_v4().to_string(),
			locked_at: chrono::Utc::now().to_rfc3339(),
		}
	}
}

fn local_hostname() -> String {
	whoami::fallible::hostname().unwrap_or_default()
}

/// Whether process `pid` on this host may still be running.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
	use nix::{
		errno::Errno,
		sys::signal::{kill, Signal},
		unistd::Pid,
	};

	let Ok(pid) = i32::try_from(pid) else {
		return false;
	};
	!matches!(kill(Pid::from_raw(pid), None::<Signal>), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
	true
}

/// Locks stored as files in a directory, visible to other processes.
///
/// A lock is held while `<dir>/<key>.lock` exists. Apart from locks taken
/// through this value, only stale ones are removed: those whose holder ran on
/// this host and has exited, and, when an age limit is set, those older than
/// it.
#[derive(Debug)]
pub struct FileLocks {
	dir: PathBuf,
	stale_after: Option<Duration>,
	/// Lock ids of the files this value created, by key.
	owned: Mutex<HashMap<String, String>>,
}

impl FileLocks {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self {
			dir: dir.into(),
			stale_after: None,
			owned: Mutex::default(),
		}
	}

	/// Treat locks older than `age` as abandoned, whoever holds them.
	pub fn with_stale_after(mut self, age: Duration) -> Self {
		self.stale_after = Some(age);
		self
	}

	pub fn path_for(&self, key: &str) -> PathBuf {
		let name: String = key
			.chars()
			.map(|c| {
				if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
					c
				} else {
					'_'
				}
			})
			.collect();
		self.dir.join(format!("{name}.lock"))
	}

	/// Read the metadata of whoever holds `key`.
	pub fn holder(&self, key: &str) -> Option<LockInfo> {
		let contents = std::fs::read(self.path_for(key)).ok()?;
		serde_json::from_slice(&contents).ok()
	}

	fn is_stale(&self, path: &Path, holder: Option<&LockInfo>) -> bool {
		if let Some(info) = holder {
			if info.hostname == local_hostname() && !process_alive(info.pid) {
				return true;
			}
		}
		let Some(limit) = self.stale_after else {
			return false;
		};
		std::fs::metadata(path)
			.and_then(|m| m.modified())
			.ok()
			.and_then(|modified| SystemTime::now().duration_since(modified).ok())
			.is_some_and(|age| age >= limit)
	}

	/// Remove the lock file for `key` if its holder is gone. Returns whether
	/// anything was removed.
	fn reclaim_stale(&self, key: &str, path: &Path) -> Result<bool, LockError> {
		let holder = self.holder(key);
		if !self.is_stale(path, holder.as_ref()) {
			return Ok(false);
		}

		// Someone else may have reclaimed it and taken a fresh lock meanwhile.
		let current = self.holder(key);
		if current.as_ref().map(|i| &i.lock_id) != holder.as_ref().map(|i| &i.lock_id) {
			return Ok(false);
		}

		warn!(
			path = %path.display(),
			holder = holder.as_ref().map(|i| i.holder.as_str()),
			hostname = holder.as_ref().map(|i| i.hostname.as_str()),
			pid = holder.as_ref().map(|i| i.pid),
			locked_at = holder.as_ref().map(|i| i.locked_at.as_str()),
			"removing stale lock"
		);
		match std::fs::remove_file(path) {
			Ok(()) => Ok(true),
			Err(e) if e.kind() == IoErrorKind::NotFound => Ok(true),
			Err(e) => Err(io_error(path)(e)),
		}
	}

	fn create(&self, path: &Path) -> Result<Option<std::fs::File>, LockError> {
		match OpenOptions::new().write(true).create_new(true).open(path) {
			Ok(file) => Ok(Some(file)),
			Err(e) if e.kind() == IoErrorKind::AlreadyExists => Ok(None),
			Err(e) => Err(io_error(path)(e)),
		}
	}
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> LockError + '_ {
	move |source| LockError::Io {
		path: path.to_path_buf(),
		source,
	}
}

impl LockBackend for FileLocks {
	fn try_acquire(&self, key: &str) -> Result<bool, LockError> {
		std::fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;

		let path = self.path_for(key);
		let mut file = match self.create(&path)? {
			Some(file) => file,
			None if self.reclaim_stale(key, &path)? => match self.create(&path)? {
				Some(file) => file,
				None => return Ok(false),
			},
			None => return Ok(false),
		};

		let info = LockInfo::new(key);
		let written = serde_json::to_vec_pretty(&info)
			.map_err(LockError::from)
			.and_then(|bytes| file.write_all(&bytes).map_err(io_error(&path)));
		if let Err(e) = written {
			drop(file);
			let _ = std::fs::remove_file(&path);
			return Err(e);
		}

		debug!(path = %path.display(), lock_id = %info.lock_id, "wrote lock file");
		self.owned
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(key.to_string(), info.lock_id);
		Ok(true)
	}

	fn release(&self, key: &str) -> Result<(), LockError> {
		let Some(lock_id) = self
			.owned
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(key)
		else {
			return Ok(());
		};

		let path = self.path_for(key);
		match self.holder(key) {
			Some(info) if info.lock_id == lock_id => {
				std::fs::remove_file(&path).map_err(io_error(&path))
			}
			_ => {
				warn!(path = %path.display(), "lock file was replaced or removed while held");
				Ok(())
			}
		}
	}

	fn is_held(&self, key: &str) -> bool {
		self.path_for(key).exists()
	}
}

/// Hands out per-cluster locks, waiting for contended ones.
#[derive(Clone)]
pub struct ConcurrencyGuard {
	backend: Arc<dyn LockBackend>,
	poll_interval: Duration,
}

impl std::fmt::Debug for ConcurrencyGuard {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConcurrencyGuard")
			.field("poll_interval", &self.poll_interval)
			.finish_non_exhaustive()
	}
}

impl ConcurrencyGuard {
	pub fn new(backend: Arc<dyn LockBackend>) -> Self {
		Self {
			backend,
			poll_interval: DEFAULT_POLL_INTERVAL,
		}
	}

	pub fn in_memory() -> Self {
		Self::new(Arc::new(MemoryLocks::default()))
	}

	pub fn with_poll_interval(mut self, interval: Duration) -> Self {
		self.poll_interval = interval;
		self
	}

	pub fn is_held(&self, key: &str) -> bool {
		self.backend.is_held(key)
	}

	/// Wait for the lock on `key`.
	///
	/// With no timeout this waits forever; dropping the returned future
	/// abandons the wait without taking the lock.
	#[instrument(skip(self))]
	pub async fn acquire(
		&self,
		key: &str,
		timeout: Option<Duration>,
	) -> Result<LockGuard, LockError> {
		let started = Instant::now();
		let mut logged = false;

		loop {
			if self.backend.try_acquire(key)? {
				debug!(waited = ?started.elapsed(), "acquired lock");
				return Ok(LockGuard {
					backend: Arc::clone(&self.backend),
					key: key.to_string(),
				});
			}

			let waited = started.elapsed();
			if timeout.is_some_and(|t| waited >= t) {
				return Err(LockError::Timeout {
					key: key.to_string(),
					waited,
				});
			}
			if !logged {
				debug!("lock is held elsewhere, waiting");
				logged = true;
			}

			let mut pause = self.poll_interval;
			if let Some(timeout) = timeout {
				pause = pause.min(timeout.saturating_sub(waited));
			}
			tokio::time::sleep(pause).await;
		}
	}
}

/// A held lock, released when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
	backend: Arc<dyn LockBackend>,
	key: String,
}

impl LockGuard {
	pub fn key(&self) -> &str {
		&self.key
	}
}

impl std::fmt::Debug for LockGuard {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LockGuard").field("key", &self.key).finish()
	}
}

impl Drop for LockGuard {
	fn drop(&mut self) {
		match self.backend.release(&self.key) {
			Ok(()) => debug!(key = %self.key, "released lock"),
			Err(e) => warn!(key = %self.key, error = %e, "failed to release lock"),
		}
	}
}
