//! Utilities for command handlers.

use std::io::{self, ErrorKind, Write};

/// A writer that treats a closed pipe as a successful write.
///
/// Lets `kubeapply diff ... | head` exit quietly instead of failing with
/// EPIPE once the reader goes away.
pub struct BrokenPipeGuard<W> {
	inner: W,
}

impl<W> BrokenPipeGuard<W> {
	pub fn new(inner: W) -> Self {
		Self { inner }
	}
}

impl<W: Write> Write for BrokenPipeGuard<W> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self.inner.write(buf) {
			Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(buf.len()),
			other => other,
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match self.inner.flush() {
			Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
			other => other,
		}
	}
}

/// Parse a `--log-level` value. Unknown names fall back to `None`, which
/// defers to `RUST_LOG`.
pub fn parse_log_level(level: Option<&str>) -> Option<tracing::Level> {
	match level?.to_lowercase().as_str() {
		"trace" => Some(tracing::Level::TRACE),
		"debug" => Some(tracing::Level::DEBUG),
		"info" => Some(tracing::Level::INFO),
		"warn" | "warning" => Some(tracing::Level::WARN),
		"error" => Some(tracing::Level::ERROR),
		_ => None,
	}
}
