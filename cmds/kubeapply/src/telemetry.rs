//! Logging setup.

use std::io::IsTerminal;

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize tracing with the given log level.
///
/// Priority for log level:
/// 1. `log_level` argument (from --log-level CLI flag)
/// 2. `RUST_LOG` environment variable
/// 3. Default: info
///
/// Logs go to stderr, pretty on a terminal and JSON otherwise, so stdout only
/// ever carries diff output.
pub fn init(log_level: Option<Level>) -> Result<()> {
	let filter_layer = match log_level {
		Some(level) => EnvFilter::new(level.as_str()),
		None => EnvFilter::builder()
			.with_default_directive(Level::INFO.into())
			.from_env_lossy(),
	};

	let fmt_layer = if std::io::stderr().is_terminal() {
		tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.pretty()
			.boxed()
	} else {
		tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.json()
			.boxed()
	};

	tracing_subscriber::registry()
		.with(filter_layer)
		.with(fmt_layer)
		.try_init()?;

	Ok(())
}
