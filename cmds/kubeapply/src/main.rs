use anyhow::Result;
use clap::{Parser, Subcommand};
use kubeapply::{
	commands::{self, util::BrokenPipeGuard},
	telemetry,
};

#[cfg(all(
	target_os = "linux",
	feature = "mimalloc",
	not(feature = "system-alloc")
))]
#[global_allocator]
static GLOBAL: mimallocator::Mimalloc = mimallocator::Mimalloc;

#[derive(Parser)]
#[command(name = "kubeapply")]
#[command(about = "Diff rendered Kubernetes manifests against a live cluster", long_about = None)]
#[command(version = env!("KUBEAPPLY_VERSION"))]
struct Cli {
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Differences between the expanded manifests and the cluster
	Diff(commands::diff::DiffArgs),

	/// Structured diff of two manifest directories, as JSON
	#[command(hide = true)]
	Kdiff(commands::kdiff::KdiffArgs),
}

impl Commands {
	fn log_level(&self) -> Option<&str> {
		match self {
			Self::Diff(args) => args.log_level.as_deref(),
			Self::Kdiff(args) => args.log_level.as_deref(),
		}
	}
}

fn main() -> Result<()> {
	let cli = Cli::parse();

	telemetry::init(commands::util::parse_log_level(cli.command.log_level()))?;

	let stdout = BrokenPipeGuard::new(std::io::stdout());

	match cli.command {
		Commands::Diff(args) => commands::diff::run(args, stdout),
		Commands::Kdiff(args) => commands::kdiff::run(args, stdout),
	}
}
