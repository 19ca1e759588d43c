//! evalbridge
//!
//! Evaluates expressions on behalf of a host process. Frames are read from
//! stdin and responses written to stdout; logs go to stderr.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use evalbridge::{config::Config, supervisor};

#[derive(Parser, Debug)]
#[command(name = "evalbridge")]
#[command(about = "Out-of-process expression evaluator speaking a framed binary protocol on stdio")]
struct Args {
    /// Dependency directory to link into the resolution root
    #[arg(long)]
    modules_dir: Option<PathBuf>,

    /// Resolution root for imports and file reads
    #[arg(long)]
    root: Option<PathBuf>,

    /// Terminate the session after the first evaluation error
    #[arg(long)]
    exit_on_eval_error: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stderr only: stdout carries the protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(dir) = args.modules_dir {
        config.modules_dir = Some(dir);
    }
    if let Some(root) = args.root {
        config.root = root;
    }
    config.exit_on_eval_error |= args.exit_on_eval_error;

    info!(
        root = %config.root.display(),
        modules_dir = ?config.modules_dir,
        exit_on_eval_error = config.exit_on_eval_error,
        "Loaded configuration"
    );

    let exit = supervisor::serve_stdio(config).await?;
    std::process::exit(exit.code());
}
