use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

mod api;
mod control;
mod daemon;
mod db;
mod settings;
mod sync;
mod util;

#[derive(Parser)]
#[command(
    name = "safesyncd",
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("BUILD_DATE"), ")"),
    about = "Bidirectional 2safe file sync daemon for Linux"
)]
struct Cli {
    /// Path to the settings file [default: ~/.config/safesyncd/settings.toml]
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "safesyncd=info",
        1 => "safesyncd=debug",
        2 => "safesyncd=trace",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

/// Check inotify watch limits on Linux and warn if they look too low.
fn check_inotify_limits() {
    let path = "/proc/sys/fs/inotify/max_user_watches";
    if let Ok(content) = std::fs::read_to_string(path) {
        if let Ok(limit) = content.trim().parse::<u64>() {
            if limit < 65536 {
                tracing::warn!(
                    max_user_watches = limit,
                    "inotify watch limit is low — you may hit issues with large trees. \
                     Increase with: echo 524288 | sudo tee {path}"
                );
            } else {
                tracing::debug!(max_user_watches = limit, "inotify watch limit OK");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    check_inotify_limits();

    let daemon = daemon::Daemon::new(cli.settings.as_deref())?;
    tracing::info!("safesyncd ready");
    daemon.run().await
}
