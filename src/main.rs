use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "tixrace",
    about = "Timed sale-open race automation for KKTIX ticket pages",
    version
)]
struct Cli {
    /// Path to the user configuration JSON produced by the companion UI.
    #[arg(short, long, default_value = "user_config.json")]
    config: PathBuf,

    /// Run the browser headless (default is headful so the purchase can be
    /// watched and finished by hand).
    #[arg(long)]
    headless: bool,

    /// Override the chrome/chromium executable path.
    #[arg(long)]
    chrome: Option<PathBuf>,

    /// Log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut session = tixrace_cdp_session::SessionConfig::default();
    if cli.headless {
        session.headless = true;
    }
    if let Some(chrome) = cli.chrome {
        session.executable = chrome;
    }

    tixrace_cli::orchestrator::run(cli.config, session).await
}
