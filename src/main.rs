use std::io::IsTerminal;

use clap::Parser;
use groupbin::{Context, Settings};
use tracing::info;

#[derive(Debug, Parser)]
#[command(version, about = "groupbin content-lifecycle core")]
struct Opt {
    /// Path to a config file (TOML/JSON/YAML; extension-sniffed), read
    /// ahead of `GROUPBIN_*` environment overrides.
    #[arg(long, short, default_value = "groupbin")]
    config: String,
}

/// Thin binary wiring: config, the sqlite metadata store, the filesystem
/// blob store, and the reclamation loop. The HTTP route handlers that turn
/// these into a running service stay out of scope (spec §1); this binary
/// exists to show the wiring the way the teacher's `main.rs` wires a
/// `RadosStore` from its `Settings`, and to host the ambient logging/config/
/// shutdown machinery.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::parse();
    setup_tracing();

    let settings = Settings::new(&opt.config)?;
    let ctx = Context::connect(settings).await?;
    info!(upload_folder = %ctx.settings.upload_folder, "metadata store and blob store ready");

    let reclaim = ctx.start_reclaim_loop();
    info!("reclamation loop started");

    shutdown_signal().await;
    info!("shutdown signal received, draining reclamation loop");
    reclaim.stop().await;

    info!("groupbin core stopped");
    Ok(())
}

fn setup_tracing() {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env();
    let enable_color = std::io::stdout().is_terminal();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(env_filter)
        .with_ansi(enable_color)
        .init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
