//! Standalone sync-server binary. Run with `--port`, or use the default.

use clap::Parser;
use sync_core::config;

const DEFAULT_PORT: u16 = 5182;

#[derive(Parser, Debug)]
#[command(about = "Reference host for sync-core: one room actor per room-id, sqlite persistence")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let _ = config::ensure_loaded();
    let args = Args::parse();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(sync_server::run_sync_server(args.port))
}
