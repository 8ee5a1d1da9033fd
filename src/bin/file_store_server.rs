//! Read-only tracking server over a file store
//!
//! Answers the query endpoints the conformance harness uses, straight from
//! the file-store layout under `--backend-store-uri`. The default experiment
//! is bootstrapped on start, the way a real tracking server does it.
//!
//! Usage: file-store-server --backend-store-uri <DIR> [--host 127.0.0.1] [--port 5000]

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tracking_conformance::api::create_tracking_router;
use tracking_conformance::core::TrackingTarget;
use tracking_conformance::store::FileStore;

#[derive(Parser, Debug)]
#[command(version, about = "Read-only tracking server over a file store")]
struct Args {
    /// File-store root (absolute path or file:// URI)
    #[arg(long)]
    backend_store_uri: String,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 5000)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let root = match TrackingTarget::parse(&args.backend_store_uri)
        .with_context(|| format!("invalid --backend-store-uri {}", args.backend_store_uri))?
    {
        TrackingTarget::File(root) => root,
        TrackingTarget::Http(url) => bail!("backend store must be a local path, got {}", url),
    };

    let store = FileStore::bootstrap(&root)
        .with_context(|| format!("failed to initialize file store at {}", root.display()))?;
    let app = create_tracking_router(Arc::new(store));

    let listener = TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", args.host, args.port))?;
    info!(
        addr = %listener.local_addr()?,
        root = %root.display(),
        "serving file store"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server error")?;
    Ok(())
}
