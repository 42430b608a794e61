//! Standalone control plane server.
//!
//! Targets listed in `FLIGHTDECK_TARGETS` are served by in-process loopback
//! targets. Log verbosity follows `RUST_LOG` (default `info`).

use control_plane::loopback::LoopbackFactory;
use control_plane::{ControlPlane, ControlPlaneConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ControlPlaneConfig::from_env()?;

    let factory = Arc::new(LoopbackFactory::new());
    for target in &config.discovery.static_targets {
        factory.register(target.connect_url.as_str());
    }

    println!("================================================");
    println!("  Flightdeck Control Plane");
    println!("================================================");
    println!("  Rules database: {}", config.storage.rules_db_path.display());
    println!("  Archive directory: {}", config.storage.archive_dir.display());
    println!("  Static targets: {}", config.discovery.static_targets.len());
    println!("  Max connections: {}", config.connection.max_open);
    println!("================================================\n");

    let control_plane = ControlPlane::builder(config, factory).start().await?;

    tokio::signal::ctrl_c().await?;
    control_plane.shutdown().await;
    Ok(())
}
