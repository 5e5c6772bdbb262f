//! MachineSet Controller
//!
//! Scales annotated MachineSets to the number of hosts matching their
//! template's host selector, tracking the host inventory as machines come
//! and go.

mod controller;
mod error;
mod reconciler;

#[cfg(test)]
mod reconciler_test;

use std::env;

use anyhow::Result;
use tracing::info;

use controller::MachineSetController;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("Starting MachineSet controller");

    let namespace = env::var("WATCH_NAMESPACE").ok();
    info!(
        "  Namespace: {}",
        namespace.as_deref().unwrap_or("default")
    );

    let controller = MachineSetController::new(namespace).await?;
    controller.run().await?;

    Ok(())
}
