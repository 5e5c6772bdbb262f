//! Remediation Controller
//!
//! Power-cycles the host behind an unresponsive machine. A reboot
//! annotation on a node turns into a MachineRemediation workflow record,
//! which the state machine drives through power-off, node eviction and
//! power-on until the node reports Ready again.

mod controller;
mod error;
mod node_watcher;
mod reconciler;

#[cfg(test)]
mod node_watcher_test;
#[cfg(test)]
mod reconciler_test;

use std::env;

use anyhow::Result;
use tracing::info;

use controller::RemediationController;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("Starting remediation controller");

    let namespace = env::var("WATCH_NAMESPACE").ok();
    info!(
        "  Namespace: {}",
        namespace.as_deref().unwrap_or("default")
    );

    let controller = RemediationController::new(namespace).await?;
    controller.run().await?;

    Ok(())
}
