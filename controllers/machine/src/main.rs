//! Machine Controller
//!
//! Claims one available BareMetalHost per Machine, writes the host's
//! desired image, user data and power state while bound, and releases the
//! host again when the machine is deleted. User-data fragments referenced
//! by the provider spec are merged into the bootstrap payload on the way.

mod controller;
mod error;
mod reconciler;
mod userdata;

#[cfg(test)]
mod userdata_test;

use std::env;

use anyhow::Result;
use tracing::info;

use controller::MachineController;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("Starting machine controller");

    let namespace = env::var("WATCH_NAMESPACE").ok();
    info!(
        "  Namespace: {}",
        namespace.as_deref().unwrap_or("default")
    );

    let controller = MachineController::new(namespace).await?;
    controller.run().await?;

    Ok(())
}
