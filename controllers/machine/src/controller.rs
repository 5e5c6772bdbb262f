//! Main controller implementation.
//!
//! Wires the machine reconciler to a kube-runtime controller: machines are
//! the primary watch, and host changes map back to the consuming machine so
//! provisioning progress is observed without polling.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::Api;
use kube::{Client, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig, Controller};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crds::{BareMetalHost, Machine};

use crate::error::ControllerError;
use crate::reconciler::Reconciler;

/// Main controller for machine claim management.
pub struct MachineController {
    machine_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl MachineController {
    /// Creates a new controller instance.
    pub async fn new(namespace: Option<String>) -> Result<Self, ControllerError> {
        info!("Initializing machine controller");

        let client = Client::try_default().await?;
        let ns = namespace.as_deref().unwrap_or("default");
        let machine_api: Api<Machine> = Api::namespaced(client.clone(), ns);
        let host_api: Api<BareMetalHost> = Api::namespaced(client.clone(), ns);

        let reconciler = Arc::new(Reconciler::new(client, StdRng::from_entropy()));

        let machine_watcher = tokio::spawn(watch_machines(machine_api, host_api, reconciler));

        Ok(Self { machine_watcher })
    }

    /// Runs the controller until shutdown.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("Machine controller running");
        self.machine_watcher
            .await
            .map_err(|e| ControllerError::Watch(format!("Machine watcher panicked: {}", e)))?
    }
}

async fn watch_machines(
    machine_api: Api<Machine>,
    host_api: Api<BareMetalHost>,
    reconciler: Arc<Reconciler>,
) -> Result<(), ControllerError> {
    info!("Starting Machine watcher");

    // Error policy: requeue with per-machine exponential backoff
    let error_policy = |machine: Arc<Machine>, error: &ControllerError, ctx: Arc<Reconciler>| {
        let key = format!(
            "{}/{}",
            machine.namespace().unwrap_or_default(),
            machine.name_any()
        );
        let delay = ctx.backoff.next_delay(&key);
        error!(
            "Reconciliation error for machine {}: {} (retrying in {:?})",
            key, error, delay
        );
        Action::requeue(delay)
    };

    let reconcile = |machine: Arc<Machine>, ctx: Arc<Reconciler>| async move {
        let key = format!(
            "{}/{}",
            machine.namespace().unwrap_or_default(),
            machine.name_any()
        );
        let action = ctx.reconcile_machine(&machine).await?;
        ctx.backoff.reset(&key);
        Ok(action)
    };

    let config = ControllerConfig::default().concurrency(2);

    Controller::new(machine_api, watcher::Config::default())
        .with_config(config)
        .watches(
            host_api,
            watcher::Config::default(),
            |host: BareMetalHost| {
                // a host event re-enqueues the machine consuming it
                host.spec
                    .consumer_ref
                    .as_ref()
                    .filter(|consumer| consumer.kind == "Machine")
                    .map(|consumer| ObjectRef::new(&consumer.name).within(&consumer.namespace))
            },
        )
        .run(reconcile, error_policy, reconciler)
        .for_each(|result| async move {
            if let Err(e) = result {
                error!("Controller error for Machine: {}", e);
            }
        })
        .await;

    Ok(())
}
