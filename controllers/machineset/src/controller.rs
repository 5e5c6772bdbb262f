//! Main controller implementation.
//!
//! Wires the MachineSet reconciler to a kube-runtime controller. Host
//! add/remove events re-trigger every MachineSet in the watched namespace:
//! deciding which sets a host affects requires evaluating each template's
//! selector anyway, so the fan-out stays in the reconciler.

use std::sync::Arc;

use futures::channel::mpsc;
use futures::{pin_mut, StreamExt};
use kube::api::Api;
use kube::{Client, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig, Controller};
use kube_runtime::{watcher, WatchStreamExt};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crds::{BareMetalHost, MachineSet};

use crate::error::ControllerError;
use crate::reconciler::Reconciler;

/// Main controller for MachineSet autoscaling.
pub struct MachineSetController {
    machine_set_watcher: JoinHandle<Result<(), ControllerError>>,
    host_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl MachineSetController {
    /// Creates a new controller instance.
    pub async fn new(namespace: Option<String>) -> Result<Self, ControllerError> {
        info!("Initializing MachineSet controller");

        let client = Client::try_default().await?;
        let ns = namespace.as_deref().unwrap_or("default");
        let machine_set_api: Api<MachineSet> = Api::namespaced(client.clone(), ns);
        let host_api: Api<BareMetalHost> = Api::namespaced(client.clone(), ns);

        let reconciler = Arc::new(Reconciler::new(machine_set_api.clone(), host_api.clone()));

        let (host_events_tx, host_events_rx) = mpsc::channel(16);
        let host_watcher = tokio::spawn(watch_hosts(host_api, host_events_tx));
        let machine_set_watcher = tokio::spawn(watch_machine_sets(
            machine_set_api,
            host_events_rx,
            reconciler,
        ));

        Ok(Self {
            machine_set_watcher,
            host_watcher,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("MachineSet controller running");

        // Wait for any watcher to exit (they should run forever)
        tokio::select! {
            result = &mut self.machine_set_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("MachineSet watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("MachineSet watcher error: {}", e)))?;
            }
            result = &mut self.host_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("BareMetalHost watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("BareMetalHost watcher error: {}", e)))?;
            }
        }

        Ok(())
    }
}

/// Forwards host add/change/remove events as reconcile triggers. A full
/// channel is fine to drop into: a pass over every MachineSet is already
/// pending, so bursts of host events coalesce.
async fn watch_hosts(
    host_api: Api<BareMetalHost>,
    mut host_events: mpsc::Sender<()>,
) -> Result<(), ControllerError> {
    info!("Starting BareMetalHost watcher");

    let stream = watcher(host_api, watcher::Config::default()).touched_objects();
    pin_mut!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(_) => {
                let _ = host_events.try_send(());
            }
            Err(e) => error!("BareMetalHost watch error: {}", e),
        }
    }
    Ok(())
}

async fn watch_machine_sets(
    machine_set_api: Api<MachineSet>,
    host_events: mpsc::Receiver<()>,
    reconciler: Arc<Reconciler>,
) -> Result<(), ControllerError> {
    info!("Starting MachineSet watcher");

    // Error policy: requeue with per-set exponential backoff
    let error_policy = |set: Arc<MachineSet>, error: &ControllerError, ctx: Arc<Reconciler>| {
        let key = format!(
            "{}/{}",
            set.namespace().unwrap_or_default(),
            set.name_any()
        );
        let delay = ctx.backoff.next_delay(&key);
        error!(
            "Reconciliation error for MachineSet {}: {} (retrying in {:?})",
            key, error, delay
        );
        Action::requeue(delay)
    };

    let reconcile = |set: Arc<MachineSet>, ctx: Arc<Reconciler>| async move {
        let key = format!(
            "{}/{}",
            set.namespace().unwrap_or_default(),
            set.name_any()
        );
        let action = ctx.reconcile_machine_set(&set).await?;
        ctx.backoff.reset(&key);
        Ok(action)
    };

    Controller::new(machine_set_api, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(2))
        .reconcile_all_on(host_events)
        .run(reconcile, error_policy, reconciler)
        .for_each(|result| async move {
            if let Err(e) = result {
                error!("Controller error for MachineSet: {}", e);
            }
        })
        .await;

    Ok(())
}
