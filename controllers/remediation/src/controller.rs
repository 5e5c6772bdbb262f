//! Main controller implementation.
//!
//! This module contains the `RemediationController` struct that
//! orchestrates the two watchers of the remediation binary: one driving
//! MachineRemediation workflow records, one translating node reboot
//! annotations into new records.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use kube::{Client, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig, Controller};
use kube_runtime::events::Recorder;
use kube_runtime::watcher;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crds::MachineRemediation;

use crate::error::ControllerError;
use crate::node_watcher::NodeWatcher;
use crate::reconciler::Reconciler;

/// Main controller for machine remediation.
pub struct RemediationController {
    remediation_watcher: JoinHandle<Result<(), ControllerError>>,
    node_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl RemediationController {
    /// Creates a new controller instance.
    pub async fn new(namespace: Option<String>) -> Result<Self, ControllerError> {
        info!("Initializing remediation controller");

        let client = Client::try_default().await?;
        let ns = namespace.as_deref().unwrap_or("default");
        let remediation_api: Api<MachineRemediation> = Api::namespaced(client.clone(), ns);
        let node_api: Api<Node> = Api::all(client.clone());

        let recorder = Recorder::new(client.clone(), "machine-remediation".into());
        let reconciler = Arc::new(Reconciler::new(client.clone(), recorder));
        let node_reconciler = Arc::new(NodeWatcher::new(client));

        let remediation_watcher =
            tokio::spawn(watch_remediations(remediation_api, reconciler));
        let node_watcher = tokio::spawn(watch_nodes(node_api, node_reconciler));

        Ok(Self {
            remediation_watcher,
            node_watcher,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Remediation controller running");

        // Wait for any watcher to exit (they should run forever)
        tokio::select! {
            result = &mut self.remediation_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("MachineRemediation watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("MachineRemediation watcher error: {}", e)))?;
            }
            result = &mut self.node_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Node watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("Node watcher error: {}", e)))?;
            }
        }

        Ok(())
    }
}

async fn watch_remediations(
    remediation_api: Api<MachineRemediation>,
    reconciler: Arc<Reconciler>,
) -> Result<(), ControllerError> {
    info!("Starting MachineRemediation watcher");

    // Error policy: requeue with per-record exponential backoff
    let error_policy =
        |remediation: Arc<MachineRemediation>, error: &ControllerError, ctx: Arc<Reconciler>| {
            let key = format!(
                "{}/{}",
                remediation.namespace().unwrap_or_default(),
                remediation.name_any()
            );
            let delay = ctx.backoff.next_delay(&key);
            error!(
                "Reconciliation error for MachineRemediation {}: {} (retrying in {:?})",
                key, error, delay
            );
            Action::requeue(delay)
        };

    let reconcile = |remediation: Arc<MachineRemediation>, ctx: Arc<Reconciler>| async move {
        let key = format!(
            "{}/{}",
            remediation.namespace().unwrap_or_default(),
            remediation.name_any()
        );
        let action = ctx.reconcile_remediation(&remediation).await?;
        ctx.backoff.reset(&key);
        Ok(action)
    };

    Controller::new(remediation_api, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(2))
        .run(reconcile, error_policy, reconciler)
        .for_each(|result| async move {
            if let Err(e) = result {
                error!("Controller error for MachineRemediation: {}", e);
            }
        })
        .await;

    Ok(())
}

async fn watch_nodes(
    node_api: Api<Node>,
    reconciler: Arc<NodeWatcher>,
) -> Result<(), ControllerError> {
    info!("Starting Node watcher");

    // Error policy: requeue with per-node exponential backoff
    let error_policy = |node: Arc<Node>, error: &ControllerError, ctx: Arc<NodeWatcher>| {
        let key = node.name_any();
        let delay = ctx.backoff.next_delay(&key);
        error!(
            "Reconciliation error for node {}: {} (retrying in {:?})",
            key, error, delay
        );
        Action::requeue(delay)
    };

    let reconcile = |node: Arc<Node>, ctx: Arc<NodeWatcher>| async move {
        let key = node.name_any();
        let action = ctx.reconcile_node(&node).await?;
        ctx.backoff.reset(&key);
        Ok(action)
    };

    Controller::new(node_api, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(2))
        .run(reconcile, error_policy, reconciler)
        .for_each(|result| async move {
            if let Err(e) = result {
                error!("Controller error for Node: {}", e);
            }
        })
        .await;

    Ok(())
}
