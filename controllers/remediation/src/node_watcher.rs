//! Node-reboot watcher.
//!
//! Translates node-level reboot annotations into MachineRemediation
//! records. At most one remediation is active per machine; further node
//! events are ignored until the current workflow records an end time.

use backoff::BackoffTracker;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};
use kube_runtime::controller::Action;
use tracing::{debug, info};

use crds::{
    split_namespaced_key, Machine, MachineRemediation, MachineRemediationSpec, RemediationType,
    NODE_MACHINE_ANNOTATION, NODE_REBOOT_ANNOTATION,
};

use crate::error::ControllerError;

/// Watches nodes for reboot annotations.
pub struct NodeWatcher {
    client: Client,
    pub(crate) backoff: BackoffTracker,
}

impl NodeWatcher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            backoff: BackoffTracker::new(),
        }
    }

    fn machines(&self, namespace: &str) -> Api<Machine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn remediations(&self, namespace: &str) -> Api<MachineRemediation> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Reconciles one node, creating a remediation record when the node
    /// carries the reboot annotation and none is active yet.
    pub async fn reconcile_node(&self, node: &Node) -> Result<Action, ControllerError> {
        let node_name = node.name_any();

        let Some(annotations) = &node.metadata.annotations else {
            return Ok(Action::await_change());
        };
        if !annotations.contains_key(NODE_REBOOT_ANNOTATION) {
            return Ok(Action::await_change());
        }

        // resolve the owning machine through the node's machine annotation
        let machine_key = annotations
            .get(NODE_MACHINE_ANNOTATION)
            .ok_or_else(|| ControllerError::MissingMachineAnnotation(node_name.clone()))?;
        debug!("Node {} is annotated with machine {}", node_name, machine_key);
        let (machine_namespace, machine_name) = split_namespaced_key(machine_key)
            .ok_or_else(|| ControllerError::MalformedKey(machine_key.clone()))?;
        let machine = self.machines(machine_namespace).get(machine_name).await?;

        let remediations = self
            .remediations(machine_namespace)
            .list(&ListParams::default())
            .await?;
        if has_active_remediation(&remediations.items, &machine.name_any()) {
            debug!(
                "Machine {}/{} already has an active remediation",
                machine_namespace, machine_name
            );
            return Ok(Action::await_change());
        }

        info!(
            "Creating remediation for machine {}/{}",
            machine_namespace, machine_name
        );
        let remediation = MachineRemediation {
            metadata: ObjectMeta {
                generate_name: Some("remediation-".to_string()),
                namespace: Some(machine_namespace.to_string()),
                ..Default::default()
            },
            spec: MachineRemediationSpec {
                machine_name: machine.name_any(),
                remediation_type: RemediationType::Reboot,
            },
            status: None,
        };
        self.remediations(machine_namespace)
            .create(&PostParams::default(), &remediation)
            .await?;

        Ok(Action::await_change())
    }
}

/// Whether the machine already has a remediation in flight.
pub(crate) fn has_active_remediation(items: &[MachineRemediation], machine_name: &str) -> bool {
    items
        .iter()
        .any(|remediation| remediation.spec.machine_name == machine_name && remediation.is_active())
}
