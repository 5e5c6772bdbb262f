//! The remediation state machine.
//!
//! Drives a forced reboot of the host behind an unresponsive machine
//! through Started → PowerOff → PowerOn → Succeeded/Failed. Each tick
//! observes the remediation record, the host and the node, decides a single
//! step, applies it, and lets the next tick pick up from there. The
//! decision itself is a pure function of the observed state.

use std::time::Duration;

use backoff::BackoffTracker;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use kube_runtime::controller::Action;
use kube_runtime::events::{Event, EventType, Recorder};
use tracing::{debug, error, warn};

use crds::{
    split_namespaced_key, BareMetalHost, Machine, MachineRemediation, MachineRemediationStatus,
    RemediationState, RemediationType, NODE_REBOOT_ANNOTATION, REBOOT_IN_PROGRESS_ANNOTATION,
};

use crate::error::ControllerError;

const REBOOT_TIMEOUT_MINUTES: i64 = 5;

/// How long to wait between polls while the host powers down or the node
/// rejoins.
const POLL_DELAY: Duration = Duration::from_secs(10);

fn reboot_timeout() -> chrono::Duration {
    chrono::Duration::minutes(REBOOT_TIMEOUT_MINUTES)
}

/// One step of the reboot workflow, decided from observed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    /// The host was powered off by an operator before remediation began;
    /// succeed without touching it
    SkipPoweredOff,
    /// Mark the reboot on the host and power it off
    BeginPowerOff { annotate: bool },
    /// Host still reports power; check again later
    WaitForPowerOff,
    /// Delete the node, clear the marker, power the host back on
    BeginPowerOn,
    /// Node not Ready yet; check again later
    WaitForNode,
    /// Node is back under the cluster; record success
    Succeed,
    /// Too long in a non-terminal state
    FailOnTimeout,
    /// Terminal success: the workflow record removes itself
    DeleteRemediation,
    /// Terminal failure: clear the node's reboot annotation so a future
    /// remediation may trigger again
    ClearNodeAnnotation,
}

/// Decides the next step from the remediation status, the host, and the
/// readiness of the machine's node (`None` while the node is absent).
pub(crate) fn plan(
    status: &MachineRemediationStatus,
    host: &BareMetalHost,
    node_ready: Option<bool>,
    now: DateTime<Utc>,
) -> Step {
    match status.state {
        RemediationState::Started => {
            if !host.spec.online && !reboot_in_progress(host) {
                Step::SkipPoweredOff
            } else {
                Step::BeginPowerOff {
                    annotate: !reboot_in_progress(host),
                }
            }
        }
        RemediationState::PowerOff => {
            if timed_out(status, now) {
                Step::FailOnTimeout
            } else if host.status.as_ref().is_some_and(|s| s.powered_on) {
                Step::WaitForPowerOff
            } else {
                Step::BeginPowerOn
            }
        }
        RemediationState::PowerOn => {
            if timed_out(status, now) {
                Step::FailOnTimeout
            } else if node_ready == Some(true) {
                Step::Succeed
            } else {
                Step::WaitForNode
            }
        }
        RemediationState::Succeeded => Step::DeleteRemediation,
        RemediationState::Failed => Step::ClearNodeAnnotation,
    }
}

/// Whether the host carries the remediation power-off marker. This is what
/// tells a remediation-initiated power-off apart from an operator's.
pub(crate) fn reboot_in_progress(host: &BareMetalHost) -> bool {
    host.annotations()
        .get(REBOOT_IN_PROGRESS_ANNOTATION)
        .map(String::as_str)
        == Some("true")
}

pub(crate) fn timed_out(status: &MachineRemediationStatus, now: DateTime<Utc>) -> bool {
    status
        .start_time
        .is_some_and(|start| start + reboot_timeout() < now)
}

pub(crate) fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
}

/// Reconciles MachineRemediation workflow records.
pub struct Reconciler {
    client: Client,
    recorder: Recorder,
    pub(crate) backoff: BackoffTracker,
}

impl Reconciler {
    /// Creates a new reconciler instance. Events for every state transition
    /// go through the recorder.
    pub fn new(client: Client, recorder: Recorder) -> Self {
        Self {
            client,
            recorder,
            backoff: BackoffTracker::new(),
        }
    }

    fn machines(&self, namespace: &str) -> Api<Machine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn hosts(&self, namespace: &str) -> Api<BareMetalHost> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn remediations(&self, namespace: &str) -> Api<MachineRemediation> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    /// Reconciles one MachineRemediation record.
    pub async fn reconcile_remediation(
        &self,
        remediation: &MachineRemediation,
    ) -> Result<Action, ControllerError> {
        let name = remediation.name_any();
        let namespace = remediation
            .namespace()
            .unwrap_or_else(|| "default".to_string());

        if remediation.meta().deletion_timestamp.is_some() {
            return Ok(Action::await_change());
        }

        // first sight: stamp the start time so timeouts have an anchor
        let Some(status) = remediation.status.clone() else {
            let status = MachineRemediationStatus {
                state: RemediationState::Started,
                start_time: Some(Utc::now()),
                ..Default::default()
            };
            self.write_status(remediation, &namespace, &name, status)
                .await?;
            return Ok(Action::requeue(Duration::ZERO));
        };

        debug!(
            "MachineRemediation {}/{} has state {:?}",
            namespace, name, status.state
        );

        match remediation.spec.remediation_type {
            RemediationType::Reboot => self.reboot(remediation, &status, &namespace, &name).await,
            RemediationType::Recreate => {
                self.fail_recreate(remediation, &status, &namespace, &name)
                    .await
            }
        }
    }

    async fn reboot(
        &self,
        remediation: &MachineRemediation,
        status: &MachineRemediationStatus,
        namespace: &str,
        name: &str,
    ) -> Result<Action, ControllerError> {
        let machine = self
            .machines(namespace)
            .get(&remediation.spec.machine_name)
            .await?;
        let machine_name = machine.name_any();
        let host = self.host_for(&machine).await?;
        let node_ready = self.node_readiness(&machine).await?;
        let now = Utc::now();

        match plan(status, &host, node_ready, now) {
            Step::SkipPoweredOff => {
                debug!(
                    "Skipping remediation, machine {} had power off state before the remediation action",
                    machine_name
                );
                self.emit(
                    &machine,
                    EventType::Normal,
                    "MachineRemediationSkippedOffline",
                    format!(
                        "Remediation of machine {:?} skipped because it was in power off state already",
                        machine_name
                    ),
                )
                .await;
                let mut updated = status.clone();
                updated.state = RemediationState::Succeeded;
                updated.reason = "Skip the reboot, the machine was powered off already".to_string();
                updated.end_time = Some(now);
                self.write_status(remediation, namespace, name, updated)
                    .await?;
                Ok(Action::await_change())
            }
            Step::BeginPowerOff { annotate } => {
                let mut updated_host = host.clone();
                if annotate {
                    updated_host
                        .meta_mut()
                        .annotations
                        .get_or_insert_with(Default::default)
                        .insert(REBOOT_IN_PROGRESS_ANNOTATION.to_string(), "true".to_string());
                }
                debug!("Powering off machine {}", machine_name);
                updated_host.spec.online = false;
                self.write_host(&host, updated_host, namespace).await?;
                self.emit(
                    &machine,
                    EventType::Normal,
                    "MachineRemediationRebootStarted",
                    format!("Reboot of machine {:?} has started", machine_name),
                )
                .await;
                let mut updated = status.clone();
                updated.state = RemediationState::PowerOff;
                updated.reason = "Starts the reboot process".to_string();
                self.write_status(remediation, namespace, name, updated)
                    .await?;
                Ok(Action::requeue(POLL_DELAY))
            }
            Step::WaitForPowerOff => {
                warn!("Machine {} still has power on state", machine_name);
                Ok(Action::requeue(POLL_DELAY))
            }
            Step::BeginPowerOn => {
                // delete the node first so workload rescheduling starts
                // while the hardware boots; the cluster recreates the node
                // once the host rejoins
                self.delete_machine_node(&machine).await?;
                debug!("Powering on machine {}", machine_name);
                let mut updated_host = host.clone();
                updated_host.spec.online = true;
                if let Some(annotations) = updated_host.meta_mut().annotations.as_mut() {
                    annotations.remove(REBOOT_IN_PROGRESS_ANNOTATION);
                }
                self.write_host(&host, updated_host, namespace).await?;
                self.emit(
                    &machine,
                    EventType::Normal,
                    "MachineRemediationRebootPoweringOn",
                    format!("Powering on machine {:?}", machine_name),
                )
                .await;
                let mut updated = status.clone();
                updated.state = RemediationState::PowerOn;
                updated.reason = "Reboot in progress".to_string();
                self.write_status(remediation, namespace, name, updated)
                    .await?;
                Ok(Action::requeue(POLL_DELAY))
            }
            Step::WaitForNode => Ok(Action::requeue(POLL_DELAY)),
            Step::Succeed => {
                debug!("Remediation of machine {} succeeded", machine_name);
                self.emit(
                    &machine,
                    EventType::Normal,
                    "MachineRemediationRebootSucceeded",
                    format!("Remediation of machine {:?} succeeded", machine_name),
                )
                .await;
                let mut updated = status.clone();
                updated.state = RemediationState::Succeeded;
                updated.reason = "Reboot succeeded".to_string();
                updated.end_time = Some(now);
                self.write_status(remediation, namespace, name, updated)
                    .await?;
                Ok(Action::await_change())
            }
            Step::FailOnTimeout => {
                error!("Remediation of machine {} failed on timeout", machine_name);
                self.emit(
                    &machine,
                    EventType::Warning,
                    "MachineRemediationRebootTimedOut",
                    format!("Remediation of machine {:?} timed out", machine_name),
                )
                .await;
                let mut updated = status.clone();
                updated.state = RemediationState::Failed;
                updated.reason = "Reboot failed on timeout".to_string();
                updated.end_time = Some(now);
                self.write_status(remediation, namespace, name, updated)
                    .await?;
                Ok(Action::await_change())
            }
            Step::DeleteRemediation => {
                if let Err(err) = self
                    .remediations(namespace)
                    .delete(name, &DeleteParams::default())
                    .await
                {
                    if !is_not_found(&err) {
                        return Err(err.into());
                    }
                }
                Ok(Action::await_change())
            }
            Step::ClearNodeAnnotation => {
                self.clear_node_reboot_annotation(&machine).await?;
                Ok(Action::await_change())
            }
        }
    }

    /// Recreate is declared in the API but not implemented; the workflow is
    /// driven straight to a terminal failure instead of retrying forever.
    async fn fail_recreate(
        &self,
        remediation: &MachineRemediation,
        status: &MachineRemediationStatus,
        namespace: &str,
        name: &str,
    ) -> Result<Action, ControllerError> {
        if status.end_time.is_some() {
            return Ok(Action::await_change());
        }
        warn!(
            "MachineRemediation {}/{} requests Recreate, which is not implemented",
            namespace, name
        );
        let mut updated = status.clone();
        updated.state = RemediationState::Failed;
        updated.reason = "Recreate remediation is not implemented".to_string();
        updated.end_time = Some(Utc::now());
        self.write_status(remediation, namespace, name, updated)
            .await?;
        Ok(Action::await_change())
    }

    /// Resolves the host bound to the machine through its host annotation.
    async fn host_for(&self, machine: &Machine) -> Result<BareMetalHost, ControllerError> {
        let Some(key) = machine.host_key() else {
            return Err(ControllerError::MissingHostAnnotation(machine.name_any()));
        };
        let (host_namespace, host_name) = split_namespaced_key(key)
            .ok_or_else(|| ControllerError::MalformedKey(key.to_string()))?;
        Ok(self.hosts(host_namespace).get(host_name).await?)
    }

    /// Readiness of the node backing the machine. `None` while the machine
    /// has no node ref or the node is gone: it has not rejoined yet.
    async fn node_readiness(&self, machine: &Machine) -> Result<Option<bool>, ControllerError> {
        let Some(node_ref) = machine.status.as_ref().and_then(|s| s.node_ref.as_ref()) else {
            return Ok(None);
        };
        match self.nodes().get_opt(&node_ref.name).await? {
            None => {
                warn!("The machine {} node does not exist", machine.name_any());
                Ok(None)
            }
            Some(node) => Ok(Some(node_is_ready(&node))),
        }
    }

    async fn delete_machine_node(&self, machine: &Machine) -> Result<(), ControllerError> {
        let Some(node_ref) = machine.status.as_ref().and_then(|s| s.node_ref.as_ref()) else {
            warn!("The machine {} node does not exist", machine.name_any());
            return Ok(());
        };
        match self
            .nodes()
            .delete(&node_ref.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes the reboot annotation from the machine's node so a future
    /// remediation may trigger again.
    async fn clear_node_reboot_annotation(
        &self,
        machine: &Machine,
    ) -> Result<(), ControllerError> {
        let Some(node_ref) = machine.status.as_ref().and_then(|s| s.node_ref.as_ref()) else {
            return Ok(());
        };
        let Some(node) = self.nodes().get_opt(&node_ref.name).await? else {
            return Ok(());
        };
        let has_annotation = node
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|annotations| annotations.contains_key(NODE_REBOOT_ANNOTATION));
        if !has_annotation {
            return Ok(());
        }
        let mut updated = node.clone();
        if let Some(annotations) = updated.metadata.annotations.as_mut() {
            annotations.remove(NODE_REBOOT_ANNOTATION);
        }
        self.nodes()
            .replace(&node_ref.name, &PostParams::default(), &updated)
            .await?;
        Ok(())
    }

    /// Desired-state writes on the host go through a copy of the observed
    /// object.
    async fn write_host(
        &self,
        observed: &BareMetalHost,
        updated: BareMetalHost,
        fallback_namespace: &str,
    ) -> Result<(), ControllerError> {
        let namespace = observed
            .namespace()
            .unwrap_or_else(|| fallback_namespace.to_string());
        self.hosts(&namespace)
            .replace(&observed.name_any(), &PostParams::default(), &updated)
            .await?;
        Ok(())
    }

    /// Status writes go through a copy as well; the observed record is
    /// never mutated in place.
    async fn write_status(
        &self,
        remediation: &MachineRemediation,
        namespace: &str,
        name: &str,
        status: MachineRemediationStatus,
    ) -> Result<(), ControllerError> {
        let mut updated = remediation.clone();
        updated.status = Some(status);
        self.remediations(namespace)
            .replace_status(name, &PostParams::default(), serde_json::to_vec(&updated)?)
            .await?;
        Ok(())
    }

    async fn emit(&self, machine: &Machine, event_type: EventType, reason: &str, note: String) {
        let reference = machine.object_ref(&());
        let event = Event {
            type_: event_type,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reboot".to_string(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, &reference).await {
            warn!("Failed to publish event {}: {}", reason, err);
        }
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}
