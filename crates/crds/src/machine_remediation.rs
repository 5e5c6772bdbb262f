//! MachineRemediation CRD
//!
//! Workflow record coordinating a forced reboot of the host behind an
//! unresponsive machine. Created by the node-reboot watcher, driven by the
//! remediation state machine, self-deleted on success.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation on a Node requesting a remediation reboot. The value is
/// ignored; presence is what matters.
pub const NODE_REBOOT_ANNOTATION: &str = "healthchecking.openshift.io/machine-remediation-reboot";

/// Annotation on a Node naming its owning machine as `"<ns>/<name>"`.
pub const NODE_MACHINE_ANNOTATION: &str = "machine.openshift.io/machine";

/// Annotation on a host marking a remediation-initiated power-off, so it can
/// be told apart from an operator-initiated one. The value is exactly "true".
pub const REBOOT_IN_PROGRESS_ANNOTATION: &str = "machineremediation.kubevirt.io/rebootInProgress";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "machineremediation.kubevirt.io",
    version = "v1alpha1",
    kind = "MachineRemediation",
    namespaced,
    status = "MachineRemediationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineRemediationSpec {
    /// Name of the machine to remediate, in the same namespace
    pub machine_name: String,

    /// Remediation strategy
    #[serde(rename = "type")]
    pub remediation_type: RemediationType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum RemediationType {
    Reboot,
    Recreate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineRemediationStatus {
    /// Current workflow state
    #[serde(default)]
    pub state: RemediationState,

    /// When the workflow started; timeouts are measured from here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// Set exactly once, on entering a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Human-readable description of the last transition
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum RemediationState {
    #[default]
    Started,
    PowerOff,
    PowerOn,
    Succeeded,
    Failed,
}

impl RemediationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RemediationState::Succeeded | RemediationState::Failed)
    }
}

impl MachineRemediation {
    /// A remediation is active while it has neither reached a terminal state
    /// nor recorded an end time. A record without status is active: the state
    /// machine has simply not picked it up yet.
    pub fn is_active(&self) -> bool {
        match &self.status {
            None => true,
            Some(status) => !status.state.is_terminal() && status.end_time.is_none(),
        }
    }
}
