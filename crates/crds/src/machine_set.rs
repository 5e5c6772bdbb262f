//! MachineSet CRD
//!
//! A machine template plus replica count describing a fleet. MachineSets
//! carrying the autoscale annotation have their replica count driven to the
//! number of hosts matching the template's host selector.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::machine::MachineSpec;
use crate::selector::HostSelector;

/// Annotation opting a MachineSet into host-count autoscaling. The value is
/// ignored; presence is what matters.
pub const AUTOSCALE_ANNOTATION: &str = "metal3.io/autoscale-to-hosts";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "MachineSet",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetSpec {
    /// Desired number of machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Selects the machines owned by this set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<HostSelector>,

    /// Template stamped out for each machine
    pub template: MachineTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplate {
    pub spec: MachineSpec,
}

impl MachineSet {
    /// Whether this set opted into host-count autoscaling.
    pub fn autoscaling_enabled(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .is_some_and(|annotations| annotations.contains_key(AUTOSCALE_ANNOTATION))
    }
}
