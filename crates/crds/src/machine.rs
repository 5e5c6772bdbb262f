//! Machine CRD
//!
//! The declarative request to provision one compute node. The claim engine
//! binds each machine to exactly one available host, recorded through the
//! host annotation on the machine and the consumer ref on the host.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::host::Image;
use crate::references::{NodeAddress, NodeReference, SecretReference};
use crate::selector::HostSelector;

/// Annotation on a Machine recording the claimed host as `"<ns>/<name>"`.
pub const HOST_ANNOTATION: &str = "metal3.io/BareMetalHost";

/// Finalizer guarding machine removal until its host is released.
pub const MACHINE_FINALIZER: &str = "machine.cluster.k8s.io";

/// Label carrying the name of the cluster a machine belongs to.
pub const CLUSTER_NAME_LABEL: &str = "cluster.k8s.io/cluster-name";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Machine",
    namespaced,
    status = "MachineStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Provider-specific provisioning parameters
    pub provider_spec: MachineProviderSpec,

    /// Bootstrap payload produced by the bootstrap provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<Bootstrap>,

    /// Role of the node this machine backs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<MachineRole>,

    /// Stable provider identifier, `baremetal:////<cluster>-<machine>`,
    /// written once binding succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineProviderSpec {
    /// Image to be provisioned
    pub image: Image,

    /// User data handed to the host, with optional fragments to merge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<UserDataInput>,

    /// Limits which hosts are considered for claiming
    #[serde(default)]
    pub host_selector: HostSelector,
}

/// User data given as a secret reference plus optional fragments merged
/// around the bootstrap payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserDataInput {
    /// Name of the Secret holding the base user data
    pub name: String,

    /// Namespace of the Secret (defaults to the machine's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Format of the user data; only "cloud-init" is supported
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub merge_type: Option<String>,

    /// Fragment appended after the bootstrap payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append: Option<SecretReference>,

    /// Fragment prepended before the bootstrap payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepend: Option<SecretReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    /// Base64-encoded bootstrap payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum MachineRole {
    ControlPlane,
    Worker,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Addresses derived from the claimed host's hardware details
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<NodeAddress>,

    /// Cluster node backing this machine, set by the node controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<NodeReference>,

    /// Terminal error class, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<MachineErrorReason>,

    /// Human-readable error detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Secret holding the merged user data handed to the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<SecretReference>,

    /// When the status last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum MachineErrorReason {
    InvalidConfiguration,
}

impl MachineProviderSpec {
    /// Returns the problems with the spec, suitable for a status message.
    /// Empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.image.url.is_empty() {
            problems.push("image.url is empty".to_string());
        }
        if self.image.checksum.is_empty() {
            problems.push("image.checksum is empty".to_string());
        }
        if let Some(user_data) = &self.user_data {
            if let Some(merge_type) = &user_data.merge_type {
                if merge_type != "cloud-init" {
                    problems.push(format!("userData.type {merge_type:?} is not \"cloud-init\""));
                }
            }
            if user_data.append.as_ref().is_some_and(|r| r.name.is_empty()) {
                problems.push("userData.append.name is empty".to_string());
            }
            if user_data.prepend.as_ref().is_some_and(|r| r.name.is_empty()) {
                problems.push("userData.prepend.name is empty".to_string());
            }
        }
        problems
    }
}

impl Machine {
    /// The `"<ns>/<name>"` host key recorded by the claim engine, if any.
    pub fn host_key(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(HOST_ANNOTATION))
            .map(String::as_str)
    }

    /// Name of the cluster this machine belongs to, falling back to the
    /// machine's namespace when unlabeled.
    pub fn cluster_name(&self) -> &str {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(CLUSTER_NAME_LABEL))
            .or(self.metadata.namespace.as_ref())
            .map(String::as_str)
            .unwrap_or("default")
    }
}
