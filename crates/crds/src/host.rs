//! BareMetalHost CRD
//!
//! Represents one physical machine. The claim engine mutates only the
//! desired half of the resource (image, user data, power, consumer ref);
//! the observed half is reported by a separate per-host driver.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::references::{ConsumerReference, SecretReference};

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "metal3.io",
    version = "v1alpha1",
    kind = "BareMetalHost",
    namespaced,
    status = "BareMetalHostStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BareMetalHostSpec {
    /// Desired power state
    #[serde(default)]
    pub online: bool,

    /// Image to provision onto the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,

    /// Secret holding the user data handed to the provisioner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<SecretReference>,

    /// The machine currently consuming this host, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_ref: Option<ConsumerReference>,
}

/// A provisionable OS image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// URL of the image to provision
    pub url: String,

    /// URL of the image checksum
    pub checksum: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BareMetalHostStatus {
    /// Provisioning progress reported by the host driver
    #[serde(default)]
    pub provisioning: ProvisioningStatus,

    /// Observed power state
    #[serde(default)]
    pub powered_on: bool,

    /// Hardware inventory discovered during inspection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareDetails>,

    /// Last error reported by the host driver, empty when healthy
    #[serde(default)]
    pub error_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningStatus {
    #[serde(default)]
    pub state: ProvisioningState,
}

/// Provisioning states reported by the host driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ProvisioningState {
    /// The driver has not reported yet
    #[default]
    #[serde(rename = "")]
    None,

    #[serde(rename = "registering")]
    Registering,

    #[serde(rename = "registration error")]
    RegistrationError,

    #[serde(rename = "match profile")]
    MatchProfile,

    #[serde(rename = "inspecting")]
    Inspecting,

    #[serde(rename = "ready")]
    Ready,

    #[serde(rename = "available")]
    Available,

    #[serde(rename = "validation error")]
    ValidationError,

    #[serde(rename = "provisioning")]
    Provisioning,

    #[serde(rename = "provisioned")]
    Provisioned,

    #[serde(rename = "externally provisioned")]
    ExternallyProvisioned,

    #[serde(rename = "deprovisioning")]
    Deprovisioning,

    #[serde(rename = "deleting")]
    Deleting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HardwareDetails {
    /// Hostname discovered during inspection
    #[serde(default)]
    pub hostname: String,

    /// Network interfaces discovered during inspection
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nics: Vec<Nic>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Nic {
    /// IP address configured on the interface
    #[serde(default)]
    pub ip: String,
}

impl BareMetalHost {
    /// A host is available for claiming when it reports ready with no error
    /// and nothing consumes it yet.
    pub fn available(&self) -> bool {
        if self.spec.consumer_ref.is_some() {
            return false;
        }
        let Some(status) = &self.status else {
            return false;
        };
        if !status.error_message.is_empty() {
            return false;
        }
        matches!(
            status.provisioning.state,
            ProvisioningState::Ready | ProvisioningState::Available
        )
    }

    /// Whether machine deletion must wait for the host driver before the
    /// consumer ref may be cleared.
    ///
    /// Hosts that never got provisioned release immediately. Externally
    /// provisioned hosts are only ours to power down, so they release once
    /// power-off is observed. Everything else waits for deprovisioning.
    pub fn needs_deprovision_wait(&self) -> bool {
        let Some(status) = &self.status else {
            return true;
        };
        match status.provisioning.state {
            ProvisioningState::Registering
            | ProvisioningState::RegistrationError
            | ProvisioningState::MatchProfile
            | ProvisioningState::Inspecting
            | ProvisioningState::Ready
            | ProvisioningState::ValidationError => false,
            ProvisioningState::ExternallyProvisioned => status.powered_on,
            _ => true,
        }
    }
}
