//! Cross-resource reference types shared by the bare-metal CRDs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to a Secret holding a user-data payload.
///
/// The namespace is optional; consumers default it to the namespace of the
/// referencing machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Name of the referenced Secret
    pub name: String,

    /// Namespace of the referenced Secret (defaults to the machine's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Records which object consumes a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerReference {
    /// Kind of the consuming resource (e.g. "Machine")
    pub kind: String,

    /// Name of the consuming resource
    pub name: String,

    /// Namespace of the consuming resource
    pub namespace: String,

    /// API version of the consuming resource
    pub api_version: String,
}

/// Reference to the cluster Node backing a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeReference {
    /// Name of the Node object
    pub name: String,

    /// Namespace of the Node object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A network address reported for a machine, derived from the hardware
/// details of its host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeAddress {
    /// Address class
    #[serde(rename = "type")]
    pub address_type: NodeAddressType,

    /// The address value
    pub address: String,
}

/// Address classes mirroring the cluster Node address types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum NodeAddressType {
    InternalIP,
    InternalDNS,
    Hostname,
}

/// Splits a `"<namespace>/<name>"` key as stored in annotations.
///
/// Returns `None` when the value does not contain exactly one separator or
/// either side is empty.
pub fn split_namespaced_key(key: &str) -> Option<(&str, &str)> {
    let (namespace, name) = key.split_once('/')?;
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((namespace, name))
}
