//! Cloud-init user-data merging.
//!
//! A machine's bootstrap payload may be combined with operator-supplied
//! fragments referenced from the provider spec. Documents merge key by key:
//! sequences concatenate, mappings must stay disjoint, and a scalar present
//! on both sides is a conflict rather than a silent override.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::info;

use crds::{Machine, SecretReference, UserDataInput};

use crate::error::ControllerError;

/// Literal first line of every rendered cloud-init document.
pub const CLOUD_CONFIG_HEADER: &str = "#cloud-config\n";

/// Key under which user-data secrets carry their payload.
pub const USER_DATA_KEY: &str = "userData";

/// Errors raised while fetching or merging user data.
#[derive(Debug, Error)]
pub enum UserDataError {
    /// The same key holds different kinds of values on the two sides
    #[error("types not matching for key {0:?}")]
    TypeMismatch(String),

    /// A key may not be defined by both sides
    #[error("duplicated key {0:?}")]
    DuplicateKey(String),

    /// The referenced secret lacks a userData field
    #[error("no userData field in secret {0}")]
    MissingPayload(String),

    /// Only cloud-init user data can be merged
    #[error("unknown user data type {0:?}")]
    UnknownType(String),

    /// The document root must be a mapping
    #[error("user data is not a YAML mapping")]
    NotAMapping,

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Where an overlay lands relative to the base document: appended overlay
/// sequences follow base sequences, prepended ones precede them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOrder {
    Append,
    Prepend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentKind {
    Scalar,
    Sequence,
    Mapping,
}

fn kind_of(value: &Value) -> DocumentKind {
    match value {
        Value::Sequence(_) => DocumentKind::Sequence,
        Value::Mapping(_) => DocumentKind::Mapping,
        _ => DocumentKind::Scalar,
    }
}

fn display_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Parses a user-data payload into its root mapping. The `#cloud-config`
/// marker is a YAML comment and passes through the parser untouched.
pub fn parse_document(payload: &[u8]) -> Result<Mapping, UserDataError> {
    match serde_yaml::from_slice(payload)? {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Ok(Mapping::new()),
        _ => Err(UserDataError::NotAMapping),
    }
}

/// Serializes a merged document back to bytes with the cloud-config marker
/// restored as the first line.
pub fn render_document(document: &Mapping) -> Result<Vec<u8>, UserDataError> {
    let body = serde_yaml::to_string(&Value::Mapping(document.clone()))?;
    Ok(format!("{CLOUD_CONFIG_HEADER}{body}").into_bytes())
}

/// Merges an overlay document into a base document.
pub fn merge_documents(
    base: &Mapping,
    overlay: &Mapping,
    order: MergeOrder,
) -> Result<Mapping, UserDataError> {
    match order {
        MergeOrder::Append => merge_into(base, overlay),
        MergeOrder::Prepend => merge_into(overlay, base),
    }
}

fn merge_into(first: &Mapping, second: &Mapping) -> Result<Mapping, UserDataError> {
    let mut output = Mapping::new();
    for (key, first_value) in first {
        let merged = match second.get(key) {
            None => first_value.clone(),
            Some(second_value) => {
                if kind_of(first_value) != kind_of(second_value) {
                    return Err(UserDataError::TypeMismatch(display_key(key)));
                }
                match (first_value, second_value) {
                    (Value::Sequence(head), Value::Sequence(tail)) => {
                        let mut joined = head.clone();
                        joined.extend(tail.iter().cloned());
                        Value::Sequence(joined)
                    }
                    (Value::Mapping(a), Value::Mapping(b)) => Value::Mapping(merge_disjoint(a, b)?),
                    // two scalars: there is no override
                    _ => return Err(UserDataError::DuplicateKey(display_key(key))),
                }
            }
        };
        output.insert(key.clone(), merged);
    }
    for (key, second_value) in second {
        if !first.contains_key(key) {
            output.insert(key.clone(), second_value.clone());
        }
    }
    Ok(output)
}

fn merge_disjoint(first: &Mapping, second: &Mapping) -> Result<Mapping, UserDataError> {
    let mut output = first.clone();
    for (key, value) in second {
        if output.contains_key(key) {
            return Err(UserDataError::DuplicateKey(display_key(key)));
        }
        output.insert(key.clone(), value.clone());
    }
    Ok(output)
}

/// Fetches and parses the payload of a referenced user-data secret,
/// defaulting its namespace to the machine's.
async fn fetch_payload(
    client: &Client,
    default_namespace: &str,
    reference: &SecretReference,
) -> Result<Mapping, ControllerError> {
    let namespace = reference.namespace.as_deref().unwrap_or(default_namespace);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = secrets.get(&reference.name).await?;
    let payload = secret
        .data
        .and_then(|mut data| data.remove(USER_DATA_KEY))
        .ok_or_else(|| UserDataError::MissingPayload(reference.name.clone()))?;
    Ok(parse_document(&payload.0)?)
}

/// Builds the merged cloud-init payload for a machine: the decoded
/// bootstrap document with the append and prepend fragments folded in.
pub async fn merge_user_data(
    client: &Client,
    machine_namespace: &str,
    input: &UserDataInput,
    bootstrap: &[u8],
) -> Result<Vec<u8>, ControllerError> {
    if let Some(merge_type) = input.merge_type.as_deref() {
        if merge_type != "cloud-init" {
            return Err(UserDataError::UnknownType(merge_type.to_string()).into());
        }
    }

    let mut document = parse_document(bootstrap)?;
    if let Some(append) = &input.append {
        let overlay = fetch_payload(client, machine_namespace, append).await?;
        document = merge_documents(&document, &overlay, MergeOrder::Append)?;
    }
    if let Some(prepend) = &input.prepend {
        let overlay = fetch_payload(client, machine_namespace, prepend).await?;
        document = merge_documents(&document, &overlay, MergeOrder::Prepend)?;
    }

    Ok(render_document(&document)?)
}

/// Materializes the merged payload as the machine's `<name>-user-data`
/// secret, creating or replacing it as needed.
pub async fn apply_user_data_secret(
    client: &Client,
    machine: &Machine,
    payload: Vec<u8>,
) -> Result<SecretReference, ControllerError> {
    let name = format!("{}-user-data", machine.name_any());
    let namespace = machine.namespace().unwrap_or_else(|| "default".to_string());

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            USER_DATA_KEY.to_string(),
            ByteString(payload),
        )])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };

    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    match secrets.get_opt(&name).await? {
        None => {
            info!("Creating user data secret {}/{}", namespace, name);
            secrets.create(&PostParams::default(), &secret).await?;
        }
        Some(existing) => {
            let mut replacement = secret;
            replacement.metadata.resource_version = existing.metadata.resource_version;
            secrets
                .replace(&name, &PostParams::default(), &replacement)
                .await?;
        }
    }

    Ok(SecretReference {
        name,
        namespace: Some(namespace),
    })
}
