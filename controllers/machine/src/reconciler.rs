//! Host claim reconciliation.
//!
//! Binds each machine to exactly one available host, drives the host's
//! desired state while bound, and releases the host again when the machine
//! is deleted. The binding state is derived fresh on every tick from the
//! host annotation and the host's consumer ref; nothing is stored.

use std::sync::Mutex;
use std::time::Duration;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use chrono::Utc;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use kube_runtime::controller::Action;
use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, info, warn};

use crds::{
    split_namespaced_key, BareMetalHost, CompiledSelector, ConsumerReference, Machine,
    MachineErrorReason, NodeAddress, NodeAddressType, SecretReference, HOST_ANNOTATION,
    MACHINE_FINALIZER,
};

use backoff::BackoffTracker;

use crate::error::ControllerError;
use crate::userdata;

/// How long to wait before rechecking when no host is available or a bound
/// host is still deprovisioning.
pub const REQUEUE_DELAY: Duration = Duration::from_secs(30);

/// Reconciles machines against the host inventory.
pub struct Reconciler {
    client: Client,
    rng: Mutex<StdRng>,
    pub(crate) backoff: BackoffTracker,
}

impl Reconciler {
    /// Creates a new reconciler. The random source drives host selection;
    /// tests inject a seeded one.
    pub fn new(client: Client, rng: StdRng) -> Self {
        Self {
            client,
            rng: Mutex::new(rng),
            backoff: BackoffTracker::new(),
        }
    }

    fn machines(&self, namespace: &str) -> Api<Machine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn hosts(&self, namespace: &str) -> Api<BareMetalHost> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Reconciles one machine.
    pub async fn reconcile_machine(&self, machine: &Machine) -> Result<Action, ControllerError> {
        let name = machine.name_any();
        let namespace = machine.namespace().unwrap_or_else(|| "default".to_string());

        if machine.meta().deletion_timestamp.is_some() {
            info!("Releasing machine {}/{}", namespace, name);
            return self.release(machine, &namespace, &name).await;
        }
        self.claim(machine, &namespace, &name).await
    }

    async fn claim(
        &self,
        machine: &Machine,
        namespace: &str,
        name: &str,
    ) -> Result<Action, ControllerError> {
        // the finalizer must be in place before any host mutation, so a
        // concurrent delete can always unwind the binding
        if !machine.finalizers().iter().any(|f| f == MACHINE_FINALIZER) {
            let mut updated = machine.clone();
            updated
                .meta_mut()
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(MACHINE_FINALIZER.to_string());
            self.machines(namespace)
                .replace(name, &PostParams::default(), &updated)
                .await?;
            return Ok(Action::requeue(Duration::ZERO));
        }

        let problems = machine.spec.provider_spec.validate();
        if !problems.is_empty() {
            warn!(
                "Machine {}/{} has an invalid provider spec: {}",
                namespace,
                name,
                problems.join(", ")
            );
            self.set_error(machine, namespace, name, problems.join(", "))
                .await?;
            return Ok(Action::await_change());
        }

        // a previously recorded error no longer applies; clear it and let
        // the cleared status land before doing more work
        let has_error = machine
            .status
            .as_ref()
            .is_some_and(|s| s.error_reason.is_some() || s.error_message.is_some());
        if has_error {
            self.clear_error(machine, namespace, name).await?;
            return Ok(Action::requeue(Duration::ZERO));
        }

        let mut machine = machine.clone();
        let host = match self.annotated_host(&machine).await? {
            Some(host) => {
                debug!(
                    "Machine {}/{} already associated with host {}",
                    namespace,
                    name,
                    host.name_any()
                );
                host
            }
            None => match self.choose_host(&machine, namespace).await? {
                Some(host) => {
                    info!(
                        "Associating machine {}/{} with host {}",
                        namespace,
                        name,
                        host.name_any()
                    );
                    machine = self
                        .ensure_annotation(machine, &host, namespace, name)
                        .await?;
                    host
                }
                None => {
                    info!(
                        "No available host found for machine {}/{}, requeuing",
                        namespace, name
                    );
                    return Ok(Action::requeue(REQUEUE_DELAY));
                }
            },
        };

        let user_data = match self.ensure_user_data(&machine, namespace).await {
            Ok(reference) => reference,
            Err(ControllerError::UserData(err)) => {
                warn!("Machine {}/{} user data rejected: {}", namespace, name, err);
                self.set_error(&machine, namespace, name, err.to_string())
                    .await?;
                return Ok(Action::await_change());
            }
            Err(ControllerError::Bootstrap(err)) => {
                self.set_error(
                    &machine,
                    namespace,
                    name,
                    format!("bootstrap data is not valid base64: {err}"),
                )
                .await?;
                return Ok(Action::await_change());
            }
            Err(other) => return Err(other),
        };

        let host = self.set_host_spec(host, &machine, user_data).await?;
        let machine = self.ensure_provider_id(machine, namespace, name).await?;
        self.update_status(&machine, &host, namespace, name).await?;

        debug!("Finished reconciling machine {}/{}", namespace, name);
        Ok(Action::await_change())
    }

    /// Releases the host bound to a deleted machine, then drops the
    /// finalizer. A missing host at any step is not an error: the host is
    /// simply already gone.
    async fn release(
        &self,
        machine: &Machine,
        namespace: &str,
        name: &str,
    ) -> Result<Action, ControllerError> {
        if !machine.finalizers().iter().any(|f| f == MACHINE_FINALIZER) {
            return Ok(Action::await_change());
        }

        let Some(host) = self.annotated_host(machine).await? else {
            self.remove_finalizer(machine, namespace, name).await?;
            return Ok(Action::await_change());
        };

        match &host.spec.consumer_ref {
            None => {
                self.remove_finalizer(machine, namespace, name).await?;
                return Ok(Action::await_change());
            }
            Some(consumer) if !consumer_ref_matches(consumer, machine) => {
                info!(
                    "Host {} associated with machine {}, not {}/{}; leaving it alone",
                    host.name_any(),
                    consumer.name,
                    namespace,
                    name
                );
                self.remove_finalizer(machine, namespace, name).await?;
                return Ok(Action::await_change());
            }
            Some(_) => {}
        }

        let host_namespace = host.namespace().unwrap_or_else(|| namespace.to_string());
        let host_name = host.name_any();

        if host.spec.image.is_some() || host.spec.user_data.is_some() || host.spec.online {
            info!(
                "Deprovisioning host {} bound to machine {}/{}",
                host_name, namespace, name
            );
            let mut updated = host.clone();
            updated.spec.image = None;
            updated.spec.user_data = None;
            updated.spec.online = false;
            if let Err(err) = self
                .hosts(&host_namespace)
                .replace(&host_name, &PostParams::default(), &updated)
                .await
            {
                if !is_not_found(&err) {
                    return Err(err.into());
                }
            }
            return Ok(Action::requeue(Duration::ZERO));
        }

        if host.needs_deprovision_wait() {
            debug!("Waiting for host {} to deprovision", host_name);
            return Ok(Action::requeue(REQUEUE_DELAY));
        }

        let mut updated = host.clone();
        updated.spec.consumer_ref = None;
        if let Err(err) = self
            .hosts(&host_namespace)
            .replace(&host_name, &PostParams::default(), &updated)
            .await
        {
            if !is_not_found(&err) {
                return Err(err.into());
            }
        }
        self.remove_finalizer(machine, namespace, name).await?;
        info!("Finished releasing machine {}/{}", namespace, name);
        Ok(Action::await_change())
    }

    /// Resolves the host recorded in the machine's annotation. A missing
    /// host is treated as unbound; the stale annotation is overwritten once
    /// a new host is chosen.
    async fn annotated_host(
        &self,
        machine: &Machine,
    ) -> Result<Option<BareMetalHost>, ControllerError> {
        let Some(key) = machine.host_key() else {
            return Ok(None);
        };
        let (host_namespace, host_name) =
            split_namespaced_key(key).ok_or_else(|| ControllerError::MalformedHostKey {
                machine: machine.name_any(),
                value: key.to_string(),
            })?;
        match self.hosts(host_namespace).get_opt(host_name).await? {
            Some(host) => Ok(Some(host)),
            None => {
                warn!("Annotated host {} not found", key);
                Ok(None)
            }
        }
    }

    async fn choose_host(
        &self,
        machine: &Machine,
        namespace: &str,
    ) -> Result<Option<BareMetalHost>, ControllerError> {
        let selector = machine.spec.provider_spec.host_selector.compile()?;
        let hosts = self.hosts(namespace).list(&ListParams::default()).await?;
        let chosen = {
            let mut rng = match self.rng.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            pick_host(machine, &hosts.items, &selector, &mut *rng)
        };
        Ok(chosen.cloned())
    }

    /// Records the chosen host in the machine's annotation, overwriting a
    /// stray value left behind by an earlier binding.
    async fn ensure_annotation(
        &self,
        machine: Machine,
        host: &BareMetalHost,
        namespace: &str,
        name: &str,
    ) -> Result<Machine, ControllerError> {
        let host_key = format!(
            "{}/{}",
            host.namespace().unwrap_or_else(|| namespace.to_string()),
            host.name_any()
        );
        if machine.host_key() == Some(host_key.as_str()) {
            return Ok(machine);
        }
        if let Some(existing) = machine.host_key() {
            warn!(
                "Found stray host annotation {:?} on machine {}/{}, overwriting",
                existing, namespace, name
            );
        }
        let mut updated = machine;
        updated
            .meta_mut()
            .annotations
            .get_or_insert_with(Default::default)
            .insert(HOST_ANNOTATION.to_string(), host_key);
        Ok(self
            .machines(namespace)
            .replace(name, &PostParams::default(), &updated)
            .await?)
    }

    /// Resolves the user-data secret the host should consume. With bootstrap
    /// data present the merged document is materialized first; otherwise the
    /// provider-spec reference is used directly with its namespace defaulted.
    async fn ensure_user_data(
        &self,
        machine: &Machine,
        namespace: &str,
    ) -> Result<Option<SecretReference>, ControllerError> {
        let Some(input) = &machine.spec.provider_spec.user_data else {
            return Ok(None);
        };
        let bootstrap = machine.spec.bootstrap.as_ref().and_then(|b| b.data.as_deref());
        let Some(bootstrap) = bootstrap else {
            return Ok(Some(SecretReference {
                name: input.name.clone(),
                namespace: Some(
                    input
                        .namespace
                        .clone()
                        .unwrap_or_else(|| namespace.to_string()),
                ),
            }));
        };

        debug!(
            "Bootstrap data available for machine {}/{}, merging user data",
            namespace,
            machine.name_any()
        );
        let decoded = BASE64_STANDARD.decode(bootstrap)?;
        let payload = userdata::merge_user_data(&self.client, namespace, input, &decoded).await?;
        let reference = userdata::apply_user_data_secret(&self.client, machine, payload).await?;
        Ok(Some(reference))
    }

    /// Ensures the host's desired state reflects the machine. The image is
    /// write-once: a host that already carries one is provisioned, and
    /// upgrades go through a full deprovision instead.
    async fn set_host_spec(
        &self,
        host: BareMetalHost,
        machine: &Machine,
        user_data: Option<SecretReference>,
    ) -> Result<BareMetalHost, ControllerError> {
        let mut updated = host.clone();
        if updated.spec.image.is_none() {
            updated.spec.image = Some(machine.spec.provider_spec.image.clone());
            updated.spec.user_data = user_data;
        }
        updated.spec.consumer_ref = Some(ConsumerReference {
            kind: Machine::kind(&()).into_owned(),
            name: machine.name_any(),
            namespace: machine.namespace().unwrap_or_default(),
            api_version: Machine::api_version(&()).into_owned(),
        });
        updated.spec.online = true;

        if updated.spec == host.spec {
            return Ok(host);
        }
        let namespace = host.namespace().unwrap_or_default();
        Ok(self
            .hosts(&namespace)
            .replace(&host.name_any(), &PostParams::default(), &updated)
            .await?)
    }

    /// Writes the stable provider identifier once binding has succeeded.
    async fn ensure_provider_id(
        &self,
        machine: Machine,
        namespace: &str,
        name: &str,
    ) -> Result<Machine, ControllerError> {
        if machine.spec.provider_id.is_some() {
            return Ok(machine);
        }
        let provider_id = format!("baremetal:////{}-{}", machine.cluster_name(), name);
        info!(
            "Setting provider ID {} on machine {}/{}",
            provider_id, namespace, name
        );
        let mut updated = machine;
        updated.spec.provider_id = Some(provider_id);
        Ok(self
            .machines(namespace)
            .replace(name, &PostParams::default(), &updated)
            .await?)
    }

    /// Derives the machine status from the host and persists it only when
    /// something actually changed.
    async fn update_status(
        &self,
        machine: &Machine,
        host: &BareMetalHost,
        namespace: &str,
        name: &str,
    ) -> Result<(), ControllerError> {
        let mut status = machine.status.clone().unwrap_or_default();
        status.addresses = node_addresses(host);
        status.user_data = host.spec.user_data.clone();
        if machine.status.as_ref() == Some(&status) {
            return Ok(());
        }
        status.last_updated = Some(Utc::now());
        let mut updated = machine.clone();
        updated.status = Some(status);
        self.machines(namespace)
            .replace_status(name, &PostParams::default(), serde_json::to_vec(&updated)?)
            .await?;
        Ok(())
    }

    async fn set_error(
        &self,
        machine: &Machine,
        namespace: &str,
        name: &str,
        message: String,
    ) -> Result<(), ControllerError> {
        let mut status = machine.status.clone().unwrap_or_default();
        if status.error_reason == Some(MachineErrorReason::InvalidConfiguration)
            && status.error_message.as_deref() == Some(message.as_str())
        {
            return Ok(());
        }
        status.error_reason = Some(MachineErrorReason::InvalidConfiguration);
        status.error_message = Some(message);
        status.last_updated = Some(Utc::now());
        let mut updated = machine.clone();
        updated.status = Some(status);
        self.machines(namespace)
            .replace_status(name, &PostParams::default(), serde_json::to_vec(&updated)?)
            .await?;
        Ok(())
    }

    async fn clear_error(
        &self,
        machine: &Machine,
        namespace: &str,
        name: &str,
    ) -> Result<(), ControllerError> {
        let mut status = machine.status.clone().unwrap_or_default();
        status.error_reason = None;
        status.error_message = None;
        status.last_updated = Some(Utc::now());
        let mut updated = machine.clone();
        updated.status = Some(status);
        self.machines(namespace)
            .replace_status(name, &PostParams::default(), serde_json::to_vec(&updated)?)
            .await?;
        info!("Cleared error message from machine {}/{}", namespace, name);
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        machine: &Machine,
        namespace: &str,
        name: &str,
    ) -> Result<(), ControllerError> {
        let mut updated = machine.clone();
        let Some(finalizers) = updated.meta_mut().finalizers.as_mut() else {
            return Ok(());
        };
        finalizers.retain(|f| f != MACHINE_FINALIZER);
        self.machines(namespace)
            .replace(name, &PostParams::default(), &updated)
            .await?;
        Ok(())
    }
}

/// Chooses a host for the machine. A host already naming the machine in its
/// consumer ref wins outright (recovery after a lost annotation); otherwise
/// one of the available matching hosts is picked uniformly at random.
pub(crate) fn pick_host<'a>(
    machine: &Machine,
    hosts: &'a [BareMetalHost],
    selector: &CompiledSelector,
    rng: &mut impl Rng,
) -> Option<&'a BareMetalHost> {
    let mut available = Vec::new();
    for host in hosts {
        if host.available() {
            if selector.matches(host.labels()) {
                available.push(host);
            } else {
                debug!(
                    "Host {} did not match the selector for machine {}",
                    host.name_any(),
                    machine.name_any()
                );
            }
        } else if host
            .spec
            .consumer_ref
            .as_ref()
            .is_some_and(|consumer| consumer_ref_matches(consumer, machine))
        {
            debug!("Found host {} with existing consumer ref", host.name_any());
            return Some(host);
        }
    }
    debug!(
        "{} hosts available while choosing for machine {}",
        available.len(),
        machine.name_any()
    );
    if available.is_empty() {
        return None;
    }
    Some(available[rng.gen_range(0..available.len())])
}

/// Whether the consumer ref and the machine identity agree.
pub(crate) fn consumer_ref_matches(consumer: &ConsumerReference, machine: &Machine) -> bool {
    consumer.kind == Machine::kind(&()).as_ref()
        && consumer.name == machine.name_any()
        && machine.namespace().as_deref() == Some(consumer.namespace.as_str())
        && consumer.api_version == Machine::api_version(&()).as_ref()
}

/// Derives machine addresses from the host's hardware details: one
/// InternalIP per NIC, plus Hostname and InternalDNS entries when a
/// hostname was discovered.
pub(crate) fn node_addresses(host: &BareMetalHost) -> Vec<NodeAddress> {
    let mut addresses = Vec::new();
    let Some(hardware) = host.status.as_ref().and_then(|s| s.hardware.as_ref()) else {
        return addresses;
    };
    for nic in &hardware.nics {
        addresses.push(NodeAddress {
            address_type: NodeAddressType::InternalIP,
            address: nic.ip.clone(),
        });
    }
    if !hardware.hostname.is_empty() {
        addresses.push(NodeAddress {
            address_type: NodeAddressType::Hostname,
            address: hardware.hostname.clone(),
        });
        addresses.push(NodeAddress {
            address_type: NodeAddressType::InternalDNS,
            address: hardware.hostname.clone(),
        });
    }
    addresses
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}
