//! Reconciliation logic for autoscaled MachineSets.
//!
//! A MachineSet carrying the autoscale annotation has its replica count
//! driven to the number of hosts in its namespace whose labels satisfy the
//! template's host selector.

use backoff::BackoffTracker;
use kube::api::{Api, ListParams, PostParams};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use tracing::{debug, info, warn};

use crds::{BareMetalHost, CompiledSelector, MachineSet};

use crate::error::ControllerError;

/// Reconciles MachineSet replica counts against the host inventory.
pub struct Reconciler {
    machine_set_api: Api<MachineSet>,
    host_api: Api<BareMetalHost>,
    pub(crate) backoff: BackoffTracker,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(machine_set_api: Api<MachineSet>, host_api: Api<BareMetalHost>) -> Self {
        Self {
            machine_set_api,
            host_api,
            backoff: BackoffTracker::new(),
        }
    }

    /// Reconciles one MachineSet.
    pub async fn reconcile_machine_set(
        &self,
        set: &MachineSet,
    ) -> Result<Action, ControllerError> {
        let name = set.name_any();
        let namespace = set.namespace().unwrap_or_else(|| "default".to_string());

        // only sets that opted in are scaled
        if !set.autoscaling_enabled() {
            return Ok(Action::await_change());
        }
        debug!("Reconciling MachineSet {}/{}", namespace, name);

        let selector = set
            .spec
            .template
            .spec
            .provider_spec
            .host_selector
            .compile()?;

        // An empty selector matches every host in the namespace. That works
        // until a second MachineSet appears and competes for the same hosts.
        if selector.is_empty() {
            warn!(
                "MachineSet {}/{} lacks a host selector; adding a future MachineSet may be difficult",
                namespace, name
            );
        }

        let hosts = self.host_api.list(&ListParams::default()).await?;
        let count = count_matching_hosts(&selector, &hosts.items);

        if set.spec.replicas != Some(count) {
            info!(
                "Scaling MachineSet {}/{} from {:?} to {} replicas",
                namespace, name, set.spec.replicas, count
            );
            let mut updated = set.clone();
            updated.spec.replicas = Some(count);
            self.machine_set_api
                .replace(&name, &PostParams::default(), &updated)
                .await?;
        }

        Ok(Action::await_change())
    }
}

/// Counts the hosts whose labels satisfy the selector.
pub(crate) fn count_matching_hosts(selector: &CompiledSelector, hosts: &[BareMetalHost]) -> i32 {
    hosts
        .iter()
        .filter(|host| selector.matches(host.labels()))
        .count() as i32
}
