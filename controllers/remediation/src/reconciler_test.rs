//! Unit tests for the reboot workflow planning.

use chrono::{Duration, Utc};
use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crds::{
    BareMetalHost, BareMetalHostSpec, BareMetalHostStatus, MachineRemediationStatus,
    RemediationState, REBOOT_IN_PROGRESS_ANNOTATION,
};

use crate::reconciler::{node_is_ready, plan, reboot_in_progress, timed_out, Step};

fn test_host(online: bool, powered_on: bool) -> BareMetalHost {
    BareMetalHost {
        metadata: ObjectMeta {
            name: Some("host-0".to_string()),
            namespace: Some("metal3".to_string()),
            ..Default::default()
        },
        spec: BareMetalHostSpec {
            online,
            ..Default::default()
        },
        status: Some(BareMetalHostStatus {
            powered_on,
            ..Default::default()
        }),
    }
}

fn rebooting_host(online: bool, powered_on: bool) -> BareMetalHost {
    let mut host = test_host(online, powered_on);
    host.metadata.annotations = Some(
        [(REBOOT_IN_PROGRESS_ANNOTATION.to_string(), "true".to_string())]
            .into_iter()
            .collect(),
    );
    host
}

fn status(state: RemediationState, started_ago: Duration) -> MachineRemediationStatus {
    MachineRemediationStatus {
        state,
        start_time: Some(Utc::now() - started_ago),
        end_time: None,
        reason: String::new(),
    }
}

fn ready_node(ready: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some("node-0".to_string()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[test]
fn test_started_powers_off_an_online_host() {
    let step = plan(
        &status(RemediationState::Started, Duration::zero()),
        &test_host(true, true),
        None,
        Utc::now(),
    );
    assert_eq!(step, Step::BeginPowerOff { annotate: true });
}

#[test]
fn test_started_skips_a_host_powered_off_by_an_operator() {
    // offline without the reboot marker means an operator turned the host
    // off on purpose
    let step = plan(
        &status(RemediationState::Started, Duration::zero()),
        &test_host(false, false),
        None,
        Utc::now(),
    );
    assert_eq!(step, Step::SkipPoweredOff);
}

#[test]
fn test_started_continues_a_reboot_already_marked() {
    let step = plan(
        &status(RemediationState::Started, Duration::zero()),
        &rebooting_host(false, true),
        None,
        Utc::now(),
    );
    assert_eq!(step, Step::BeginPowerOff { annotate: false });
}

#[test]
fn test_power_off_waits_while_the_host_reports_power() {
    let step = plan(
        &status(RemediationState::PowerOff, Duration::minutes(1)),
        &rebooting_host(false, true),
        None,
        Utc::now(),
    );
    assert_eq!(step, Step::WaitForPowerOff);
}

#[test]
fn test_power_off_advances_once_power_is_down() {
    let step = plan(
        &status(RemediationState::PowerOff, Duration::minutes(1)),
        &rebooting_host(false, false),
        None,
        Utc::now(),
    );
    assert_eq!(step, Step::BeginPowerOn);
}

#[test]
fn test_power_off_fails_on_timeout() {
    // started six minutes ago against a five minute timeout, host still on
    let step = plan(
        &status(RemediationState::PowerOff, Duration::minutes(6)),
        &rebooting_host(false, true),
        None,
        Utc::now(),
    );
    assert_eq!(step, Step::FailOnTimeout);
}

#[test]
fn test_power_on_waits_for_the_node() {
    let host = test_host(true, true);
    let running = status(RemediationState::PowerOn, Duration::minutes(1));

    // node gone entirely
    assert_eq!(plan(&running, &host, None, Utc::now()), Step::WaitForNode);
    // node present but not Ready
    assert_eq!(
        plan(&running, &host, Some(false), Utc::now()),
        Step::WaitForNode
    );
}

#[test]
fn test_power_on_succeeds_once_the_node_is_ready() {
    let step = plan(
        &status(RemediationState::PowerOn, Duration::minutes(1)),
        &test_host(true, true),
        Some(true),
        Utc::now(),
    );
    assert_eq!(step, Step::Succeed);
}

#[test]
fn test_power_on_fails_on_timeout() {
    let step = plan(
        &status(RemediationState::PowerOn, Duration::minutes(6)),
        &test_host(true, true),
        Some(false),
        Utc::now(),
    );
    assert_eq!(step, Step::FailOnTimeout);
}

#[test]
fn test_terminal_states_clean_up() {
    let host = test_host(true, true);
    assert_eq!(
        plan(
            &status(RemediationState::Succeeded, Duration::minutes(1)),
            &host,
            Some(true),
            Utc::now()
        ),
        Step::DeleteRemediation
    );
    assert_eq!(
        plan(
            &status(RemediationState::Failed, Duration::minutes(6)),
            &host,
            Some(true),
            Utc::now()
        ),
        Step::ClearNodeAnnotation
    );
}

#[test]
fn test_happy_path_progression_never_regresses() {
    // Started -> PowerOff -> PowerOn -> Succeeded, strictly in graph order
    let now = Utc::now();

    let step = plan(
        &status(RemediationState::Started, Duration::zero()),
        &test_host(true, true),
        None,
        now,
    );
    assert_eq!(step, Step::BeginPowerOff { annotate: true });

    let step = plan(
        &status(RemediationState::PowerOff, Duration::seconds(30)),
        &rebooting_host(false, false),
        None,
        now,
    );
    assert_eq!(step, Step::BeginPowerOn);

    let step = plan(
        &status(RemediationState::PowerOn, Duration::minutes(2)),
        &test_host(true, true),
        Some(true),
        now,
    );
    assert_eq!(step, Step::Succeed);

    let step = plan(
        &status(RemediationState::Succeeded, Duration::minutes(2)),
        &test_host(true, true),
        Some(true),
        now,
    );
    assert_eq!(step, Step::DeleteRemediation);
}

#[test]
fn test_reboot_marker_detection() {
    assert!(!reboot_in_progress(&test_host(true, true)));
    assert!(reboot_in_progress(&rebooting_host(true, true)));

    // only the literal "true" counts
    let mut host = test_host(true, true);
    host.metadata.annotations = Some(
        [(REBOOT_IN_PROGRESS_ANNOTATION.to_string(), "yes".to_string())]
            .into_iter()
            .collect(),
    );
    assert!(!reboot_in_progress(&host));
}

#[test]
fn test_timeout_measurement() {
    let now = Utc::now();
    assert!(!timed_out(
        &status(RemediationState::PowerOff, Duration::minutes(4)),
        now
    ));
    assert!(timed_out(
        &status(RemediationState::PowerOff, Duration::minutes(6)),
        now
    ));
    // no start time recorded yet: nothing to measure against
    let blank = MachineRemediationStatus::default();
    assert!(!timed_out(&blank, now));
}

#[test]
fn test_node_readiness_condition() {
    assert!(node_is_ready(&ready_node(true)));
    assert!(!node_is_ready(&ready_node(false)));
    assert!(!node_is_ready(&Node::default()));
}
