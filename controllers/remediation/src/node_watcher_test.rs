//! Unit tests for the node-reboot dedup predicate.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crds::{
    MachineRemediation, MachineRemediationSpec, MachineRemediationStatus, RemediationState,
    RemediationType,
};

use crate::node_watcher::has_active_remediation;

fn remediation(machine_name: &str, status: Option<MachineRemediationStatus>) -> MachineRemediation {
    MachineRemediation {
        metadata: ObjectMeta {
            generate_name: Some("remediation-".to_string()),
            namespace: Some("metal3".to_string()),
            ..Default::default()
        },
        spec: MachineRemediationSpec {
            machine_name: machine_name.to_string(),
            remediation_type: RemediationType::Reboot,
        },
        status,
    }
}

#[test]
fn test_no_records_means_no_active_remediation() {
    assert!(!has_active_remediation(&[], "machine-0"));
}

#[test]
fn test_fresh_record_without_status_is_active() {
    let records = vec![remediation("machine-0", None)];
    assert!(has_active_remediation(&records, "machine-0"));
}

#[test]
fn test_in_flight_record_is_active() {
    let records = vec![remediation(
        "machine-0",
        Some(MachineRemediationStatus {
            state: RemediationState::PowerOff,
            start_time: Some(Utc::now()),
            end_time: None,
            reason: "Starts the reboot process".to_string(),
        }),
    )];
    assert!(has_active_remediation(&records, "machine-0"));
}

#[test]
fn test_finished_record_is_not_active() {
    let records = vec![remediation(
        "machine-0",
        Some(MachineRemediationStatus {
            state: RemediationState::Failed,
            start_time: Some(Utc::now()),
            end_time: Some(Utc::now()),
            reason: "Reboot failed on timeout".to_string(),
        }),
    )];
    assert!(!has_active_remediation(&records, "machine-0"));
}

#[test]
fn test_other_machines_do_not_block() {
    let records = vec![remediation("machine-1", None)];
    assert!(!has_active_remediation(&records, "machine-0"));
}

#[test]
fn test_mixed_records() {
    let records = vec![
        remediation(
            "machine-0",
            Some(MachineRemediationStatus {
                state: RemediationState::Succeeded,
                start_time: Some(Utc::now()),
                end_time: Some(Utc::now()),
                reason: "Reboot succeeded".to_string(),
            }),
        ),
        remediation("machine-0", None),
    ];
    assert!(has_active_remediation(&records, "machine-0"));
}
