//! Unit tests for the autoscaler counting logic.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crds::{
    BareMetalHost, BareMetalHostSpec, HostSelector, Image, MachineProviderSpec, MachineSet,
    MachineSetSpec, MachineSpec, MachineTemplate, SelectorRequirement, AUTOSCALE_ANNOTATION,
};

use crate::reconciler::count_matching_hosts;

fn test_host(name: &str, labels: &[(&str, &str)]) -> BareMetalHost {
    BareMetalHost {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("metal3".to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        },
        spec: BareMetalHostSpec::default(),
        status: None,
    }
}

fn test_machine_set(selector: HostSelector, annotated: bool) -> MachineSet {
    let mut annotations = BTreeMap::new();
    if annotated {
        annotations.insert(AUTOSCALE_ANNOTATION.to_string(), String::new());
    }
    MachineSet {
        metadata: ObjectMeta {
            name: Some("workers".to_string()),
            namespace: Some("metal3".to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: MachineSetSpec {
            replicas: None,
            selector: None,
            template: MachineTemplate {
                spec: MachineSpec {
                    provider_spec: MachineProviderSpec {
                        image: Image {
                            url: "http://images.example.com/rhcos.qcow2".to_string(),
                            checksum: "http://images.example.com/rhcos.qcow2.md5sum".to_string(),
                        },
                        user_data: None,
                        host_selector: selector,
                    },
                    bootstrap: None,
                    role: None,
                    provider_id: None,
                },
            },
        },
    }
}

#[test]
fn test_counts_hosts_matching_the_selector() {
    let selector = HostSelector {
        match_labels: Some(BTreeMap::from([(
            "pool".to_string(),
            "workers".to_string(),
        )])),
        ..Default::default()
    }
    .compile()
    .unwrap();

    let hosts = vec![
        test_host("host-0", &[("pool", "workers")]),
        test_host("host-1", &[("pool", "workers"), ("rack", "r2")]),
        test_host("host-2", &[("pool", "masters")]),
        test_host("host-3", &[]),
    ];

    assert_eq!(count_matching_hosts(&selector, &hosts), 2);
}

#[test]
fn test_empty_selector_counts_every_host() {
    let selector = HostSelector::default().compile().unwrap();
    let hosts = vec![
        test_host("host-0", &[("pool", "workers")]),
        test_host("host-1", &[]),
    ];
    assert_eq!(count_matching_hosts(&selector, &hosts), 2);
}

#[test]
fn test_no_hosts_counts_zero() {
    let selector = HostSelector::default().compile().unwrap();
    assert_eq!(count_matching_hosts(&selector, &[]), 0);
}

#[test]
fn test_expression_selector_counts() {
    let selector = HostSelector {
        match_expressions: Some(vec![SelectorRequirement {
            key: "size".to_string(),
            operator: "notin".to_string(),
            values: vec!["large".to_string()],
        }]),
        ..Default::default()
    }
    .compile()
    .unwrap();

    let hosts = vec![
        test_host("host-0", &[("size", "small")]),
        test_host("host-1", &[("size", "large")]),
        test_host("host-2", &[]),
    ];

    assert_eq!(count_matching_hosts(&selector, &hosts), 2);
}

#[test]
fn test_autoscale_annotation_gate() {
    let annotated = test_machine_set(HostSelector::default(), true);
    assert!(annotated.autoscaling_enabled());

    let plain = test_machine_set(HostSelector::default(), false);
    assert!(!plain.autoscaling_enabled());
}
