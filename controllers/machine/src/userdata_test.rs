//! Unit tests for the user-data merge rules.

use serde_yaml::Value;

use crate::userdata::{
    merge_documents, parse_document, render_document, MergeOrder, UserDataError,
    CLOUD_CONFIG_HEADER,
};

fn mapping(source: &str) -> serde_yaml::Mapping {
    parse_document(source.as_bytes()).unwrap()
}

#[test]
fn test_lists_concatenate_on_append() {
    let base = mapping(
        "write_files:\n- path: /etc/one\nusers:\n- name: alice\n",
    );
    let overlay = mapping(
        "write_files:\n- path: /etc/two\nusers:\n- name: bob\n",
    );

    let merged = merge_documents(&base, &overlay, MergeOrder::Append).unwrap();

    let files = merged.get("write_files").unwrap().as_sequence().unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(
        files[0].get("path").unwrap(),
        &Value::String("/etc/one".to_string())
    );
    assert_eq!(
        files[1].get("path").unwrap(),
        &Value::String("/etc/two".to_string())
    );

    let users = merged.get("users").unwrap().as_sequence().unwrap();
    assert_eq!(
        users[0].get("name").unwrap(),
        &Value::String("alice".to_string())
    );
    assert_eq!(
        users[1].get("name").unwrap(),
        &Value::String("bob".to_string())
    );
}

#[test]
fn test_lists_concatenate_on_prepend() {
    let base = mapping("runcmd:\n- base-command\n");
    let overlay = mapping("runcmd:\n- first-command\n");

    let merged = merge_documents(&base, &overlay, MergeOrder::Prepend).unwrap();

    let commands = merged.get("runcmd").unwrap().as_sequence().unwrap();
    assert_eq!(commands[0], Value::String("first-command".to_string()));
    assert_eq!(commands[1], Value::String("base-command".to_string()));
}

#[test]
fn test_duplicate_scalar_is_a_conflict() {
    let base = mapping("abc: x\n");
    let overlay = mapping("abc: y\n");

    let err = merge_documents(&base, &overlay, MergeOrder::Append).unwrap_err();
    assert!(matches!(err, UserDataError::DuplicateKey(key) if key == "abc"));
}

#[test]
fn test_kind_mismatch_is_rejected() {
    let base = mapping("packages: docker\n");
    let overlay = mapping("packages:\n- podman\n");

    let err = merge_documents(&base, &overlay, MergeOrder::Append).unwrap_err();
    assert!(matches!(err, UserDataError::TypeMismatch(key) if key == "packages"));
}

#[test]
fn test_disjoint_keys_are_kept_as_is() {
    let base = mapping("hostname: node-0\n");
    let overlay = mapping("timezone: UTC\n");

    let merged = merge_documents(&base, &overlay, MergeOrder::Append).unwrap();
    assert_eq!(
        merged.get("hostname").unwrap(),
        &Value::String("node-0".to_string())
    );
    assert_eq!(
        merged.get("timezone").unwrap(),
        &Value::String("UTC".to_string())
    );
}

#[test]
fn test_nested_mappings_merge_when_disjoint() {
    let base = mapping("chpasswd:\n  expire: false\n");
    let overlay = mapping("chpasswd:\n  list: root:linux\n");

    let merged = merge_documents(&base, &overlay, MergeOrder::Append).unwrap();
    let chpasswd = merged.get("chpasswd").unwrap().as_mapping().unwrap();
    assert_eq!(chpasswd.len(), 2);
}

#[test]
fn test_nested_duplicate_key_is_a_conflict() {
    let base = mapping("chpasswd:\n  expire: false\n");
    let overlay = mapping("chpasswd:\n  expire: true\n");

    let err = merge_documents(&base, &overlay, MergeOrder::Append).unwrap_err();
    assert!(matches!(err, UserDataError::DuplicateKey(key) if key == "expire"));
}

#[test]
fn test_merge_with_empty_overlay_is_identity() {
    let base = mapping("hostname: node-0\nusers:\n- name: alice\n");
    let empty = serde_yaml::Mapping::new();

    let appended = merge_documents(&base, &empty, MergeOrder::Append).unwrap();
    assert_eq!(appended, base);
    let prepended = merge_documents(&base, &empty, MergeOrder::Prepend).unwrap();
    assert_eq!(prepended, base);
}

#[test]
fn test_parse_accepts_the_cloud_config_marker() {
    let document = parse_document(b"#cloud-config\nhostname: node-0\n").unwrap();
    assert_eq!(
        document.get("hostname").unwrap(),
        &Value::String("node-0".to_string())
    );
}

#[test]
fn test_rendered_document_carries_the_marker() {
    let document = mapping("hostname: node-0\n");
    let rendered = render_document(&document).unwrap();
    let text = String::from_utf8(rendered).unwrap();
    assert!(text.starts_with(CLOUD_CONFIG_HEADER));
    assert!(text.contains("hostname: node-0"));
}

#[test]
fn test_scalar_document_root_is_rejected() {
    let err = parse_document(b"just a string\n").unwrap_err();
    assert!(matches!(err, UserDataError::NotAMapping));
}
