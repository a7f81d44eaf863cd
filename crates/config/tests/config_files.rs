// SPDX-License-Identifier: Apache-2.0

//! Loading scheduler configuration from files.

use buildflow_config::{Error, SchedulerConfig};
use std::time::Duration;

fn write_config(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).expect("write config");
    path
}

#[test]
fn loads_yaml_by_extension() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(
        &dir,
        "scheduler.yaml",
        "resources:\n  status_interval: 500ms\nfeatures:\n  stop_on_first_error: true\n",
    );

    let config = SchedulerConfig::from_file(&path).expect("load");
    assert_eq!(config.resources.status_interval, Duration::from_millis(500));
    assert!(config.features.stop_on_first_error);
}

#[test]
fn loads_json_by_extension() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(
        &dir,
        "scheduler.json",
        r#"{"retries": {"max_retries_due_to_low_memory": 5}}"#,
    );

    let config = SchedulerConfig::from_file(&path).expect("load");
    assert_eq!(config.retries.max_retries_due_to_low_memory, 5);
}

#[test]
fn invalid_values_fail_loading_with_all_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(
        &dir,
        "scheduler.yaml",
        "queues:\n  cpu: 0\ndistribution:\n  minimum_workers: 0\n",
    );

    let Err(Error::InvalidConfiguration { errors }) = SchedulerConfig::from_file(&path) else {
        panic!("expected invalid configuration");
    };
    assert_eq!(errors.len(), 2);
}

#[test]
fn unsupported_extensions_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(&dir, "scheduler.toml", "queues = {}");
    assert!(matches!(
        SchedulerConfig::from_file(&path),
        Err(Error::UnsupportedFormat { .. })
    ));
}

#[test]
fn missing_files_surface_a_read_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(matches!(
        SchedulerConfig::from_file(&dir.path().join("absent.yaml")),
        Err(Error::FileReadError { .. })
    ));
}
