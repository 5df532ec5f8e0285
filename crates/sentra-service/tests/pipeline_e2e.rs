//! End-to-end scenarios: generated shell-script sensors feeding real
//! pipelines into file exporters.

use sentra_compose::Compose;
use sentra_core::{FilterOperator, PipelineError, Record};
use sentra_service::Service;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const EMPTY_FILTER: &str = "version: '1'\n";

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

fn record_line(event: &str, metadata: &str) -> String {
    format!(
        r#"echo '{{"eventname":"{event}","source":"dummy","timestamp":"t0","log":"line","metadata":{metadata}}}'"#
    )
}

fn single_pipeline_compose(script: &Path, destination: &Path) -> Arc<Compose> {
    let yaml = format!(
        r"
sensors:
  dummy:
    exec_path: '{exec}'
    param: ''
    run_as_root: false
    events_header:
      tick: [log]
exporters:
  archive:
    mode: file
    destination: '{dest}'
    timeout: 300
service:
  group: test
  description: end-to-end pipeline
  pipelines:
    main:
      sensors: [dummy]
      exporter: archive
",
        exec = script.display(),
        dest = destination.display(),
    );
    Arc::new(Compose::from_yaml(&yaml).expect("compose load failed"))
}

fn output_lines(path: &Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(text) => text.lines().map(str::to_string).collect(),
        Err(_) => Vec::new(),
    }
}

fn contains_sensor_exited(error: &PipelineError, expected_code: i32) -> bool {
    match error {
        PipelineError::SensorExited { code, .. } => *code == expected_code,
        PipelineError::Joined(errors) => errors
            .iter()
            .any(|inner| contains_sensor_exited(inner, expected_code)),
        _ => false,
    }
}

#[tokio::test]
async fn test_happy_path_delivers_every_line() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(
        dir.path(),
        "dummy.sh",
        &format!(
            "i=0\nwhile [ $i -lt 100 ]; do\n  {}\n  i=$((i+1))\ndone\n",
            record_line("tick", "{}")
        ),
    );
    let destination = dir.path().join("out.log");
    let compose = single_pipeline_compose(&script, &destination);

    let filter = FilterOperator::from_yaml(EMPTY_FILTER).expect("filter compile failed");
    let service = Service::new(compose, filter).expect("service build failed");
    let pool = service.pool();
    let handle = service.start().await.expect("service start failed");

    tokio::time::sleep(Duration::from_millis(700)).await;
    handle.stop().await.expect("service stop failed");

    let lines = output_lines(&destination);
    assert_eq!(lines.len(), 100);
    for line in &lines {
        let record: Record = serde_json::from_str(line).expect("exporter output is JSON lines");
        assert_eq!(record.event_name, "tick");
    }
    assert_eq!(pool.recycled(), 100, "no envelope left in flight at exit");
}

#[tokio::test]
async fn test_filter_drops_denied_records() {
    let dir = TempDir::new().expect("tempdir");
    let mut body = String::new();
    for _ in 0..3 {
        body.push_str(&record_line("bashReadline", "{}"));
        body.push('\n');
    }
    for _ in 0..7 {
        body.push_str(&record_line("processCreate", "{}"));
        body.push('\n');
    }
    let script = write_script(dir.path(), "dummy.sh", &body);
    let destination = dir.path().join("out.log");
    let compose = single_pipeline_compose(&script, &destination);

    let filter = FilterOperator::from_yaml(
        r"
version: '1'
deny:
  shell:
    condition:
      eventname|contains: bash
",
    )
    .expect("filter compile failed");
    let service = Service::new(compose, filter).expect("service build failed");
    let pool = service.pool();
    let handle = service.start().await.expect("service start failed");

    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.stop().await.expect("service stop failed");

    let lines = output_lines(&destination);
    assert_eq!(lines.len(), 7, "three bash records dropped");
    assert_eq!(pool.recycled(), 10, "dropped records returned to the pool too");
}

#[tokio::test]
async fn test_filter_exception_delivers_matching_record() {
    let dir = TempDir::new().expect("tempdir");
    let body = format!(
        "{}\n{}\n",
        record_line("processCreate", r#"{"Commandline":"ls -al"}"#),
        record_line("processCreate", r#"{"Commandline":"sleep 1"}"#),
    );
    let script = write_script(dir.path(), "dummy.sh", &body);
    let destination = dir.path().join("out.log");
    let compose = single_pipeline_compose(&script, &destination);

    let filter = FilterOperator::from_yaml(
        r"
version: '1'
deny:
  noisyProcesses:
    condition:
      eventname|startswith: process
    exception:
      Commandline|contains: ls
",
    )
    .expect("filter compile failed");
    let service = Service::new(compose, filter).expect("service build failed");
    let handle = service.start().await.expect("service start failed");

    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.stop().await.expect("service stop failed");

    let lines = output_lines(&destination);
    assert_eq!(lines.len(), 1);
    let record: Record = serde_json::from_str(&lines[0]).expect("line is JSON");
    assert_eq!(record.metadata["Commandline"], "ls -al");
}

#[tokio::test]
async fn test_sensor_crash_surfaces_and_tears_down() {
    let dir = TempDir::new().expect("tempdir");
    let mut body = String::new();
    for _ in 0..5 {
        body.push_str(&record_line("tick", "{}"));
        body.push('\n');
    }
    body.push_str("exit 1\n");
    let script = write_script(dir.path(), "dummy.sh", &body);
    let destination = dir.path().join("out.log");
    let compose = single_pipeline_compose(&script, &destination);

    let filter = FilterOperator::from_yaml(EMPTY_FILTER).expect("filter compile failed");
    let service = Service::new(compose, filter).expect("service build failed");
    let handle = service.start().await.expect("service start failed");

    let error = handle.wait().await.expect_err("crash must surface");
    assert!(
        contains_sensor_exited(&error, 1),
        "expected SensorExited(1), got: {error}"
    );
    assert_eq!(
        handle.state().await,
        sentra_service::ServiceState::Stopped,
        "all workers terminated after the crash"
    );

    let lines = output_lines(&destination);
    assert_eq!(lines.len(), 5, "delivered prefix survives the crash");
}

#[tokio::test]
async fn test_fan_out_delivers_to_both_exporters_once() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(
        dir.path(),
        "dummy.sh",
        &format!("{}\n", record_line("tick", "{}")),
    );
    let first = dir.path().join("first.log");
    let second = dir.path().join("second.log");
    let yaml = format!(
        r"
sensors:
  dummy:
    exec_path: '{exec}'
    param: ''
    run_as_root: false
    events_header:
      tick: [log]
exporters:
  first:
    mode: file
    destination: '{first}'
    timeout: 300
  second:
    mode: file
    destination: '{second}'
    timeout: 300
service:
  group: test
  description: fan-out
  pipelines:
    left:
      sensors: [dummy]
      exporter: first
    right:
      sensors: [dummy]
      exporter: second
",
        exec = script.display(),
        first = first.display(),
        second = second.display(),
    );
    let compose = Arc::new(Compose::from_yaml(&yaml).expect("compose load failed"));

    let filter = FilterOperator::from_yaml(EMPTY_FILTER).expect("filter compile failed");
    let service = Service::new(compose, filter).expect("service build failed");
    let pool = service.pool();
    let handle = service.start().await.expect("service start failed");

    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.stop().await.expect("service stop failed");

    assert_eq!(output_lines(&first).len(), 1);
    assert_eq!(output_lines(&second).len(), 1);
    assert_eq!(pool.recycled(), 1, "one envelope, returned exactly once");
    assert_eq!(pool.idle(), 1);
}

#[tokio::test]
async fn test_graceful_shutdown_under_sustained_load() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(
        dir.path(),
        "firehose.sh",
        &format!("while :; do\n  {}\ndone\n", record_line("tick", "{}")),
    );
    let destination = dir.path().join("out.log");
    let compose = single_pipeline_compose(&script, &destination);

    let filter = FilterOperator::from_yaml(EMPTY_FILTER).expect("filter compile failed");
    let service =
        Service::with_channel_capacity(compose, filter, 64).expect("service build failed");
    let handle = service.start().await.expect("service start failed");

    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.stop().await.expect("stop under load failed");
    handle.wait().await.expect("kill by stop is a clean shutdown");

    assert!(
        !output_lines(&destination).is_empty(),
        "records flowed before the stop"
    );
    assert_eq!(handle.state().await, sentra_service::ServiceState::Stopped);
}

#[tokio::test]
async fn test_double_stop_is_invalid() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(dir.path(), "dummy.sh", "sleep 60\n");
    let destination = dir.path().join("out.log");
    let compose = single_pipeline_compose(&script, &destination);

    let filter = FilterOperator::from_yaml(EMPTY_FILTER).expect("filter compile failed");
    let service = Service::new(compose, filter).expect("service build failed");
    let handle = service.start().await.expect("service start failed");

    handle.stop().await.expect("first stop failed");
    assert!(matches!(
        handle.stop().await,
        Err(PipelineError::AlreadyStopped { .. })
    ));
}

#[tokio::test]
async fn test_network_exporter_rejected_at_build() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_script(dir.path(), "dummy.sh", "exit 0\n");
    let yaml = format!(
        r"
sensors:
  dummy:
    exec_path: '{exec}'
    param: ''
    run_as_root: false
    events_header:
      tick: [log]
exporters:
  upstream:
    mode: network
    destination: '127.0.0.1:4317'
    timeout: 300
service:
  group: test
  description: network sink
  pipelines:
    main:
      sensors: [dummy]
      exporter: upstream
",
        exec = script.display(),
    );
    let compose = Arc::new(Compose::from_yaml(&yaml).expect("compose load failed"));
    let filter = FilterOperator::from_yaml(EMPTY_FILTER).expect("filter compile failed");

    let error = Service::new(compose, filter).expect_err("network exporter is not implemented");
    assert!(matches!(error, PipelineError::UnsupportedExporter { .. }));
}
