use std::ffi::OsStr;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_file(name: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    std::env::temp_dir().join(format!("extraskernel-cli-{now}-{name}"))
}

fn write_request(name: &str, contents: &str) -> PathBuf {
    let path = unique_temp_file(name);
    fs::write(&path, contents)
        .unwrap_or_else(|err| panic!("failed to write request file {}: {err}", path.display()));
    path
}

fn run_xk<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_xk"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute xk binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_xk(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "xk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_str<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string at {pointer} in payload: {value}"))
}

// Test IDs: TCLI-001
#[test]
fn run_reports_requirements_for_a_yaml_request() {
    let request = write_request(
        "phase-one.yaml",
        r"
input:
  extraResources:
    - kind: EnvironmentConfig
      apiVersion: example.org/v1
      ref:
        name: cfg-1
composite: {}
",
    );

    let value = run_json(vec![
        "run".to_string(),
        "--request".to_string(),
        request.display().to_string(),
    ]);

    assert_eq!(as_str(&value, "/cli_contract_version"), "cli.v1");
    assert_eq!(as_str(&value, "/data/requirements/resources-0/matchName"), "cfg-1");
    assert!(value.pointer("/data/context").is_none());

    let _ = fs::remove_file(&request);
}

// Test IDs: TCLI-002
#[test]
fn run_merges_supplied_matches_into_the_environment() {
    let request = write_request(
        "phase-two.json",
        r#"{
            "input": {
                "extraResources": [
                    {
                        "kind": "EnvironmentConfig",
                        "apiVersion": "example.org/v1",
                        "ref": {"name": "cfg-1"},
                        "fromFieldPath": "data"
                    }
                ]
            },
            "composite": {},
            "extraResources": {
                "resources-0": [
                    {"metadata": {"name": "cfg-1"}, "data": {"region": "eu-west-1"}}
                ]
            }
        }"#,
    );

    let value = run_json(vec![
        "run".to_string(),
        "--request".to_string(),
        request.display().to_string(),
    ]);

    assert_eq!(
        as_str(
            &value,
            "/data/context/apiextensions.crossplane.io~1environment/region"
        ),
        "eu-west-1"
    );

    let _ = fs::remove_file(&request);
}

// Test IDs: TCLI-003
#[test]
fn requirements_subcommand_prints_the_requirement_map_alone() {
    let request = write_request(
        "requirements.json",
        r#"{
            "input": {
                "extraResources": [
                    {
                        "kind": "EnvironmentConfig",
                        "apiVersion": "example.org/v1",
                        "ref": {"name": "cfg-1"}
                    }
                ]
            },
            "composite": {},
            "extraResources": {"resources-0": []}
        }"#,
    );

    let value = run_json(vec![
        "requirements".to_string(),
        "--request".to_string(),
        request.display().to_string(),
    ]);

    assert_eq!(as_str(&value, "/data/resources-0/matchName"), "cfg-1");
    assert!(value.pointer("/data/requirements").is_none());

    let _ = fs::remove_file(&request);
}
