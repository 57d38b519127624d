use std::io::Write;

use pipewright::cli::PipewrightConfig;
use pipewright::engine::types::Score;
use tempfile::NamedTempFile;

fn write_config(yaml: &str) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(yaml.as_bytes()).unwrap();
    f
}

#[test]
fn load_valid_config_all_fields() {
    let f = write_config(
        r#"
host: "127.0.0.1"
port: 8080
workspace: "projects"
max_loops: 5
stage_timeout_s: 120
max_invocations: 40
worker_cmd: "./bin/agent"
worker_args: ["--model", "large"]
gates:
  implementation-agent:
    min_score: 70
"#,
    );

    let cfg = PipewrightConfig::load(Some(f.path())).unwrap();

    assert_eq!(cfg.host.as_deref(), Some("127.0.0.1"));
    assert_eq!(cfg.port, Some(8080));
    assert_eq!(cfg.workspace.as_deref(), Some("projects"));
    assert_eq!(cfg.max_loops, Some(5));
    assert_eq!(cfg.max_invocations, Some(40));
    assert_eq!(cfg.worker_cmd.as_deref(), Some("./bin/agent"));
    assert_eq!(
        cfg.worker_args,
        Some(vec!["--model".to_string(), "large".to_string()])
    );
    assert_eq!(
        cfg.stage_timeout(),
        Some(std::time::Duration::from_secs(120))
    );
    assert_eq!(cfg.gates.as_ref().map(|g| g.len()), Some(1));
}

#[test]
fn load_partial_config() {
    let f = write_config("port: 9090\n");

    let cfg = PipewrightConfig::load(Some(f.path())).unwrap();

    assert_eq!(cfg.port, Some(9090));
    assert!(cfg.host.is_none());
    assert!(cfg.workspace.is_none());
    assert!(cfg.max_loops.is_none());
    assert!(cfg.stage_timeout().is_none());
    assert!(cfg.gates.is_none());
}

#[test]
fn missing_explicit_path_returns_error() {
    let result = PipewrightConfig::load(Some(std::path::Path::new(
        "/nonexistent/pipewright.yaml",
    )));
    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Config file not found")
    );
}

#[test]
fn default_config_is_empty() {
    let cfg = PipewrightConfig::default();
    assert!(cfg.host.is_none());
    assert!(cfg.port.is_none());
    assert!(cfg.worker_cmd.is_none());
    assert_eq!(cfg.gate_registry().unwrap().len(), 9);
}

#[test]
fn invalid_yaml_returns_error() {
    let f = write_config("port: [this is not valid yaml for a u16");

    let result = PipewrightConfig::load(Some(f.path()));
    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Failed to parse config file")
    );
}

#[test]
fn gate_overrides_applied() {
    let f = write_config(
        r#"
gates:
  implementation-agent:
    min_score: 70
  git-agent:
    required_artifacts: [".git/"]
"#,
    );

    let cfg = PipewrightConfig::load(Some(f.path())).unwrap();
    let registry = cfg.gate_registry().unwrap();

    let impl_gate = registry.get("implementation-agent").unwrap();
    assert_eq!(impl_gate.min_score, Score::new(70).unwrap());

    let git_gate = registry.get("git-agent").unwrap();
    assert_eq!(git_gate.required_artifacts, vec![".git/".to_string()]);
    assert_eq!(git_gate.min_score, Score::new(90).unwrap());
}

#[test]
fn gate_override_for_unknown_stage_rejected() {
    let f = write_config(
        r#"
gates:
  deploy-agent:
    min_score: 50
"#,
    );

    let cfg = PipewrightConfig::load(Some(f.path())).unwrap();
    let err = cfg.gate_registry().unwrap_err();
    assert!(format!("{:#}", err).contains("Invalid gate configuration"));
    assert!(format!("{:#}", err).contains("deploy-agent"));
}

#[test]
fn gate_override_out_of_range_rejected() {
    let f = write_config(
        r#"
gates:
  code-reviewer:
    min_score: 120
"#,
    );

    let cfg = PipewrightConfig::load(Some(f.path())).unwrap();
    assert!(cfg.gate_registry().is_err());
}

#[test]
fn non_positive_timeout_ignored() {
    let f = write_config("stage_timeout_s: 0\n");
    let cfg = PipewrightConfig::load(Some(f.path())).unwrap();
    assert!(cfg.stage_timeout().is_none());
}

#[test]
fn unknown_keys_are_ignored() {
    let f = write_config(
        r#"
port: 4000
unknown_setting: true
another_random_key: "hello"
"#,
    );

    let cfg = PipewrightConfig::load(Some(f.path())).unwrap();
    assert_eq!(cfg.port, Some(4000));
}
