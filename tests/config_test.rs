//! Configuration loading behavior.

use std::io::Write;

use proxima_node::config::Config;

#[test]
fn defaults_match_protocol_constants() {
    let config = Config::default();
    assert_eq!(config.mesh.port, 9130);
    assert_eq!(config.mesh.advertise_interval_ms, 1_000);
    assert_eq!(config.arbiter.response_timeout_ms, 4_000);
    assert_eq!(config.arbiter.role_change_timeout_ms, 2_000);
    assert_eq!(config.arbiter.max_clients, 3);
    assert_eq!(config.arbiter.max_master_links, 1);
    assert_eq!(config.ranging.rounds_per_target, 5);
    assert!((config.ranging.bias_factor - 1.2).abs() < f64::EPSILON);
}

#[test]
fn partial_file_keeps_defaults_for_missing_sections() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[node]
name = "kitchen"

[mesh]
port = 4242
"#
    )
    .unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.node.name, "kitchen");
    assert_eq!(config.mesh.port, 4242);
    assert_eq!(config.arbiter.max_clients, 3);
    assert_eq!(config.ranging.cycle_interval_ms, 10_000);
}

#[test]
fn malformed_file_is_an_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "not toml at all [[[").unwrap();
    assert!(Config::load(file.path()).is_err());
}

#[test]
fn missing_file_is_an_error() {
    assert!(Config::load(std::path::Path::new("/nonexistent/proxima.toml")).is_err());
}
