//! Configuration system tests
//!
//! Tests configuration loading, validation, and environment overrides
//! through the binary.

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Test fixture for configuration testing
struct ConfigFixture {
    _temp_dir: TempDir,
    config_path: PathBuf,
}

impl ConfigFixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("trainer.toml");
        Self {
            _temp_dir: temp_dir,
            config_path,
        }
    }

    fn write_config(&self, content: &str) {
        fs::write(&self.config_path, content).unwrap();
    }

    fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }
}

fn trainer_cmd() -> Command {
    let mut cmd = Command::cargo_bin("swarm-trainer").unwrap();
    for var in [
        "SWARM_CONFIG",
        "SWARM_RUN_ID",
        "SWARM_PEER_ID",
        "SWARM_INITIAL_PEERS",
        "SWARM_CAPACITY",
        "SWARM_TARGET_GROUP_SIZE",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn validate(fixture: &ConfigFixture) -> assert_cmd::assert::Assert {
    trainer_cmd()
        .args(["config", "validate", "--config", fixture.path()])
        .assert()
}

// ─────────────────────────────────────────────────────────────────
// Valid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_empty_config_uses_defaults() {
    let fixture = ConfigFixture::new();
    fixture.write_config("");
    validate(&fixture).success();
}

#[test]
fn test_full_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[peer]
id = "00112233445566778899aabbccddeeff00112233"
name = "Test Peer"
listen_host = "127.0.0.1"
listen_port = 31337
announce_addr = "203.0.113.7:31337"
initial_peers = [
    "ffeeddccbbaa99887766554433221100ffeeddcc@10.0.0.2:31337",
    "10.0.0.3:31337",
]
capacity = 2.5
client_mode = false
request_timeout_ms = 3000

[dht]
bucket_size = 8
alpha = 2
max_failures = 2
refresh_interval_ms = 30000
default_ttl_secs = 120

[averaging]
run_id = "albert"
target_group_size = 8
min_group_size = 2
matchmaking_time_ms = 5000
allreduce_timeout_ms = 10000
weighting = "samples"
max_part_size = 1024

[training]
target_batch_size = 8192
statistics_expiration_secs = 300
publish_interval_ms = 2000
stale_peer_timeout_ms = 60000
max_retained_attempts = 2
model_size = 128
batch_size = 16
learning_rate = 0.01
compute_delay_ms = 0
seed = 42

[monitor]
refresh_period_ms = 10000

[telemetry]
enabled = true
file = "/tmp/swarm-telemetry.jsonl"
queue_size = 64

[logging]
level = "debug"
max_file_size_mb = 50
max_files = 3
json_format = true

[runtime]
worker_threads = 2
"#,
    );

    validate(&fixture).success();
}

#[test]
fn test_client_mode_with_zero_capacity() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[peer]
capacity = 0.0
client_mode = true
"#,
    );
    validate(&fixture).success();
}

// ─────────────────────────────────────────────────────────────────
// Invalid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_min_group_larger_than_target() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[averaging]
target_group_size = 2
min_group_size = 3
"#,
    );
    validate(&fixture)
        .failure()
        .code(10)
        .stderr(predicate::str::contains("min_group_size"));
}

#[test]
fn test_empty_run_id() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[averaging]
run_id = "  "
"#,
    );
    validate(&fixture).failure().code(10);
}

#[test]
fn test_zero_timeouts() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[averaging]
allreduce_timeout_ms = 0
"#,
    );
    validate(&fixture).failure().code(10);
}

#[test]
fn test_negative_capacity() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[peer]
capacity = -1.0
"#,
    );
    validate(&fixture).failure().code(10);
}

#[test]
fn test_malformed_initial_peer() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[peer]
initial_peers = ["nowhere"]
"#,
    );
    validate(&fixture).failure().code(10);
}

#[test]
fn test_bad_peer_id() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[peer]
id = "not-hex"
"#,
    );
    validate(&fixture)
        .failure()
        .stderr(predicate::str::contains("40 hex characters"));
}

#[test]
fn test_invalid_log_level() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[logging]
level = "invalid_level"
"#,
    );
    validate(&fixture).failure().code(10);
}

#[test]
fn test_unknown_weighting() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[averaging]
weighting = "loudest"
"#,
    );
    validate(&fixture).failure().stderr(predicate::str::contains("E101"));
}

#[test]
fn test_malformed_toml() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[averaging
run_id = "broken"
"#,
    );
    validate(&fixture).failure().code(10);
}

// ─────────────────────────────────────────────────────────────────
// Config Show / Environment Override Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_config_show_custom() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[averaging]
run_id = "custom-run"
target_group_size = 4
"#,
    );

    trainer_cmd()
        .args(["config", "show", "--config", fixture.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("custom-run"))
        .stdout(predicate::str::contains("target_group_size = 4"));
}

#[test]
fn test_env_overrides_file() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[averaging]
run_id = "from-file"
"#,
    );

    trainer_cmd()
        .env("SWARM_RUN_ID", "from-env")
        .args(["config", "show", "--config", fixture.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("from-env"))
        .stdout(predicate::str::contains("from-file").not());
}

#[test]
fn test_env_override_is_validated() {
    let fixture = ConfigFixture::new();
    fixture.write_config("");

    trainer_cmd()
        .env("SWARM_INITIAL_PEERS", "10.0.0.1:31337, broken")
        .args(["config", "validate", "--config", fixture.path()])
        .assert()
        .failure()
        .code(10);
}
