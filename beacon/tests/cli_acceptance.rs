use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("beacon/queue.db")
    }

    fn write_config(&self, contents: &str) {
        let path = self.xdg_config.join("beacon/config.toml");
        fs::create_dir_all(path.parent().expect("missing config parent"))
            .expect("failed to create config directory");
        fs::write(path, contents).expect("failed to write config");
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("beacon"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute beacon: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "beacon {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn run_ok(env: &CliTestEnv, args: &[&str]) -> String {
    let output = run_bin(env, args);
    assert_success(args, &output);
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn status_without_config_or_database() {
    let env = CliTestEnv::new();

    let stdout = run_ok(&env, &["status"]);
    assert!(stdout.contains("Beacon Collector Configuration"));
    assert!(stdout.contains("Server URL:      <not set>"));
    assert!(stdout.contains("Status: Not ready"));
    assert!(stdout.contains("Queue database not found"));
}

#[test]
fn tracked_events_persist_across_invocations() {
    let env = CliTestEnv::new();

    let args = ["track", "note_created", "-p", "noteId=n1", "-p", "words=12"];
    let stdout = run_ok(&env, &args);
    assert!(stdout.starts_with("Enqueued "), "got:\n{stdout}");
    assert!(
        env.db_path().exists(),
        "queue database should exist at {}",
        env.db_path().display()
    );

    run_ok(&env, &["track", "note_deleted", "-p", "noteId=n1"]);

    let stdout = run_ok(&env, &["status"]);
    assert!(stdout.contains("Queue Size:      2"), "got:\n{stdout}");
    assert!(stdout.contains("Dead Letters:    0"));
    assert!(stdout.contains("Circuit:         closed"));
}

#[test]
fn invalid_event_name_is_reported() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["track", "Note Created"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid event name"), "got:\n{stderr}");
}

#[test]
fn flush_without_collector_is_a_no_op() {
    let env = CliTestEnv::new();

    run_ok(&env, &["track", "note_created"]);
    let stdout = run_ok(&env, &["flush"]);
    assert!(stdout.contains("Collector is not configured"));

    let stdout = run_ok(&env, &["status"]);
    assert!(stdout.contains("Queue Size:      1"));
}

#[test]
fn flush_against_unreachable_collector_keeps_events() {
    let env = CliTestEnv::new();
    env.write_config(
        r#"
[collector]
server_url = "http://127.0.0.1:9"

[transport]
max_retries = 0
attempt_timeout_ms = 2000

[scheduler]
shutdown_grace_ms = 3000
"#,
    );

    run_ok(&env, &["track", "note_created", "-p", "noteId=n1"]);
    let stdout = run_ok(&env, &["flush"]);
    assert!(stdout.contains("Flushing 1 pending event(s)"), "got:\n{stdout}");
    assert!(stdout.contains("Flushed 0 event(s)"));
    assert!(stdout.contains("Requeued:        1"));

    let stdout = run_ok(&env, &["status"]);
    assert!(stdout.contains("Queue Size:      1"), "got:\n{stdout}");
}

#[test]
fn dead_letters_list_and_purge_on_empty_queue() {
    let env = CliTestEnv::new();

    let stdout = run_ok(&env, &["dead-letters", "list"]);
    assert!(stdout.contains("No dead letters."));

    let stdout = run_ok(&env, &["dead-letters", "purge", "--older-than-hours", "0"]);
    assert!(stdout.contains("Purged 0 dead letter(s)"));
}

#[test]
fn replaying_unknown_dead_letter_fails() {
    let env = CliTestEnv::new();

    let output = run_bin(
        &env,
        &[
            "dead-letters",
            "replay",
            "00000000-0000-0000-0000-000000000000",
        ],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to replay"), "got:\n{stderr}");
}
