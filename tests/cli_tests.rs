mod common;

use common::{run_callscribe, TestEnv};

#[test]
fn callscribe_help_shows_usage() {
    let output = run_callscribe(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(
        output.status.success(),
        "--help should succeed\nstdout:\n{}\nstderr:\n{}",
        stdout,
        stderr
    );
    assert!(stdout.contains("Usage:"));
    assert!(stdout.contains("Commands:"));
    assert!(stdout.contains("--port"));
    assert!(
        !stderr.contains("No config file found"),
        "--help should not log config fallback noise\nstderr:\n{}",
        stderr
    );
}

#[test]
fn callscribe_version_shows_version() {
    let output = run_callscribe(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("callscribe "));
}

#[test]
fn completions_bash_outputs_script() {
    let output = run_callscribe(&["completions", "bash"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(
        output.status.success(),
        "completions bash should succeed\nstdout:\n{}\nstderr:\n{}",
        stdout,
        stderr
    );
    assert!(
        stdout.contains("callscribe"),
        "expected completion output to reference command name\nstdout:\n{}",
        stdout
    );
}

#[test]
fn config_show_prints_stage_routes() {
    let output = run_callscribe(&["config", "show"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(
        output.status.success(),
        "config show should succeed\nstdout:\n{}\nstderr:\n{}",
        stdout,
        stderr
    );
    assert!(stdout.contains("[general]"));
    assert!(stdout.contains("data_dir"));
    assert!(stdout.contains("write_to_q = \"dispatch-queue\""));
}

#[test]
fn config_path_returns_valid_path() {
    let output = run_callscribe(&["config", "path"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("config.toml"));
}

#[test]
fn config_init_refuses_to_overwrite_without_force() {
    let env = TestEnv::new();

    let first = env.run(&["config", "init"]);
    assert!(
        first.status.success(),
        "first init should succeed\nstderr:\n{}",
        String::from_utf8_lossy(&first.stderr)
    );
    assert!(env.config_path().exists());

    let second = env.run(&["config", "init"]);
    assert!(!second.status.success());
    assert!(String::from_utf8_lossy(&second.stderr).contains("--force"));

    let forced = env.run(&["config", "init", "--force"]);
    assert!(forced.status.success());
}

#[test]
fn serve_rejects_unknown_stage() {
    let output = run_callscribe(&["serve", "redaction"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid value"));
}

#[test]
fn show_rejects_malformed_id() {
    let output = run_callscribe(&["show", "not-a-uuid"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid request ID"));
}

#[test]
fn show_reports_unknown_request() {
    let env = TestEnv::new();
    let output = env.run(&["show", "6f1c2a58-2f53-4f0e-9d44-0f2f4e5c1d10"]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no request document"));
}

#[test]
fn deliver_requires_durable_backend() {
    let env = TestEnv::new();
    env.write_config(
        r#"
        [queue]
        backend = "null"
        "#,
    );

    let output = env.run(&["deliver"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("has no deliverer"));
}
