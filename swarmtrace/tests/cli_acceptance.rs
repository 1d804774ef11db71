use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use swarmtrace_core::{AgentStatus, Database, MarkKind, RunStatus, SessionState};
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

        // Point the backend at a closed port so nothing leaves the machine
        write_config(
            &xdg_config,
            "[backend]\nbase_url = \"http://127.0.0.1:9\"\ntimeout_secs = 1\n",
        );

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("swarmtrace/state.db")
    }

    fn seed_session(&self, session_id: &str) {
        let db = Database::open(&self.db_path()).expect("failed to open db");
        db.migrate().expect("failed to migrate db");

        let mut state = SessionState::new(session_id);
        state.cursor = 42;
        state.status = Some(RunStatus::Running);
        state
            .agents
            .insert("Researcher".to_string(), AgentStatus::Completed);
        state.agents.insert("Writer".to_string(), AgentStatus::Running);
        db.save_session_state(&state).expect("failed to save state");
        db.set_mark(session_id, "msg-1", MarkKind::Starred, true)
            .expect("failed to set mark");
    }
}

fn write_config(xdg_config: &Path, content: &str) {
    let dir = xdg_config.join("swarmtrace");
    fs::create_dir_all(&dir).expect("failed to create config dir");
    fs::write(dir.join("config.toml"), content).expect("failed to write config");
}

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../swarmtrace-core/tests/fixtures")
        .join(name)
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("swarmtrace"));

    let mut command = Command::new(bin_path);

    command
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute swarmtrace: {e}"))
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
        "swarmtrace {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

#[test]
fn help_lists_commands() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["--help"]);
    assert_success(&["--help"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["follow", "parse", "status", "clear"] {
        assert!(stdout.contains(command), "missing {command} in help:\n{stdout}");
    }
}

#[test]
fn parse_prints_timeline_for_transcript() {
    let env = CliTestEnv::new();
    let fixture = fixture_path("researcher-turn.md");
    let fixture_arg = fixture.to_string_lossy().into_owned();
    let args = ["parse", fixture_arg.as_str(), "--agent", "Researcher"];

    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("(6 events)"), "unexpected output:\n{stdout}");
    assert!(stdout.contains("Wrote research/notes.md"));
    assert!(stdout.contains("Researcher → Writer"));
    assert!(stdout.contains("✗ tool     read_file (research/missing.md)"));
}

#[test]
fn parse_json_is_machine_readable() {
    let env = CliTestEnv::new();
    let fixture = fixture_path("researcher-turn.md");
    let fixture_arg = fixture.to_string_lossy().into_owned();
    let args = ["parse", fixture_arg.as_str(), "--json"];

    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let events: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    let events = events.as_array().expect("expected a JSON array");
    assert_eq!(events.len(), 6);
    assert_eq!(events[0]["kind"], "tool");
    assert_eq!(events[0]["title"], "search (research/)");
    assert_eq!(events[5]["kind"], "handoff");
}

#[test]
fn parse_missing_file_fails() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["parse", "/nonexistent/transcript.md"]);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to read"), "unexpected stderr:\n{stderr}");
}

#[test]
fn status_reports_config_and_saved_sessions() {
    let env = CliTestEnv::new();
    env.seed_session("run-7");

    let output = run_bin(&env, &["status"]);
    assert_success(&["status"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("swarmtrace Configuration"));
    assert!(stdout.contains("Backend URL:     http://127.0.0.1:9"));
    assert!(stdout.contains("API Key:         <not set>"));
    assert!(stdout.contains("Backend:         unreachable"));
    assert!(stdout.contains("Saved Sessions:  1"));
    assert!(
        stdout.contains("run-7  offset 42  running  2 agent(s)"),
        "expected session row in stdout, got:\n{stdout}"
    );
}

#[test]
fn status_rejects_invalid_config_file() {
    let env = CliTestEnv::new();
    write_config(&env.xdg_config, "[backend\nbase_url = ");

    let output = run_bin(&env, &["status"]);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to load configuration"));
}

#[test]
fn clear_drops_saved_state() {
    let env = CliTestEnv::new();
    env.seed_session("run-7");

    let output = run_bin(&env, &["clear", "run-7"]);
    assert_success(&["clear", "run-7"], &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("Cleared saved state for run-7"));

    let db = Database::open(&env.db_path()).expect("failed to open db");
    db.migrate().expect("failed to migrate db");
    assert!(db.session_state("run-7").expect("query failed").is_none());
    assert!(db
        .marks("run-7", MarkKind::Starred)
        .expect("query failed")
        .is_empty());

    let again = run_bin(&env, &["clear", "run-7"]);
    assert_success(&["clear", "run-7"], &again);
    assert!(String::from_utf8_lossy(&again.stdout).contains("No saved state for run-7"));
}

#[test]
fn follow_against_unreachable_backend_fails_cleanly() {
    let env = CliTestEnv::new();
    write_config(
        &env.xdg_config,
        "[backend]\nbase_url = \"http://127.0.0.1:9\"\ntimeout_secs = 1\npoll_interval_ms = 10\nmax_poll_errors = 2\n",
    );

    let output = run_bin(&env, &["follow", "run-9", "--no-persist"]);
    assert!(!output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Follow finished: failed"), "unexpected stdout:\n{stdout}");

    let db = Database::open(&env.db_path()).expect("failed to open db");
    db.migrate().expect("failed to migrate db");
    let state = db
        .session_state("run-9")
        .expect("query failed")
        .expect("follow should save state");
    assert_eq!(state.cursor, 0);
}
