use axum::{Json, Router, routing::post};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Stores `{"runs": n}` as memory, logs a line and returns its input.
const COUNTER_AGENT: &str = r#"(module
  (import "agent" "set_memory" (func $mset (param i32 i32) (result i32)))
  (import "agent" "log" (func $log (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "{\"runs\":1}")
  (data (i32.const 32) "counted")
  (func (export "run")
    (drop (call $log (i32.const 32) (i32.const 7) (i32.const 0) (i32.const 0)))
    (drop (call $mset (i32.const 0) (i32.const 10)))))"#;

/// Posts to Slack and returns the reply.
const NOTIFY_AGENT: &str = r#"(module
  (import "agent" "send_message" (func $send (param i32 i32 i32 i32) (result i32)))
  (import "agent" "read_response" (func $resp (param i32 i32) (result i32)))
  (import "agent" "set_output" (func $out (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "general")
  (data (i32.const 16) "build finished")
  (func (export "run")
    (local $n i32)
    (local.set $n (call $send (i32.const 0) (i32.const 7) (i32.const 16) (i32.const 14)))
    ;; leave a failure unread so it fails the run
    (if (i32.lt_s (local.get $n) (i32.const 0)) (then (return)))
    (local.set $n (call $resp (i32.const 256) (i32.const 1024)))
    (drop (call $out (i32.const 256) (local.get $n)))))"#;

struct Cli {
    data_dir: TempDir,
}

impl Cli {
    fn new() -> TestResult<Self> {
        Ok(Self {
            data_dir: tempfile::tempdir()?,
        })
    }

    fn path(&self) -> &Path {
        self.data_dir.path()
    }

    async fn run(&self, args: &[&str]) -> TestResult<Output> {
        let output = tokio::process::Command::new(env!("CARGO_BIN_EXE_flowforge"))
            .args(args)
            .env("FLOWFORGE_DATA_DIR", self.path())
            .env("FLOWFORGE_ENCRYPTION_KEY", "e2e-passphrase")
            .output()
            .await?;
        Ok(output)
    }

    async fn ok(&self, args: &[&str]) -> TestResult<String> {
        let output = self.run(args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(format!(
                "flowforge {:?} failed ({}): {}{}",
                args,
                output.status,
                stdout,
                String::from_utf8_lossy(&output.stderr)
            )
            .into());
        }
        Ok(stdout)
    }

    fn write_spec(&self, name: &str, code: &str, agent_type: &str) -> TestResult<PathBuf> {
        let path = self.path().join(format!("{}.json", name));
        let spec = json!({
            "name": name,
            "description": format!("{} agent", name),
            "agentType": agent_type,
            "capabilities": ["messaging"],
            "generatedCode": code,
            "configuration": {"interval_minutes": 30}
        });
        std::fs::write(&path, serde_json::to_vec_pretty(&spec)?)?;
        Ok(path)
    }

    async fn create(&self, name: &str, code: &str) -> TestResult<String> {
        let spec = self.write_spec(name, code, "autonomous")?;
        let stdout = self
            .ok(&["agent", "create", "--owner", "u1", "--spec", spec.to_str().unwrap_or_default()])
            .await?;
        agent_id(&stdout).ok_or_else(|| format!("no agent id in: {}", stdout).into())
    }
}

fn agent_id(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("Id: "))
        .map(|id| id.trim().to_string())
}

/// JSON document printed after the "finished in" line of `agent run`.
fn run_output(stdout: &str) -> TestResult<Value> {
    let start = stdout.find('{').ok_or("no JSON in run output")?;
    Ok(serde_json::from_str(stdout[start..].trim())?)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_run_and_inspect_an_agent() -> TestResult<()> {
    let cli = Cli::new()?;
    let id = cli.create("counter", COUNTER_AGENT).await?;

    let listed = cli.ok(&["agent", "list", "--owner", "u1"]).await?;
    assert!(listed.contains(&id));
    assert!(listed.contains("DEPLOYED"));

    let stdout = cli.ok(&["agent", "run", &id, "--input", r#"{"label":"inbox"}"#]).await?;
    assert_eq!(run_output(&stdout)?, json!({"label": "inbox"}));

    let executions = cli.ok(&["agent", "executions", &id]).await?;
    assert!(executions.contains("manual"));
    assert!(executions.contains("SUCCESS"));

    let logs = cli.ok(&["agent", "logs", &id]).await?;
    assert!(logs.contains("counted"));

    let memory = cli.ok(&["agent", "memory", &id]).await?;
    assert_eq!(serde_json::from_str::<Value>(&memory)?, json!({"runs": 1}));

    assert!(cli.path().join("flowforge.log").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_code_is_refused() -> TestResult<()> {
    let cli = Cli::new()?;
    let spec = cli.write_spec("broken", "(module (func", "autonomous")?;
    let output = cli
        .run(&["agent", "create", "--owner", "u1", "--spec", spec.to_str().unwrap_or_default()])
        .await?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("validation failed"));

    let listed = cli.ok(&["agent", "list", "--owner", "u1"]).await?;
    assert!(listed.contains("No agents yet."));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_agent_cannot_run() -> TestResult<()> {
    let cli = Cli::new()?;
    let id = cli.create("counter", COUNTER_AGENT).await?;
    cli.ok(&["agent", "stop", &id]).await?;

    let shown = cli.ok(&["agent", "show", &id]).await?;
    assert!(shown.contains("STOPPED"));

    let output = cli.run(&["agent", "run", &id]).await?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("is stopped"));

    cli.ok(&["agent", "delete", &id]).await?;
    let output = cli.run(&["agent", "show", &id]).await?;
    assert!(String::from_utf8_lossy(&output.stderr).contains("not found"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stored_credential_reaches_the_service() -> TestResult<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let router = Router::new().route(
        "/api/chat.postMessage",
        post(move |Json(body): Json<Value>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Json(json!({"ok": true, "channel": body["channel"]}))
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    let cli = Cli::new()?;
    std::fs::write(
        cli.path().join("flowforge.toml"),
        format!("[services]\nslack_url = \"http://{}\"\n", addr),
    )?;
    let id = cli.create("notify", NOTIFY_AGENT).await?;

    // Without a credential the capability fails and the execution is an error.
    let output = cli.run(&["agent", "run", &id]).await?;
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("slack is not configured"));

    cli.ok(&[
        "credential", "set", "--owner", "u1", "--service", "slack", "--payload", r#"{"token":"xoxb-test"}"#,
    ])
    .await?;
    let stdout = cli.ok(&["agent", "run", &id]).await?;
    assert_eq!(run_output(&stdout)?["ok"], json!(true));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    cli.ok(&["credential", "disable", "--owner", "u1", "--service", "slack"]).await?;
    let output = cli.run(&["agent", "run", &id]).await?;
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn help_lists_commands() -> TestResult<()> {
    let cli = Cli::new()?;
    let stdout = cli.ok(&["help"]).await?;
    for command in ["serve", "agent", "credential"] {
        assert!(stdout.contains(command));
    }
    Ok(())
}
