//! Command-backed work functions.
//!
//! Each task type maps to an executable. The task's parameters are written
//! to the child's stdin as JSON; a zero exit means success and stdout is
//! parsed as the JSON result payload. Exit code 75 (`EX_TEMPFAIL`) is a
//! transient failure, any other non-zero exit is permanent.
//!
//! Task types are declared in TOML files, one per type:
//!
//! ```toml
//! [task_type]
//! name = "fetch"
//! command = "./bin/fetch.sh"
//! args = ["--verbose"]
//!
//! [task_type.params]
//! id = { kind = "string" }
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{ParamSchema, WorkError, WorkFunction, WorkRegistry};
use crate::error::{Error, Result};

/// Exit status a command uses to ask for a retry.
pub const EX_TEMPFAIL: i32 = 75;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct TaskTypeFile {
    task_type: CommandSpec,
}

/// One command-backed task type.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub params: ParamSchema,
    #[serde(default)]
    pub version: Option<String>,
}

pub struct CommandWork {
    spec: CommandSpec,
}

impl CommandWork {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Resolve relative command paths against the process working directory.
    fn resolved_command(&self) -> std::io::Result<PathBuf> {
        let command = &self.spec.command;
        if command.is_relative() && command.components().count() > 1 {
            Ok(std::env::current_dir()?.join(command))
        } else {
            Ok(command.clone())
        }
    }
}

#[async_trait]
impl WorkFunction for CommandWork {
    fn schema(&self) -> ParamSchema {
        self.spec.params.clone()
    }

    fn version(&self) -> &str {
        self.spec.version.as_deref().unwrap_or(env!("CARGO_PKG_VERSION"))
    }

    async fn execute(&self, params: &Value) -> std::result::Result<Value, WorkError> {
        let command = self
            .resolved_command()
            .map_err(|e| WorkError::Transient(format!("cannot resolve command: {e}")))?;
        let input = serde_json::to_vec(params)
            .map_err(|e| WorkError::Permanent(format!("serialize parameters: {e}")))?;

        debug!(task_type = %self.spec.name, command = %command.display(), "running command");

        let mut child = Command::new(&command)
            .args(&self.spec.args)
            .env("TASKCLAIM_TASK_TYPE", &self.spec.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkError::Permanent(format!("spawn {}: {e}", command.display())))?;

        // Feed stdin from its own task while stdout and stderr drain, or a
        // command that writes before reading fills a pipe and stalls.
        // Dropping stdin closes it. A command that exits without reading
        // its input is judged by its exit status alone.
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                match stdin.write_all(&input).await {
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                    other => other,
                }
            })
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| WorkError::Transient(format!("wait for command: {e}")))?;

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(WorkError::Transient(format!("write stdin: {e}"))),
                Err(e) => return Err(WorkError::Transient(format!("stdin writer: {e}"))),
            }
        }

        match output.status.code() {
            Some(0) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if stdout.trim().is_empty() {
                    return Ok(Value::Null);
                }
                serde_json::from_str(stdout.trim())
                    .map_err(|e| WorkError::Permanent(format!("command printed invalid JSON: {e}")))
            }
            Some(EX_TEMPFAIL) => Err(WorkError::Transient(stderr_message(&output.stderr, EX_TEMPFAIL))),
            Some(code) => Err(WorkError::Permanent(stderr_message(&output.stderr, code))),
            // Killed by a signal.
            None => Err(WorkError::Transient("command terminated by signal".to_string())),
        }
    }
}

fn stderr_message(stderr: &[u8], code: i32) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("command exited with status {code}")
    } else {
        format!("command exited with status {code}: {stderr}")
    }
}

impl WorkRegistry {
    /// Load every `.toml` task type file in `dir` as a [`CommandWork`].
    pub fn load_commands_from_dir(dir: &Path) -> Result<Self> {
        let mut registry = WorkRegistry::new();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read task type dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let file: TaskTypeFile = toml::from_str(&content).map_err(|e| {
                    Error::Config(format!("bad task type file {}: {e}", path.display()))
                })?;
                let work = CommandWork::new(file.task_type);
                registry.register(work.name().to_string(), Arc::new(work));
            }
        }

        Ok(registry)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn sh(name: &str, script: &str) -> CommandWork {
        CommandWork::new(CommandSpec {
            name: name.to_string(),
            command: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            params: ParamSchema::new(),
            version: None,
        })
    }

    #[tokio::test]
    async fn success_parses_stdout_as_payload() {
        let work = sh("echo", "cat");
        let out = work.execute(&json!({"title": "y"})).await.unwrap();
        assert_eq!(out, json!({"title": "y"}));
    }

    #[tokio::test]
    async fn large_output_before_reading_input_completes() {
        // Prints well past a pipe buffer before touching stdin.
        let work = sh("chatty", "head -c 200000 /dev/zero >&2; cat");
        let blob = "x".repeat(300_000);
        let out = work.execute(&json!({ "blob": blob })).await.unwrap();
        assert_eq!(out["blob"].as_str().map(str::len), Some(300_000));
    }

    #[tokio::test]
    async fn tempfail_exit_is_transient() {
        let work = sh("flaky", "echo 'rate limited' >&2; exit 75");
        let err = work.execute(&json!({})).await.unwrap_err();
        assert_eq!(
            err,
            WorkError::Transient("command exited with status 75: rate limited".to_string())
        );
    }

    #[tokio::test]
    async fn other_exit_is_permanent() {
        let work = sh("broken", "exit 2");
        let err = work.execute(&json!({})).await.unwrap_err();
        assert!(matches!(err, WorkError::Permanent(_)));
    }

    #[tokio::test]
    async fn invalid_json_output_is_permanent() {
        let work = sh("garbled", "echo not-json");
        let err = work.execute(&json!({})).await.unwrap_err();
        assert!(matches!(err, WorkError::Permanent(_)));
    }

    #[test]
    fn loads_task_types_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("fetch.toml"),
            r#"
            [task_type]
            name = "fetch"
            command = "sh"
            args = ["-c", "cat"]

            [task_type.params]
            id = { kind = "string" }
            "#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let registry = WorkRegistry::load_commands_from_dir(dir.path()).unwrap();
        assert_eq!(registry.task_types(), vec!["fetch".to_string()]);
        let schema = registry.get("fetch").unwrap().schema();
        assert!(schema.validate(&json!({})).is_err());
    }

    #[test]
    fn missing_dir_is_a_config_error() {
        let err = WorkRegistry::load_commands_from_dir(Path::new("/nonexistent/taskclaim")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
