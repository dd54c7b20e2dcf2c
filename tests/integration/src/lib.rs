//! Integration test library - common utilities

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cfgbuild_core::exec::{Command, Executor, LocalExecutor};
use cfgbuild_core::Result;
use serde_json::Value;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Scripted stand-ins for the external tools, run through `sh`
pub struct FakeTools {
    dir: TempDir,
    programs: HashMap<String, PathBuf>,
}

impl FakeTools {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("Failed to create temp dir"),
            programs: HashMap::new(),
        }
    }

    /// Replace `name` with a shell script body
    pub fn program(mut self, name: &str, body: &str) -> Self {
        let script = self.dir.path().join(format!("{}.sh", name));
        std::fs::write(&script, body).expect("Failed to write fake program");
        self.programs.insert(name.to_string(), script);
        self
    }

    /// Scratch directory the scripts live in
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Local executor that runs the fakes in place of the real tools
    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::new(FakeToolsExecutor {
            programs: self.programs.clone(),
            local: LocalExecutor::new(),
        })
    }
}

impl Default for FakeTools {
    fn default() -> Self {
        Self::new()
    }
}

struct FakeToolsExecutor {
    programs: HashMap<String, PathBuf>,
    local: LocalExecutor,
}

#[async_trait]
impl Executor for FakeToolsExecutor {
    async fn command_context(
        &self,
        token: CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<Box<dyn Command>> {
        match self.programs.get(program) {
            Some(script) => {
                let mut sh_args = vec![script.to_string_lossy().into_owned()];
                sh_args.extend(args.iter().cloned());
                self.local.command_context(token, "sh", &sh_args).await
            }
            None => self.local.command_context(token, program, args).await,
        }
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        self.local.path_exists(path).await
    }

    fn is_local(&self) -> bool {
        true
    }
}

/// One structured log line
pub fn log_line(event: Value) -> String {
    format!("@nix {}", event)
}

/// Script body of a build engine that logs to stderr, prints `stdout` and
/// exits with `code`
pub fn engine_script(log: &[String], stdout: &str, code: i32) -> String {
    let mut script = String::from("cat >&2 <<'LOG'\n");
    for line in log {
        script.push_str(line);
        script.push('\n');
    }
    script.push_str("LOG\n");
    if !stdout.is_empty() {
        script.push_str(&format!("echo '{}'\n", stdout));
    }
    script.push_str(&format!("exit {}\n", code));
    script
}

/// Log of a single successful build
pub fn build_log(drv: &str) -> Vec<String> {
    vec![
        log_line(serde_json::json!({"action": "start", "id": 1, "type": 104, "parent": 0})),
        log_line(serde_json::json!({
            "action": "start", "id": 2, "type": 105, "parent": 1,
            "fields": [drv], "text": format!("building '{}'", drv),
        })),
        log_line(serde_json::json!({"action": "result", "id": 2, "type": 104, "fields": ["buildPhase"]})),
        log_line(serde_json::json!({"action": "result", "id": 2, "type": 101, "fields": ["compiling"]})),
        log_line(serde_json::json!({"action": "result", "id": 1, "type": 105, "fields": [1, 1, 0, 0]})),
        log_line(serde_json::json!({"action": "stop", "id": 2})),
        log_line(serde_json::json!({"action": "stop", "id": 1})),
    ]
}
