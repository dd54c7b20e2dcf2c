//! Local process execution

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Command, Executor, Input, Output};
use crate::error::{Error, Result};

/// Executor that spawns processes on this host
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn command_context(
        &self,
        token: CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<Box<dyn Command>> {
        Ok(Box::new(LocalCommand::new(token, program, args)))
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn is_local(&self) -> bool {
        true
    }
}

/// A process spawned on this host
pub struct LocalCommand {
    program: String,
    args: Vec<String>,
    token: CancellationToken,
    stdin: Input,
    stdout: Output,
    stderr: Output,
    child: Option<Child>,
    pumps: Vec<JoinHandle<std::io::Result<()>>>,
    started: bool,
}

impl LocalCommand {
    pub fn new(token: CancellationToken, program: &str, args: &[String]) -> Self {
        Self {
            program: program.to_string(),
            args: args.to_vec(),
            token,
            stdin: Input::Null,
            stdout: Output::Null,
            stderr: Output::Null,
            child: None,
            pumps: Vec::new(),
            started: false,
        }
    }

    async fn join_pumps(&mut self) -> Result<()> {
        let mut first_error = None;

        for pump in self.pumps.drain(..) {
            match pump.await {
                Ok(Ok(())) => {}
                // Reader hung up early, nothing left to deliver
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(Error::Io(e));
                }
                Err(e) => warn!("Stream pump for {} panicked: {}", self.program, e),
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Command for LocalCommand {
    fn program(&self) -> &str {
        &self.program
    }

    fn set_stdin(&mut self, input: Input) {
        self.stdin = input;
    }

    fn set_stdout(&mut self, output: Output) {
        self.stdout = output;
    }

    fn set_stderr(&mut self, output: Output) {
        self.stderr = output;
    }

    async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        self.started = true;

        if self.token.is_cancelled() {
            debug!("Not starting {}, already cancelled", self.program);
            return Err(Error::Cancelled);
        }

        let stdin = std::mem::take(&mut self.stdin);
        let stdout = std::mem::take(&mut self.stdout);
        let stderr = std::mem::take(&mut self.stderr);

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(input_stdio(&stdin))
            .stdout(output_stdio(&stdout))
            .stderr(output_stdio(&stderr));

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            program: self.program.clone(),
            source,
        })?;

        debug!("Started {} (pid {:?})", self.program, child.id());

        if let (Input::Reader(reader), Some(pipe)) = (stdin, child.stdin.take()) {
            self.pumps.push(tokio::spawn(pump(reader, pipe)));
        }
        if let (Output::Writer(writer), Some(pipe)) = (stdout, child.stdout.take()) {
            self.pumps.push(tokio::spawn(pump(pipe, writer)));
        }
        if let (Output::Writer(writer), Some(pipe)) = (stderr, child.stderr.take()) {
            self.pumps.push(tokio::spawn(pump(pipe, writer)));
        }

        self.child = Some(child);
        Ok(())
    }

    async fn wait(&mut self) -> Result<()> {
        let mut child = self.child.take().ok_or(Error::NotStarted)?;
        let pid = child.id();

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = self.token.cancelled() => {
                if let Some(pid) = pid {
                    debug!("Interrupting {} (pid {})", self.program, pid);
                    interrupt(pid);
                }
                child.wait().await?
            }
        };

        self.join_pumps().await?;

        if status.success() {
            return Ok(());
        }

        if let Some(code) = status.code() {
            debug!("{} exited with status {}", self.program, code);
            return Err(Error::ExitStatus {
                program: self.program.clone(),
                code,
            });
        }

        Err(Error::Signalled {
            program: self.program.clone(),
            signal: signal_name(&status),
        })
    }
}

fn input_stdio(input: &Input) -> Stdio {
    match input {
        Input::Null => Stdio::null(),
        Input::Inherit => Stdio::inherit(),
        Input::Reader(_) => Stdio::piped(),
    }
}

fn output_stdio(output: &Output) -> Stdio {
    match output {
        Output::Null => Stdio::null(),
        Output::Inherit => Stdio::inherit(),
        Output::Writer(_) => Stdio::piped(),
    }
}

/// Copy one stream into another until end-of-file, then close the writer
async fn pump<R, W>(mut reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::io::copy(&mut reader, &mut writer).await?;
    writer.shutdown().await
}

/// Deliver SIGINT to a process
fn interrupt(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        warn!("Failed to interrupt pid {}: {}", pid, e);
    }
}

fn signal_name(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(sig) => nix::sys::signal::Signal::try_from(sig)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| sig.to_string()),
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_output_captures_stdout() {
        let executor = LocalExecutor::new();
        let mut cmd = executor
            .command("sh", &args(&["-c", "echo hello"]))
            .await
            .unwrap();

        let out = cmd.output().await.unwrap();
        assert_eq!(out, b"hello\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_exit_status() {
        let executor = LocalExecutor::new();
        let mut cmd = executor
            .command("sh", &args(&["-c", "exit 3"]))
            .await
            .unwrap();

        let err = cmd.run().await.unwrap_err();
        assert!(err.is_exit_status());
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let executor = LocalExecutor::new();
        let mut cmd = executor.command("true", &[]).await.unwrap();

        cmd.start().await.unwrap();
        assert!(matches!(cmd.start().await, Err(Error::AlreadyStarted)));
        cmd.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_before_start_fails() {
        let executor = LocalExecutor::new();
        let mut cmd = executor.command("true", &[]).await.unwrap();
        assert!(matches!(cmd.wait().await, Err(Error::NotStarted)));
    }

    #[tokio::test]
    async fn test_stdin_and_stderr_pipes() {
        let executor = LocalExecutor::new();
        let mut cmd = executor
            .command("sh", &args(&["-c", "cat >&2"]))
            .await
            .unwrap();

        let mut stdin = cmd.stdin_pipe();
        let mut stderr = cmd.stderr_pipe();
        cmd.start().await.unwrap();

        stdin.write_all(b"piped through").await.unwrap();
        stdin.shutdown().await.unwrap();
        drop(stdin);

        let mut buf = String::new();
        stderr.read_to_string(&mut buf).await.unwrap();
        cmd.wait().await.unwrap();

        assert_eq!(buf, "piped through");
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_process() {
        let executor = LocalExecutor::new();
        let token = CancellationToken::new();
        let mut cmd = executor
            .command_context(token.clone(), "sleep", &args(&["30"]))
            .await
            .unwrap();

        cmd.start().await.unwrap();
        token.cancel();

        let err = cmd.wait().await.unwrap_err();
        assert!(matches!(err, Error::Signalled { ref signal, .. } if signal == "SIGINT"));
    }

    #[tokio::test]
    async fn test_cancelled_token_prevents_start() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");

        let executor = LocalExecutor::new();
        let token = CancellationToken::new();
        token.cancel();

        let script = format!("touch '{}'", marker.display());
        let mut cmd = executor
            .command_context(token, "sh", &args(&["-c", script.as_str()]))
            .await
            .unwrap();

        assert!(matches!(cmd.run().await, Err(Error::Cancelled)));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_path_exists() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();

        assert!(executor
            .path_exists(dir.path().to_str().unwrap())
            .await
            .unwrap());
        assert!(!executor
            .path_exists(dir.path().join("missing").to_str().unwrap())
            .await
            .unwrap());
    }
}
