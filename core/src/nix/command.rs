//! Build engine command runner

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::decoder::ProgressDecoder;
use crate::error::Result;
use crate::exec::{trim_output, BoxedReader, Executor, Input, LocalExecutor, Output};

/// Decoder over a command's standard error
pub type LogDecoder = ProgressDecoder<BufReader<BoxedReader>>;

/// Consumes the structured log of a running engine command
#[async_trait]
pub trait ProgressReporter: Send {
    /// Run until the log ends, the token is cancelled or a fatal error is seen
    async fn run(&mut self, token: CancellationToken, decoder: LogDecoder) -> Result<()>;
}

/// Builder for one invocation of the build engine
pub struct NixCommand {
    subcommand: String,
    args: Vec<String>,
    executor: Arc<dyn Executor>,
    stdin: Option<BoxedReader>,
    privileged: bool,
    reporter: Option<Box<dyn ProgressReporter>>,
}

impl NixCommand {
    /// Create a command for an engine subcommand such as `build` or `copy`
    pub fn new(subcommand: impl Into<String>) -> Self {
        Self {
            subcommand: subcommand.into(),
            args: Vec::new(),
            executor: Arc::new(LocalExecutor::new()),
            stdin: None,
            privileged: false,
            reporter: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn stdin(mut self, reader: BoxedReader) -> Self {
        self.stdin = Some(reader);
        self
    }

    /// Run through `sudo`
    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Render progress from the structured log while the command runs
    pub fn reporter(mut self, reporter: Box<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Program and arguments this command will run
    pub fn command_line(&self) -> (String, Vec<String>) {
        let mut program = "nix".to_string();
        let mut args = Vec::new();

        if self.privileged {
            program = "sudo".to_string();
            args.push("nix".to_string());
        }

        args.push(self.subcommand.clone());
        args.extend(["--extra-experimental-features", "nix-command"].map(String::from));
        args.extend(self.args.iter().cloned());
        if self.subcommand == "build" {
            args.push("--print-out-paths".to_string());
        }
        if self.reporter.is_some() {
            args.extend(["--log-format", "internal-json", "-v"].map(String::from));
        }

        (program, args)
    }

    /// Run the command and return its trimmed standard output
    pub async fn run(mut self, token: CancellationToken) -> Result<String> {
        let (program, args) = self.command_line();
        debug!("Running {} {}", program, args.join(" "));

        let out = match self.reporter.take() {
            Some(reporter) => self.run_with_reporter(token, &program, &args, reporter).await?,
            None => self.run_stdout(token, &program, &args).await?,
        };

        Ok(String::from_utf8_lossy(trim_output(&out)).into_owned())
    }

    async fn run_stdout(
        self,
        token: CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<Vec<u8>> {
        let mut cmd = self.executor.command_context(token, program, args).await?;

        let mut stdout = cmd.stdout_pipe();
        cmd.set_stderr(Output::Inherit);
        if let Some(stdin) = self.stdin {
            cmd.set_stdin(Input::Reader(stdin));
        }

        cmd.start().await?;

        let mut buf = Vec::new();
        let (read, wait) = tokio::join!(stdout.read_to_end(&mut buf), cmd.wait());
        wait?;
        read?;

        Ok(buf)
    }

    async fn run_with_reporter(
        self,
        token: CancellationToken,
        program: &str,
        args: &[String],
        mut reporter: Box<dyn ProgressReporter>,
    ) -> Result<Vec<u8>> {
        let token = token.child_token();
        let signals = tokio::spawn(cancel_on_signal(token.clone()));

        let mut cmd = self
            .executor
            .command_context(token.clone(), program, args)
            .await?;

        let mut stdout = cmd.stdout_pipe();
        let stderr = cmd.stderr_pipe();
        if let Some(stdin) = self.stdin {
            cmd.set_stdin(Input::Reader(stdin));
        }

        if let Err(e) = cmd.start().await {
            signals.abort();
            return Err(e);
        }

        let decoder = ProgressDecoder::new(BufReader::new(stderr));

        let report = async {
            let result = reporter.run(token.clone(), decoder).await;
            if result.is_err() {
                token.cancel();
            }
            result
        };

        let wait = async {
            let mut buf = Vec::new();
            let (read, wait) = tokio::join!(stdout.read_to_end(&mut buf), cmd.wait());
            if wait.is_err() {
                token.cancel();
            }
            (read.map(|_| buf), wait)
        };

        let (reported, (read, waited)) = tokio::join!(report, wait);
        signals.abort();

        // A fatal engine message explains more than the exit status does
        reported?;
        waited?;

        Ok(read?)
    }
}

/// Cancel the token on SIGINT or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for interrupts: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Interrupted, stopping build"),
        _ = terminate => info!("Terminated, stopping build"),
        _ = token.cancelled() => return,
    }

    token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullReporter;

    #[async_trait]
    impl ProgressReporter for NullReporter {
        async fn run(&mut self, _token: CancellationToken, _decoder: LogDecoder) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_build_command_line() {
        let (program, args) = NixCommand::new("build")
            .args(["-f", "nilla.nix", "systems.nixos.host"])
            .command_line();

        assert_eq!(program, "nix");
        assert_eq!(
            args,
            vec![
                "build",
                "--extra-experimental-features",
                "nix-command",
                "-f",
                "nilla.nix",
                "systems.nixos.host",
                "--print-out-paths",
            ]
        );
    }

    #[test]
    fn test_privileged_reporter_command_line() {
        let (program, args) = NixCommand::new("copy")
            .args(["--to", "ssh://builder", "/nix/store/abc-foo"])
            .privileged(true)
            .reporter(Box::new(NullReporter))
            .command_line();

        assert_eq!(program, "sudo");
        assert_eq!(
            args,
            vec![
                "nix",
                "copy",
                "--extra-experimental-features",
                "nix-command",
                "--to",
                "ssh://builder",
                "/nix/store/abc-foo",
                "--log-format",
                "internal-json",
                "-v",
            ]
        );
    }
}
