//! Process execution on the local host or over a remote session
//!
//! An [`Executor`] hands out single-use [`Command`]s. The local executor maps
//! straight onto OS processes; the SSH executor opens one session channel per
//! command on a shared, authenticated connection.

use std::borrow::Cow;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

mod local;
mod ssh;
mod ssh_config;
mod stdin;
mod target;

pub use local::{LocalCommand, LocalExecutor};
pub use ssh::{SshCommand, SshExecutor};
pub use ssh_config::{HostConfig, SshConfig};
pub use target::Target;

/// Boxed async reader handed out for output pipes
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed async writer handed out for the input pipe
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Buffer size of the in-memory pipes
const PIPE_CAPACITY: usize = 64 * 1024;

/// Where a command reads its standard input from
#[derive(Default)]
pub enum Input {
    /// Nothing, the command sees end-of-file
    #[default]
    Null,
    /// The standard input of this process
    Inherit,
    /// An arbitrary reader
    Reader(BoxedReader),
}

/// Where a command's standard output or error goes
#[derive(Default)]
pub enum Output {
    /// Discarded
    #[default]
    Null,
    /// The corresponding stream of this process
    Inherit,
    /// An arbitrary writer
    Writer(BoxedWriter),
}

/// Something that can create commands and inspect paths in one context
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Executor: Send + Sync {
    /// Create a command that is never cancelled
    async fn command(&self, program: &str, args: &[String]) -> Result<Box<dyn Command>> {
        self.command_context(CancellationToken::new(), program, args)
            .await
    }

    /// Create a command bound to a cancellation token
    async fn command_context(
        &self,
        token: CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<Box<dyn Command>>;

    /// Check whether a path exists in this context
    async fn path_exists(&self, path: &str) -> Result<bool>;

    /// Whether commands run on this host
    fn is_local(&self) -> bool;
}

/// A single-use process handle
#[async_trait]
pub trait Command: Send {
    /// Program this command runs
    fn program(&self) -> &str;

    /// Bind standard input
    fn set_stdin(&mut self, input: Input);

    /// Bind standard output
    fn set_stdout(&mut self, output: Output);

    /// Bind standard error
    fn set_stderr(&mut self, output: Output);

    /// Start the command without waiting for it
    async fn start(&mut self) -> Result<()>;

    /// Wait for a started command to finish
    async fn wait(&mut self) -> Result<()>;

    /// Start the command and wait for it
    async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.wait().await
    }

    /// Obtain a writer connected to standard input
    fn stdin_pipe(&mut self) -> BoxedWriter {
        let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
        self.set_stdin(Input::Reader(Box::new(reader)));
        Box::new(writer)
    }

    /// Obtain a reader connected to standard output
    fn stdout_pipe(&mut self) -> BoxedReader {
        let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
        self.set_stdout(Output::Writer(Box::new(writer)));
        Box::new(reader)
    }

    /// Obtain a reader connected to standard error
    fn stderr_pipe(&mut self) -> BoxedReader {
        let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
        self.set_stderr(Output::Writer(Box::new(writer)));
        Box::new(reader)
    }

    /// Run the command and collect its standard output
    async fn output(&mut self) -> Result<Vec<u8>> {
        let mut stdout = self.stdout_pipe();
        self.start().await?;

        let mut buf = Vec::new();
        let read = stdout.read_to_end(&mut buf).await;
        drop(stdout);

        self.wait().await?;
        read?;

        Ok(buf)
    }
}

/// Quote an argument for a POSIX shell if it needs it
pub fn shell_quote(arg: &str) -> Cow<'_, str> {
    let safe = |c: char| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c);

    if !arg.is_empty() && arg.chars().all(safe) {
        return Cow::Borrowed(arg);
    }

    Cow::Owned(format!("'{}'", arg.replace('\'', r#"'"'"'"#)))
}

/// Build the textual command line sent to a remote shell
pub fn command_line(program: &str, args: &[String]) -> String {
    let mut line = shell_quote(program).into_owned();
    for arg in args {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    line
}

/// Trim ASCII whitespace from both ends of a byte buffer
pub fn trim_output(buf: &[u8]) -> &[u8] {
    let start = buf
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(buf.len());
    let end = buf
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &buf[start..end]
}
