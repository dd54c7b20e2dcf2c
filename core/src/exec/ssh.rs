//! Remote execution over SSH
//!
//! One authenticated connection is shared by every command the executor
//! creates, and each command gets its own session channel.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect, Pty, Sig};
use russh_keys::agent::client::AgentClient;
use russh_keys::key::PublicKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stdin::SharedStdin;
use super::{command_line, BoxedReader, BoxedWriter, Command, Executor, Input, Output};
use super::{HostConfig, SshConfig, Target};
use crate::config::Settings;
use crate::error::{Error, Result};

const DEFAULT_PORT: u16 = 22;

const DEFAULT_IDENTITIES: &[&str] = &[
    "id_dsa",
    "id_ecdsa",
    "id_ecdsa_sk",
    "id_ed25519",
    "id_ed25519_sk",
    "id_xmss",
    "id_rsa",
];

/// Program that triggers pseudo-terminal allocation
const ELEVATION_PROGRAM: &str = "sudo";

/// Verifies the server key against known hosts files
struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: Vec<PathBuf>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        for path in &self.known_hosts {
            match russh_keys::check_known_hosts_path(&self.host, self.port, server_public_key, path)
            {
                Ok(true) => {
                    debug!("Host key for {} found in {}", self.host, path.display());
                    return Ok(true);
                }
                Ok(false) => {}
                Err(russh_keys::Error::KeyChanged { line }) => {
                    warn!(
                        "Host key for {} changed ({}:{})",
                        self.host,
                        path.display(),
                        line
                    );
                    return Err(Error::HostKeyRejected {
                        host: self.host.clone(),
                    });
                }
                Err(e) => debug!("Skipping known hosts file {}: {}", path.display(), e),
            }
        }

        warn!("Host key for {} is not known", self.host);
        Err(Error::HostKeyRejected {
            host: self.host.clone(),
        })
    }
}

/// Executor that runs commands on a remote host
pub struct SshExecutor {
    handle: Handle<ClientHandler>,
    target: String,
    stdin: Arc<SharedStdin>,
}

impl SshExecutor {
    /// Connect and authenticate to `[user@]host[:port]`
    pub async fn connect(settings: &Settings, target: &str) -> Result<Self> {
        let target: Target = target.parse()?;
        let ssh_config = SshConfig::load(&settings.ssh_config_file()).await?;
        let host_config = ssh_config.host_config(&target.host);

        let port = target.port.or(host_config.port).unwrap_or(DEFAULT_PORT);
        let user = target
            .user
            .clone()
            .or_else(|| host_config.user.clone())
            .unwrap_or_else(|| settings.user.clone());
        let address = host_config
            .hostname
            .clone()
            .unwrap_or_else(|| target.host.clone());

        let handler = ClientHandler {
            host: known_host_name(&target.host, &host_config),
            port,
            known_hosts: known_hosts_files(settings, &host_config),
        };

        info!("Connecting to {}@{}:{}", user, address, port);
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, (address.as_str(), port), handler)
            .await
            .map_err(|e| match e {
                Error::HostKeyRejected { .. } => e,
                other => Error::Connect {
                    target: format!("{}:{}", address, port),
                    reason: other.to_string(),
                },
            })?;

        authenticate(&mut handle, settings, &host_config, &user, &target.host).await?;
        info!("Authenticated as {} on {}", user, target.host);

        Ok(Self {
            handle,
            target: target.to_string(),
            stdin: Arc::new(SharedStdin::new()),
        })
    }

    /// Close the connection
    pub async fn disconnect(&self) -> Result<()> {
        debug!("Disconnecting from {}", self.target);
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Executor for SshExecutor {
    async fn command_context(
        &self,
        token: CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<Box<dyn Command>> {
        let channel = self.handle.channel_open_session().await?;
        Ok(Box::new(SshCommand::new(
            channel,
            token,
            self.stdin.clone(),
            program,
            args,
        )))
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        let mut cmd = self.command("ls", &[path.to_string()]).await?;
        match cmd.run().await {
            Ok(()) => Ok(true),
            Err(e) if e.is_exit_status() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn is_local(&self) -> bool {
        false
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    settings: &Settings,
    host_config: &HostConfig,
    user: &str,
    host: &str,
) -> Result<()> {
    if !host_config.identities_only {
        if let Some(socket) = agent_socket(settings, host_config) {
            if authenticate_agent(handle, user, &socket).await? {
                return Ok(());
            }
        }
    }

    for path in identity_files(settings, host_config) {
        if !path.exists() {
            continue;
        }

        let key = match russh_keys::load_secret_key(&path, None) {
            Ok(key) => key,
            Err(e) => {
                debug!("Skipping identity {}: {}", path.display(), e);
                continue;
            }
        };

        debug!("Trying identity {}", path.display());
        if handle.authenticate_publickey(user, Arc::new(key)).await? {
            return Ok(());
        }
    }

    if std::io::stdin().is_terminal() {
        let password = prompt_password(user, host).await?;
        if handle.authenticate_password(user, password).await? {
            return Ok(());
        }
    }

    Err(Error::AuthenticationFailed {
        user: user.to_string(),
        host: host.to_string(),
    })
}

async fn authenticate_agent(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    socket: &Path,
) -> Result<bool> {
    let mut agent = match AgentClient::connect_uds(socket).await {
        Ok(agent) => agent,
        Err(e) => {
            debug!("SSH agent at {} unavailable: {}", socket.display(), e);
            return Ok(false);
        }
    };

    let identities = match agent.request_identities().await {
        Ok(identities) => identities,
        Err(e) => {
            debug!("Failed to list agent identities: {}", e);
            return Ok(false);
        }
    };

    for key in identities {
        debug!("Trying agent identity {}", key.fingerprint());
        let (returned, result) = handle.authenticate_future(user, key, agent).await;
        agent = returned;

        match result {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => debug!("Agent signing failed: {}", e),
        }
    }

    Ok(false)
}

async fn prompt_password(user: &str, host: &str) -> Result<String> {
    let prompt = format!("{}@{}'s password", user, host);
    tokio::task::spawn_blocking(move || {
        dialoguer::Password::new()
            .with_prompt(prompt)
            .allow_empty_password(true)
            .interact()
    })
    .await
    .map_err(std::io::Error::other)?
    .map_err(|e| match e {
        dialoguer::Error::IO(e) => Error::Io(e),
    })
}

/// Agent socket to use, `None` when agents are disabled or unavailable
fn agent_socket(settings: &Settings, host_config: &HostConfig) -> Option<PathBuf> {
    match host_config.identity_agent.as_deref() {
        Some("none") => None,
        Some("SSH_AUTH_SOCK") | None => settings.ssh_auth_sock.clone(),
        Some(path) => Some(settings.resolve_path(path)),
    }
}

/// Configured identity files followed by the default key names
fn identity_files(settings: &Settings, host_config: &HostConfig) -> Vec<PathBuf> {
    let ssh_dir = settings.ssh_dir();

    host_config
        .identity_files
        .iter()
        .map(|f| settings.resolve_path(f))
        .chain(DEFAULT_IDENTITIES.iter().map(|name| ssh_dir.join(name)))
        .collect()
}

/// Name the host key is recorded under, as `ssh` looks it up
fn known_host_name(host: &str, host_config: &HostConfig) -> String {
    host_config
        .host_key_alias
        .as_deref()
        .or(host_config.hostname.as_deref())
        .unwrap_or(host)
        .to_string()
}

/// Known hosts files to check, only existing ones when configured explicitly
fn known_hosts_files(settings: &Settings, host_config: &HostConfig) -> Vec<PathBuf> {
    if host_config.known_hosts_files.is_empty() {
        return vec![settings.ssh_dir().join("known_hosts")];
    }

    host_config
        .known_hosts_files
        .iter()
        .map(|f| settings.resolve_path(f))
        .filter(|p| p.exists())
        .collect()
}

/// Keeps the local terminal in raw mode until dropped
struct RawModeGuard {
    restore: fn() -> std::io::Result<()>,
}

impl RawModeGuard {
    fn acquire() -> Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self {
            restore: crossterm::terminal::disable_raw_mode,
        })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = (self.restore)() {
            warn!("Failed to restore terminal mode: {}", e);
        }
    }
}

/// The parts of a session channel a running command uses
#[async_trait]
trait SessionChannel: Send {
    async fn recv(&mut self) -> Option<ChannelMsg>;

    async fn send_data(&mut self, data: &[u8]) -> Result<()>;

    async fn send_eof(&mut self) -> Result<()>;

    async fn send_signal(&mut self, signal: Sig) -> Result<()>;
}

#[async_trait]
impl SessionChannel for Channel<Msg> {
    async fn recv(&mut self) -> Option<ChannelMsg> {
        self.wait().await
    }

    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        Ok(self.data(data).await?)
    }

    async fn send_eof(&mut self) -> Result<()> {
        Ok(self.eof().await?)
    }

    async fn send_signal(&mut self, signal: Sig) -> Result<()> {
        Ok(self.signal(signal).await?)
    }
}

/// How the remote command ended
#[derive(Debug)]
enum RemoteExit {
    Status(u32),
    Signal(String),
}

/// A command running in an SSH session channel
pub struct SshCommand {
    program: String,
    line: String,
    elevated: bool,
    token: CancellationToken,
    channel: Option<Channel<Msg>>,
    shared_stdin: Arc<SharedStdin>,
    stdin: Input,
    stdout: Output,
    stderr: Output,
    task: Option<JoinHandle<Result<Option<RemoteExit>>>>,
    raw_mode: Option<RawModeGuard>,
}

impl SshCommand {
    fn new(
        channel: Channel<Msg>,
        token: CancellationToken,
        shared_stdin: Arc<SharedStdin>,
        program: &str,
        args: &[String],
    ) -> Self {
        Self {
            program: program.to_string(),
            line: command_line(program, args),
            elevated: program == ELEVATION_PROGRAM,
            token,
            channel: Some(channel),
            shared_stdin,
            stdin: Input::Null,
            stdout: Output::Null,
            stderr: Output::Null,
            task: None,
            raw_mode: None,
        }
    }
}

#[async_trait]
impl Command for SshCommand {
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
        let channel = self.channel.take().ok_or(Error::AlreadyStarted)?;

        if self.token.is_cancelled() {
            debug!("Not starting remote {}, already cancelled", self.program);
            return Err(Error::Cancelled);
        }

        let stdin = std::mem::take(&mut self.stdin);
        let interactive = matches!(stdin, Input::Inherit) && std::io::stdin().is_terminal();

        if self.elevated && interactive {
            let (cols, rows) = crossterm::terminal::size()?;
            let guard = RawModeGuard::acquire()?;

            debug!("Requesting pty {}x{} for {}", cols, rows, self.program);
            channel
                .request_pty(
                    false,
                    "xterm-256color",
                    cols as u32,
                    rows as u32,
                    0,
                    0,
                    &[
                        (Pty::ECHO, 0),
                        (Pty::TTY_OP_ISPEED, 14400),
                        (Pty::TTY_OP_OSPEED, 14400),
                    ],
                )
                .await?;

            self.raw_mode = Some(guard);
        }

        let stdin: Option<BoxedReader> = match stdin {
            Input::Null => None,
            Input::Inherit => Some(Box::new(self.shared_stdin.reader().await?)),
            Input::Reader(reader) => Some(reader),
        };

        debug!("Executing remote command: {}", self.line);
        channel.exec(true, self.line.as_bytes()).await?;

        if stdin.is_none() {
            channel.eof().await?;
        }

        let stdout = writer_for(std::mem::take(&mut self.stdout), tokio::io::stdout);
        let stderr = writer_for(std::mem::take(&mut self.stderr), tokio::io::stderr);

        let token = self.token.clone();
        self.task = Some(tokio::spawn(async move {
            let mut channel = channel;
            drive(&mut channel, token, stdin, stdout, stderr).await
        }));

        Ok(())
    }

    async fn wait(&mut self) -> Result<()> {
        let task = self.task.take().ok_or(Error::NotStarted)?;
        let exit = settle(task, self.raw_mode.take()).await?;
        exit_result(&self.program, exit)
    }
}

/// Join the channel task, restoring the terminal before anything is reported
async fn settle(
    task: JoinHandle<Result<Option<RemoteExit>>>,
    raw_mode: Option<RawModeGuard>,
) -> Result<Option<RemoteExit>> {
    let outcome = task.await;
    drop(raw_mode);
    outcome.map_err(std::io::Error::other)?
}

fn exit_result(program: &str, exit: Option<RemoteExit>) -> Result<()> {
    match exit {
        Some(RemoteExit::Status(0)) => Ok(()),
        Some(RemoteExit::Status(code)) => {
            debug!("{} exited with status {}", program, code);
            Err(Error::ExitStatus {
                program: program.to_string(),
                code: code as i32,
            })
        }
        Some(RemoteExit::Signal(signal)) => Err(Error::Signalled {
            program: program.to_string(),
            signal,
        }),
        None => Err(Error::MissingExitStatus {
            program: program.to_string(),
        }),
    }
}

fn writer_for<W, F>(output: Output, inherit: F) -> Option<BoxedWriter>
where
    W: tokio::io::AsyncWrite + Send + Unpin + 'static,
    F: FnOnce() -> W,
{
    match output {
        Output::Null => None,
        Output::Inherit => Some(Box::new(inherit())),
        Output::Writer(writer) => Some(writer),
    }
}

async fn read_some(reader: &mut Option<BoxedReader>, buf: &mut [u8]) -> std::io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn write_all(writer: &mut Option<BoxedWriter>, data: &[u8]) -> Result<()> {
    if let Some(writer) = writer {
        match writer.write_all(data).await {
            Ok(()) => writer.flush().await?,
            // Nobody is reading any more, keep draining the channel
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Shuttle data between the channel and the bound streams until it closes
async fn drive<C: SessionChannel>(
    channel: &mut C,
    token: CancellationToken,
    mut stdin: Option<BoxedReader>,
    mut stdout: Option<BoxedWriter>,
    mut stderr: Option<BoxedWriter>,
) -> Result<Option<RemoteExit>> {
    let mut buf = vec![0u8; 32 * 1024];
    let mut interrupted = false;
    let mut exit = None;

    loop {
        tokio::select! {
            _ = token.cancelled(), if !interrupted => {
                interrupted = true;
                debug!("Forwarding interrupt to remote command");
                if let Err(e) = channel.send_signal(Sig::INT).await {
                    warn!("Failed to forward interrupt: {}", e);
                }
            }
            read = read_some(&mut stdin, &mut buf), if stdin.is_some() => {
                match read {
                    Ok(0) | Err(_) => {
                        stdin = None;
                        channel.send_eof().await?;
                    }
                    Ok(n) => channel.send_data(&buf[..n]).await?,
                }
            }
            msg = channel.recv() => match msg {
                Some(ChannelMsg::Data { data }) => write_all(&mut stdout, &data).await?,
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    write_all(&mut stderr, &data).await?
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    exit = Some(RemoteExit::Status(exit_status));
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    exit = Some(RemoteExit::Signal(format!("SIG{:?}", signal_name)));
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    for writer in [stdout.as_mut(), stderr.as_mut()].into_iter().flatten() {
        let _ = writer.shutdown().await;
    }

    Ok(exit)
}
