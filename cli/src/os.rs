//! NixOS configuration workflow

use clap::{Args, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cfgbuild_core::diff::{self, Generation};
use cfgbuild_core::exec::{Executor, Input, LocalExecutor, Output, Target};
use cfgbuild_core::nix::NixCommand;
use cfgbuild_core::tui::{BuildReporter, CopyReporter};
use cfgbuild_core::Settings;

use crate::{print_section, Remote};

#[derive(Subcommand)]
pub enum OsCommand {
    /// Build NixOS configuration
    Build(BuildArgs),

    /// Build NixOS configuration and activate it
    Test(SystemArgs),

    /// Build NixOS configuration and make it the boot default
    Boot(SystemArgs),

    /// Build NixOS configuration, activate it and make it the boot default
    Switch(SystemArgs),
}

#[derive(Args)]
pub struct SystemArgs {
    /// Configuration name, defaults to the hostname
    pub name: Option<String>,

    /// Deploy to `[user@]host[:port]` instead of this machine
    #[arg(long)]
    pub target: Option<String>,
}

#[derive(Args)]
pub struct BuildArgs {
    #[command(flatten)]
    pub system: SystemArgs,

    /// Do not create symlinks to the build results
    #[arg(long)]
    pub no_link: bool,

    /// Use path as prefix for the symlinks to the build results
    #[arg(short, long)]
    pub out_link: Option<String>,

    /// Print the resulting output path
    #[arg(long)]
    pub print_out_paths: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Build,
    Test,
    Boot,
    Switch,
}

impl Action {
    fn activates(self) -> bool {
        matches!(self, Action::Test | Action::Switch)
    }

    fn sets_boot_default(self) -> bool {
        matches!(self, Action::Boot | Action::Switch)
    }
}

fn toplevel_attr(name: &str) -> String {
    format!("systems.nixos.{}.result.config.system.build.toplevel", name)
}

/// `nix build` arguments for a configuration
fn build_args(attr: String, no_link: bool, out_link: Option<String>) -> Vec<String> {
    let mut args = vec!["-f".to_string(), "nilla.nix".to_string(), attr];
    if no_link {
        args.push("--no-link".to_string());
    }
    if let Some(out_link) = out_link {
        args.extend(["--out-link".to_string(), out_link]);
    }
    args
}

pub async fn run(
    mut settings: Settings,
    token: CancellationToken,
    command: OsCommand,
) -> anyhow::Result<()> {
    // Only a plain build keeps result links
    let (action, system, no_link, out_link, print_out_paths) = match command {
        OsCommand::Build(args) => (
            Action::Build,
            args.system,
            args.no_link,
            args.out_link,
            args.print_out_paths,
        ),
        OsCommand::Test(system) => (Action::Test, system, true, None, false),
        OsCommand::Boot(system) => (Action::Boot, system, true, None, false),
        OsCommand::Switch(system) => (Action::Switch, system, true, None, false),
    };

    if system.target.is_some() {
        settings.target = system.target;
    }
    let name = system.name.unwrap_or_else(|| settings.hostname.clone());
    if name.is_empty() {
        anyhow::bail!("No configuration name given and the hostname is unknown");
    }

    print_section("Building configuration");
    let out = NixCommand::new("build")
        .args(build_args(toplevel_attr(&name), no_link, out_link))
        .reporter(Box::new(BuildReporter::new(settings.verbose, settings.render_fps)))
        .run(token.clone())
        .await?;
    info!("Built {}", out);

    let remote = Remote::connect(&settings, &token, settings.target.as_deref()).await?;
    let result = deploy(&settings, &token, action, &remote, &out).await;
    remote.disconnect().await;
    result?;

    if print_out_paths {
        println!("{}", out);
    }

    Ok(())
}

async fn deploy(
    settings: &Settings,
    token: &CancellationToken,
    action: Action,
    remote: &Remote,
    out: &str,
) -> anyhow::Result<()> {
    let executor = remote.executor();

    if let Some(target) = settings.target.as_deref() {
        let target: Target = target.parse()?;

        eprintln!();
        print_section(&format!("Copying configuration to {}", target.host));
        NixCommand::new("copy")
            .args(["--to".to_string(), target.store_uri(), out.to_string()])
            .executor(std::sync::Arc::new(LocalExecutor::new()))
            .reporter(Box::new(CopyReporter::new(settings.verbose, settings.render_fps)))
            .run(token.clone())
            .await?;
    }

    eprintln!();
    print_section("Comparing changes");
    let from = Generation::new(settings.current_profile.as_str(), executor.as_ref());
    let to = Generation::new(out, executor.as_ref());
    diff::execute(&settings.diff_tool, &from, &to, token).await?;

    if action.activates() {
        eprintln!();
        print_section("Activating configuration");

        match switch_to_configuration(executor.as_ref(), token, out, "test").await {
            // Boot setup still follows when switching
            Err(e) if action == Action::Switch && !token.is_cancelled() => {
                warn!("Activation failed, continuing with boot setup: {}", e);
            }
            other => other?,
        }
    }

    if action.sets_boot_default() {
        NixCommand::new("build")
            .args([
                "--no-link".to_string(),
                "--profile".to_string(),
                settings.system_profile.clone(),
                out.to_string(),
            ])
            .executor(executor.clone())
            .privileged(true)
            .run(token.clone())
            .await?;

        eprintln!();
        print_section("Adding configuration to bootloader");
        switch_to_configuration(executor.as_ref(), token, out, "boot").await?;
    }

    Ok(())
}

async fn switch_to_configuration(
    executor: &dyn Executor,
    token: &CancellationToken,
    out: &str,
    mode: &str,
) -> cfgbuild_core::Result<()> {
    let args = vec![
        format!("{}/bin/switch-to-configuration", out),
        mode.to_string(),
    ];

    let mut cmd = executor.command_context(token.clone(), "sudo", &args).await?;
    cmd.set_stdin(Input::Inherit);
    cmd.set_stdout(Output::Inherit);
    cmd.set_stderr(Output::Inherit);
    cmd.run().await
}
