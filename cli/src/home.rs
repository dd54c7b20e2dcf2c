//! Home Manager configuration workflow

use clap::{Args, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use cfgbuild_core::diff::{self, Generation};
use cfgbuild_core::exec::{Executor, LocalExecutor, Output};
use cfgbuild_core::nix::NixCommand;
use cfgbuild_core::tui::BuildReporter;
use cfgbuild_core::Settings;

use crate::print_section;

#[derive(Subcommand)]
pub enum HomeCommand {
    /// Build Home Manager configuration
    Build(BuildArgs),

    /// Build Home Manager configuration and activate it
    Switch(HomeArgs),
}

#[derive(Args)]
pub struct HomeArgs {
    /// Configuration name, defaults to `user@hostname` then `user`
    pub name: Option<String>,
}

#[derive(Args)]
pub struct BuildArgs {
    #[command(flatten)]
    pub home: HomeArgs,

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

/// Candidate configuration names, most specific first
fn candidate_names(settings: &Settings, name: Option<String>) -> anyhow::Result<Vec<String>> {
    if let Some(name) = name {
        return Ok(vec![name]);
    }

    if settings.user.is_empty() {
        anyhow::bail!("No user found");
    }

    let mut names = Vec::new();
    if !settings.hostname.is_empty() {
        names.push(format!("{}@{}", settings.user, settings.hostname));
    }
    names.push(settings.user.clone());

    Ok(names)
}

/// Profiles a home generation can be linked from
fn profile_candidates(settings: &Settings) -> Vec<String> {
    let mut profiles = Vec::new();
    if !settings.user.is_empty() {
        profiles.push(format!(
            "/nix/var/nix/profiles/per-user/{}/home-manager",
            settings.user
        ));
    }
    profiles.push(
        settings
            .home_dir
            .join(".local/state/nix/profiles/home-manager")
            .to_string_lossy()
            .into_owned(),
    );
    profiles
}

async fn find_current_generation(
    executor: &dyn Executor,
    settings: &Settings,
) -> anyhow::Result<String> {
    for profile in profile_candidates(settings) {
        if executor.path_exists(&profile).await? {
            return Ok(profile);
        }
    }
    anyhow::bail!("Current home generation not found")
}

async fn find_configuration(token: &CancellationToken, names: &[String]) -> anyhow::Result<String> {
    for name in names {
        let found = NixCommand::new("eval")
            .args([
                "-f".to_string(),
                "nilla.nix".to_string(),
                "systems.home".to_string(),
                "--apply".to_string(),
                format!("x: x ? \"{}\"", name),
            ])
            .run(token.clone())
            .await;

        match found {
            Ok(out) if out == "true" => return Ok(name.clone()),
            Ok(_) => debug!("No home configuration named {}", name),
            Err(e) => debug!("Failed to look up home configuration {}: {}", name, e),
        }
    }
    anyhow::bail!("Home configuration not found")
}

pub async fn run(
    settings: Settings,
    token: CancellationToken,
    command: HomeCommand,
) -> anyhow::Result<()> {
    let (home, no_link, out_link, print_out_paths, activate) = match command {
        HomeCommand::Build(args) => (
            args.home,
            args.no_link,
            args.out_link,
            args.print_out_paths,
            false,
        ),
        HomeCommand::Switch(home) => (home, true, None, false, true),
    };

    let executor = LocalExecutor::new();
    let current = find_current_generation(&executor, &settings).await?;
    let name = find_configuration(&token, &candidate_names(&settings, home.name)?).await?;

    let mut args = vec![
        "-f".to_string(),
        "nilla.nix".to_string(),
        format!("systems.home.{}.result.config.home.activationPackage", name),
    ];
    if no_link {
        args.push("--no-link".to_string());
    }
    if let Some(out_link) = out_link {
        args.extend(["--out-link".to_string(), out_link]);
    }

    print_section("Building configuration");
    let out = NixCommand::new("build")
        .args(args)
        .reporter(Box::new(BuildReporter::new(settings.verbose, settings.render_fps)))
        .run(token.clone())
        .await?;

    eprintln!();
    print_section("Comparing changes");
    let from = Generation::new(current, &executor);
    let to = Generation::new(out.as_str(), &executor);
    diff::execute(&settings.diff_tool, &from, &to, &token).await?;

    if activate {
        eprintln!();
        print_section("Activating configuration");

        let mut cmd = executor
            .command_context(token.clone(), &format!("{}/activate", out), &[])
            .await?;
        cmd.set_stdout(Output::Inherit);
        cmd.set_stderr(Output::Inherit);
        cmd.run().await?;
    } else if print_out_paths {
        println!("{}", out);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_names() {
        let mut settings = Settings::with_home("/home/alice", "alice");
        settings.hostname = "laptop".to_string();

        assert_eq!(
            candidate_names(&settings, None).unwrap(),
            vec!["alice@laptop", "alice"]
        );
        assert_eq!(
            candidate_names(&settings, Some("work".to_string())).unwrap(),
            vec!["work"]
        );

        settings.user.clear();
        assert!(candidate_names(&settings, None).is_err());
    }

    #[test]
    fn test_profile_candidates() {
        let settings = Settings::with_home("/home/alice", "alice");
        assert_eq!(
            profile_candidates(&settings),
            vec![
                "/nix/var/nix/profiles/per-user/alice/home-manager",
                "/home/alice/.local/state/nix/profiles/home-manager",
            ]
        );
    }
}
