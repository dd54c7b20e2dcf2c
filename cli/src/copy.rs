//! Closure copy to a remote store

use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cfgbuild_core::exec::{LocalExecutor, Target};
use cfgbuild_core::nix::{add_path_to_store, NixCommand, STORE_DIR};
use cfgbuild_core::tui::CopyReporter;
use cfgbuild_core::Settings;

use crate::print_section;

#[derive(Args)]
pub struct CopyArgs {
    /// Store path, or a local path to add to the store first
    pub path: String,

    /// Destination `[user@]host[:port]`
    #[arg(long)]
    pub to: String,
}

pub async fn run(settings: Settings, token: CancellationToken, args: CopyArgs) -> anyhow::Result<()> {
    let target: Target = args.to.parse()?;
    let executor = Arc::new(LocalExecutor::new());

    let path = if args.path.starts_with(STORE_DIR) {
        args.path
    } else {
        let entry = add_path_to_store(executor.as_ref(), &args.path).await?;
        info!("Added {} to the store as {} ({})", args.path, entry.path, entry.hash);
        entry.path
    };

    print_section(&format!("Copying {} to {}", path, target.host));
    NixCommand::new("copy")
        .args(["--to".to_string(), target.store_uri(), path.clone()])
        .executor(executor)
        .reporter(Box::new(CopyReporter::new(settings.verbose, settings.render_fps)))
        .run(token)
        .await?;

    println!("{}", path);
    Ok(())
}
