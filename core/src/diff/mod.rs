//! Package-level comparison of two system closures

use std::io::Write;

use console::{style, Alignment};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::exec::{Executor, Output};
use crate::util::diff_bytes;

mod closure;
mod package;

pub use closure::{closure_size, decode_closure_size, query_generation};
pub use package::{Package, PackageSet};

/// Versions of one package name on each side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDiff {
    pub name: String,
    pub before: Vec<String>,
    pub after: Vec<String>,
}

/// Package changes between two closures, each list sorted by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub changed: Vec<PackageDiff>,
    pub added: Vec<PackageDiff>,
    pub removed: Vec<PackageDiff>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }
}

/// Package counts and byte sizes of both closures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClosureDiff {
    pub num_before: usize,
    pub num_after: usize,
    pub bytes_before: i64,
    pub bytes_after: i64,
}

/// A built generation and where it lives
pub struct Generation<'a> {
    pub path: String,
    pub executor: &'a dyn Executor,
}

impl<'a> Generation<'a> {
    pub fn new(path: impl Into<String>, executor: &'a dyn Executor) -> Self {
        Self {
            path: path.into(),
            executor,
        }
    }
}

fn sort_by_name(diffs: &mut [PackageDiff]) {
    diffs.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Compare two package sets
pub fn calculate(before: &PackageSet, after: &PackageSet) -> Diff {
    let before_names = before.names();
    let after_names = after.names();

    let mut changed: Vec<PackageDiff> = before_names
        .intersection(&after_names)
        .filter(|name| before.versions(name) != after.versions(name))
        .map(|name| PackageDiff {
            name: name.to_string(),
            before: before.sorted_versions(name),
            after: after.sorted_versions(name),
        })
        .collect();

    let mut added: Vec<PackageDiff> = after_names
        .difference(&before_names)
        .map(|name| PackageDiff {
            name: name.to_string(),
            before: Vec::new(),
            after: after.sorted_versions(name),
        })
        .collect();

    let mut removed: Vec<PackageDiff> = before_names
        .difference(&after_names)
        .map(|name| PackageDiff {
            name: name.to_string(),
            before: before.sorted_versions(name),
            after: Vec::new(),
        })
        .collect();

    sort_by_name(&mut changed);
    sort_by_name(&mut added);
    sort_by_name(&mut removed);

    Diff {
        changed,
        added,
        removed,
    }
}

/// Query both generations and compare them
pub async fn run(
    from: &Generation<'_>,
    to: &Generation<'_>,
    token: &CancellationToken,
) -> Result<(Diff, ClosureDiff)> {
    let before = PackageSet::new(query_generation(from.executor, token, &from.path).await?);
    let after = PackageSet::new(query_generation(to.executor, token, &to.path).await?);

    let diff = calculate(&before, &after);

    let closure = ClosureDiff {
        num_before: before.num_packages(),
        num_after: after.num_packages(),
        bytes_before: closure_size(from.executor, token, &from.path).await?,
        bytes_after: closure_size(to.executor, token, &to.path).await?,
    };

    Ok((diff, closure))
}

fn print_section<W, F>(
    out: &mut W,
    title: &str,
    diffs: &[PackageDiff],
    versions: F,
) -> std::io::Result<()>
where
    W: Write,
    F: Fn(&PackageDiff) -> String,
{
    if diffs.is_empty() {
        return Ok(());
    }

    writeln!(out, "{}", title)?;

    let widest = diffs.iter().map(|d| d.name.chars().count()).max().unwrap_or(0);
    for (i, diff) in diffs.iter().enumerate() {
        let name = style(&diff.name).color256(10).for_stderr().to_string();
        writeln!(
            out,
            "#{:02}  {}  {}",
            i + 1,
            console::pad_str(&name, widest, Alignment::Left, None),
            versions(diff)
        )?;
    }

    Ok(())
}

fn versions(list: &[String]) -> String {
    style(list.join(", ")).color256(3).for_stderr().to_string()
}

/// Write version changes, added and removed packages
pub fn print<W: Write>(out: &mut W, diff: &Diff) -> std::io::Result<()> {
    print_section(out, "Version changes:", &diff.changed, |d| {
        format!("{} -> {}", versions(&d.before), versions(&d.after))
    })?;
    print_section(out, "Added packages:", &diff.added, |d| versions(&d.after))?;
    print_section(out, "Removed packages:", &diff.removed, |d| versions(&d.before))
}

/// `Closure size: N -> M (disk usage ±X.XXunit)`
pub fn closure_summary(closure: &ClosureDiff) -> String {
    let (size, negative, unit) = diff_bytes(closure.bytes_before, closure.bytes_after);
    format!(
        "Closure size: {} -> {} (disk usage {}{:.2}{})",
        closure.num_before,
        closure.num_after,
        if negative { "-" } else { "+" },
        size,
        unit
    )
}

/// Show what changes between two generations
///
/// Both local: delegate to `diff_tool`. Otherwise the closures are compared
/// here and the result is printed to stderr.
pub async fn execute(
    diff_tool: &str,
    from: &Generation<'_>,
    to: &Generation<'_>,
    token: &CancellationToken,
) -> Result<()> {
    if from.executor.is_local() && to.executor.is_local() {
        debug!("Delegating closure diff to {}", diff_tool);

        let args = vec!["diff".to_string(), from.path.clone(), to.path.clone()];
        let mut cmd = to
            .executor
            .command_context(token.clone(), diff_tool, &args)
            .await?;
        cmd.set_stdout(Output::Writer(Box::new(tokio::io::stderr())));
        cmd.set_stderr(Output::Inherit);
        return cmd.run().await;
    }

    let (diff, closure) = run(from, to, token).await?;

    let mut stderr = std::io::stderr().lock();
    print(&mut stderr, &diff)?;
    writeln!(stderr, "{}", closure_summary(&closure))?;

    Ok(())
}
