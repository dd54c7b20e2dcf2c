//! Store path helpers

use crate::error::{Error, Result};
use crate::exec::{trim_output, Executor};

/// Directory every store path lives in
pub const STORE_DIR: &str = "/nix/store";

/// Length of the base32 hash at the start of a store path name
const HASH_LEN: usize = 32;

/// A path added to the store with a fixed output hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedOutputStoreEntry {
    pub path: String,
    pub hash: String,
}

/// Strip the store directory from a path, if present
pub fn strip_store_dir(path: &str) -> &str {
    path.strip_prefix(STORE_DIR)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(path)
}

/// Name part of a store path, everything after the hash
pub fn store_path_name(path: &str) -> Result<&str> {
    strip_store_dir(path)
        .split_once('-')
        .map(|(_, name)| name)
        .ok_or_else(|| Error::InvalidStorePath(path.to_string()))
}

/// Human readable name of a store path for progress output
///
/// Drops the store directory and the fixed-width hash, and the `.drv`
/// suffix of derivations. Paths that are not store paths are returned as is.
pub fn display_name(path: &str) -> &str {
    let base = strip_store_dir(path);
    let name = match base.get(HASH_LEN..) {
        Some(rest) if base.len() != path.len() && rest.starts_with('-') => &rest[1..],
        _ => base,
    };
    name.strip_suffix(".drv").unwrap_or(name)
}

/// Query the hash of a store path
pub async fn query_store_hash(executor: &dyn Executor, path: &str) -> Result<String> {
    let args = ["--query", path, "--hash"].map(String::from);
    let out = executor.command("nix-store", &args).await?.output().await?;
    let out = String::from_utf8_lossy(trim_output(&out)).into_owned();

    Ok(out.rsplit(':').next().unwrap_or_default().to_string())
}

/// Add a local path to the store recursively with a sha256 fixed output hash
pub async fn add_path_to_store(
    executor: &dyn Executor,
    path: &str,
) -> Result<FixedOutputStoreEntry> {
    let args = ["--recursive", "--add-fixed", "sha256", path].map(String::from);
    let out = executor.command("nix-store", &args).await?.output().await?;
    let store_path = String::from_utf8_lossy(trim_output(&out)).into_owned();

    let hash = query_store_hash(executor, &store_path).await?;

    Ok(FixedOutputStoreEntry {
        path: store_path,
        hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_path_name() {
        assert_eq!(
            store_path_name("/nix/store/0d6ky1qg2x3k3mpdd1bgg41n9xlbr6dv-source").unwrap(),
            "source"
        );
        assert_eq!(
            store_path_name("0d6ky1qg2x3k3mpdd1bgg41n9xlbr6dv-nixos-system-host-24.11").unwrap(),
            "nixos-system-host-24.11"
        );
        assert!(matches!(
            store_path_name("/nix/store/nohash"),
            Err(Error::InvalidStorePath(_))
        ));
    }

    #[test]
    fn test_display_name() {
        assert_eq!(
            display_name("/nix/store/6a0mdmgvfqb3n3i0wvyr8kqnw9ag3d7f-hello-2.12.1.drv"),
            "hello-2.12.1"
        );
        assert_eq!(
            display_name("/nix/store/6a0mdmgvfqb3n3i0wvyr8kqnw9ag3d7f-hello-2.12.1"),
            "hello-2.12.1"
        );
        assert_eq!(display_name("short"), "short");
    }
}
