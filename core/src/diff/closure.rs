//! Closure queries against the build engine

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::exec::Executor;

/// Store paths making up a generation
///
/// Packages directly referenced by `<path>/sw` (or by `path` itself when it
/// has no `sw` directory) followed by the full closure of `path`.
pub async fn query_generation(
    executor: &dyn Executor,
    token: &CancellationToken,
    path: &str,
) -> Result<Vec<String>> {
    let sw_path = format!("{}/sw", path);
    let sw_path = if executor.path_exists(&sw_path).await? {
        sw_path
    } else {
        path.to_string()
    };

    let references = query_store(executor, token, "--references", &sw_path).await?;
    let requisites = query_store(executor, token, "--requisites", path).await?;

    debug!(
        "Generation {} has {} references and {} requisites",
        path,
        references.len(),
        requisites.len()
    );

    Ok(references.into_iter().chain(requisites).collect())
}

async fn query_store(
    executor: &dyn Executor,
    token: &CancellationToken,
    query: &str,
    path: &str,
) -> Result<Vec<String>> {
    let args = vec!["--query".to_string(), query.to_string(), path.to_string()];
    let mut cmd = executor
        .command_context(token.clone(), "nix-store", &args)
        .await?;
    let out = cmd.output().await?;

    Ok(String::from_utf8_lossy(&out)
        .lines()
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}

/// Total size in bytes of the closure of a store path
pub async fn closure_size(
    executor: &dyn Executor,
    token: &CancellationToken,
    path: &str,
) -> Result<i64> {
    let args = ["path-info", "--json", "--closure-size", path].map(String::from);
    let mut cmd = executor.command_context(token.clone(), "nix", &args).await?;
    let out = cmd.output().await?;

    decode_closure_size(&out, path)
}

/// Read the closure size out of a `path-info` report
///
/// Older engines print an array of entries, newer ones an object keyed by
/// path. An empty report or a missing field counts as zero.
pub fn decode_closure_size(report: &[u8], path: &str) -> Result<i64> {
    let report: Value = serde_json::from_slice(report)?;

    let entry = match &report {
        Value::Array(entries) => entries.first(),
        Value::Object(entries) => entries.get(path).or_else(|| entries.values().next_back()),
        other => {
            return Err(Error::Config(format!(
                "unexpected path-info report: {}",
                other
            )))
        }
    };

    Ok(entry
        .and_then(|e| e.get("closureSize"))
        .and_then(Value::as_i64)
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: &str = "/nix/store/zv6nf9rvq4k3wz6d9dc3ym4b7zy4c9ix-nixos-system-host-24.11";

    #[test]
    fn test_decode_array_report() {
        let report = format!(r#"[{{"path":"{}","closureSize":123456}}]"#, PATH);
        assert_eq!(decode_closure_size(report.as_bytes(), PATH).unwrap(), 123456);
    }

    #[test]
    fn test_decode_object_report() {
        let report = format!(r#"{{"{}":{{"closureSize":987654,"narSize":10}}}}"#, PATH);
        assert_eq!(decode_closure_size(report.as_bytes(), PATH).unwrap(), 987654);
    }

    #[test]
    fn test_decode_empty_reports() {
        assert_eq!(decode_closure_size(b"[]", PATH).unwrap(), 0);
        assert_eq!(decode_closure_size(b"{}", PATH).unwrap(), 0);
        assert_eq!(decode_closure_size(br#"[{"path":"x"}]"#, PATH).unwrap(), 0);
    }

    #[test]
    fn test_decode_invalid_report() {
        assert!(matches!(
            decode_closure_size(b"not json", PATH),
            Err(Error::Json(_))
        ));
        assert!(matches!(
            decode_closure_size(b"42", PATH),
            Err(Error::Config(_))
        ));
    }
}
