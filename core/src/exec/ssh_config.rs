//! Minimal SSH client configuration reader
//!
//! Understands `Host` blocks with `*`/`?` wildcards and `!` negation. The
//! first value seen for a keyword wins, except `IdentityFile` which
//! accumulates across every matching block. `Match` blocks are skipped.

use std::path::Path;

use tracing::debug;

use crate::error::Result;

/// Settings that apply to one host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostConfig {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_files: Vec<String>,
    pub identities_only: bool,
    pub identity_agent: Option<String>,
    pub known_hosts_files: Vec<String>,
    pub host_key_alias: Option<String>,
}

#[derive(Debug, Clone)]
struct Pattern {
    negated: bool,
    glob: String,
}

#[derive(Debug, Clone)]
struct Block {
    patterns: Vec<Pattern>,
    // `Match` blocks never apply
    skip: bool,
    options: Vec<(String, String)>,
}

impl Block {
    fn global() -> Self {
        Self {
            patterns: vec![Pattern {
                negated: false,
                glob: "*".to_string(),
            }],
            skip: false,
            options: Vec::new(),
        }
    }

    fn matches(&self, host: &str) -> bool {
        if self.skip {
            return false;
        }

        let host = host.to_ascii_lowercase();
        let mut matched = false;
        for pattern in &self.patterns {
            if glob_match(&pattern.glob, &host) {
                if pattern.negated {
                    return false;
                }
                matched = true;
            }
        }
        matched
    }
}

/// Parsed SSH client configuration file
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    blocks: Vec<Block>,
}

impl SshConfig {
    /// Read a configuration file, an absent file yields an empty config
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No SSH config at {}", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parse configuration text
    pub fn parse(text: &str) -> Self {
        let mut blocks = vec![Block::global()];

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = split_option(line) else {
                continue;
            };

            match key.as_str() {
                "host" => blocks.push(Block {
                    patterns: value
                        .split_whitespace()
                        .map(|p| match p.strip_prefix('!') {
                            Some(glob) => Pattern {
                                negated: true,
                                glob: glob.to_ascii_lowercase(),
                            },
                            None => Pattern {
                                negated: false,
                                glob: p.to_ascii_lowercase(),
                            },
                        })
                        .collect(),
                    skip: false,
                    options: Vec::new(),
                }),
                "match" => blocks.push(Block {
                    patterns: Vec::new(),
                    skip: true,
                    options: Vec::new(),
                }),
                "include" => debug!("Ignoring SSH config Include {}", value),
                _ => {
                    if let Some(block) = blocks.last_mut() {
                        block.options.push((key, value));
                    }
                }
            }
        }

        Self { blocks }
    }

    /// First value of a keyword for a host
    pub fn get(&self, host: &str, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.blocks
            .iter()
            .filter(|block| block.matches(host))
            .flat_map(|block| block.options.iter())
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value of a keyword for a host, in file order
    pub fn get_all(&self, host: &str, key: &str) -> Vec<&str> {
        let key = key.to_ascii_lowercase();
        self.blocks
            .iter()
            .filter(|block| block.matches(host))
            .flat_map(|block| block.options.iter())
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Resolve the settings relevant for connecting to a host
    pub fn host_config(&self, host: &str) -> HostConfig {
        HostConfig {
            hostname: self.get(host, "HostName").map(str::to_string),
            user: self.get(host, "User").map(str::to_string),
            port: self.get(host, "Port").and_then(|p| p.parse().ok()),
            identity_files: self
                .get_all(host, "IdentityFile")
                .into_iter()
                .map(str::to_string)
                .collect(),
            identities_only: self
                .get(host, "IdentitiesOnly")
                .is_some_and(|v| v.eq_ignore_ascii_case("yes")),
            identity_agent: self.get(host, "IdentityAgent").map(str::to_string),
            known_hosts_files: self
                .get(host, "UserKnownHostsFile")
                .map(|v| {
                    v.split_whitespace()
                        .map(|f| f.trim_matches('"').to_string())
                        .collect()
                })
                .unwrap_or_default(),
            host_key_alias: self.get(host, "HostKeyAlias").map(str::to_string),
        }
    }
}

/// Split `Key value` or `Key=value` into a lowercase key and unquoted value
fn split_option(line: &str) -> Option<(String, String)> {
    let end = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let (key, rest) = line.split_at(end);
    let value = rest
        .trim_start()
        .strip_prefix('=')
        .unwrap_or(rest)
        .trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);

    if key.is_empty() || value.is_empty() {
        return None;
    }

    Some((key.to_ascii_lowercase(), value.to_string()))
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}
