//! Tool configuration

use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;

use crate::error::Result;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "CFGBUILD";

/// Settings shared by the executors, reporters and workflows.
///
/// Everything that used to be looked up from the environment on demand
/// (home directory, current user) is resolved once here and passed down.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Home directory of the invoking user
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,

    /// Name of the invoking user
    #[serde(default = "default_user")]
    pub user: String,

    /// Name of this machine, the default configuration name
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Remote target (`[user@]host[:port]`), local execution when unset
    #[serde(default)]
    pub target: Option<String>,

    /// Print build log lines and per-item progress
    #[serde(default)]
    pub verbose: bool,

    /// Profile that boot generations are registered in
    #[serde(default = "default_system_profile")]
    pub system_profile: String,

    /// Symlink to the currently active system generation
    #[serde(default = "default_current_profile")]
    pub current_profile: String,

    /// External closure comparison tool used when both sides are local
    #[serde(default = "default_diff_tool")]
    pub diff_tool: String,

    /// Redraw rate of the progress area
    #[serde(default = "default_render_fps")]
    pub render_fps: u32,

    /// Override for the SSH client configuration file
    #[serde(default)]
    pub ssh_config_path: Option<PathBuf>,

    /// SSH agent socket used when the host config does not name one
    #[serde(default = "default_ssh_auth_sock")]
    pub ssh_auth_sock: Option<PathBuf>,
}

fn default_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

fn default_user() -> String {
    std::env::var("USER").unwrap_or_default()
}

fn default_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_default()
}

fn default_ssh_auth_sock() -> Option<PathBuf> {
    std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from)
}

fn default_system_profile() -> String {
    "/nix/var/nix/profiles/system".to_string()
}

fn default_current_profile() -> String {
    "/run/current-system".to_string()
}

fn default_diff_tool() -> String {
    "nvd".to_string()
}

fn default_render_fps() -> u32 {
    30
}

impl Settings {
    /// Load settings from the default config file and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path())
    }

    /// Load settings from an optional TOML file, then `CFGBUILD_*` variables
    pub fn load_from(path: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            debug!("Reading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()?;

        Ok(settings)
    }

    /// Construct settings for an explicit home directory and user
    pub fn with_home(home_dir: impl Into<PathBuf>, user: impl Into<String>) -> Self {
        Self {
            home_dir: home_dir.into(),
            user: user.into(),
            ..Self::default()
        }
    }

    /// Default location of the configuration file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("cfgbuild").join("config.toml"))
    }

    /// Directory holding the user's SSH files
    pub fn ssh_dir(&self) -> PathBuf {
        self.home_dir.join(".ssh")
    }

    /// Path of the SSH client configuration file
    pub fn ssh_config_file(&self) -> PathBuf {
        self.ssh_config_path
            .clone()
            .unwrap_or_else(|| self.ssh_dir().join("config"))
    }

    /// Expand a leading `~/` and `$VAR` / `${VAR}` references in a path
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let expanded = expand_env(path);
        match expanded.strip_prefix("~/") {
            Some(rest) => self.home_dir.join(rest),
            None if expanded == "~" => self.home_dir.clone(),
            None => PathBuf::from(expanded),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            user: default_user(),
            hostname: default_hostname(),
            target: None,
            verbose: false,
            system_profile: default_system_profile(),
            current_profile: default_current_profile(),
            diff_tool: default_diff_tool(),
            render_fps: default_render_fps(),
            ssh_config_path: None,
            ssh_auth_sock: default_ssh_auth_sock(),
        }
    }
}

fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }

        let mut name = String::new();
        while let Some(&n) = chars.peek() {
            if n.is_ascii_alphanumeric() || n == '_' {
                name.push(n);
                chars.next();
            } else {
                break;
            }
        }
        if braced && chars.peek() == Some(&'}') {
            chars.next();
        }

        if name.is_empty() {
            out.push('$');
        } else {
            out.push_str(&std::env::var(&name).unwrap_or_default());
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_home_relative_path() {
        let settings = Settings::with_home("/home/alice", "alice");
        assert_eq!(
            settings.resolve_path("~/.ssh/id_ed25519"),
            PathBuf::from("/home/alice/.ssh/id_ed25519")
        );
        assert_eq!(
            settings.resolve_path("/etc/ssh/known_hosts"),
            PathBuf::from("/etc/ssh/known_hosts")
        );
    }

    #[test]
    fn test_resolve_path_expands_variables() {
        let settings = Settings::with_home("/home/alice", "alice");
        std::env::set_var("CFGBUILD_TEST_DIR", "/srv/keys");
        assert_eq!(
            settings.resolve_path("${CFGBUILD_TEST_DIR}/id_rsa"),
            PathBuf::from("/srv/keys/id_rsa")
        );
        assert_eq!(
            settings.resolve_path("$CFGBUILD_TEST_DIR/id_rsa"),
            PathBuf::from("/srv/keys/id_rsa")
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "target = \"deploy@builder:2222\"\nverbose = true\nrender_fps = 10\n",
        )
        .unwrap();

        let settings = Settings::load_from(Some(path)).expect("Failed to load settings");
        assert_eq!(settings.target.as_deref(), Some("deploy@builder:2222"));
        assert!(settings.verbose);
        assert_eq!(settings.render_fps, 10);
        assert_eq!(settings.system_profile, "/nix/var/nix/profiles/system");
    }

    #[test]
    fn test_load_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(Some(dir.path().join("absent.toml")))
            .expect("Failed to load settings");
        assert_eq!(settings.diff_tool, "nvd");
        assert_eq!(settings.render_fps, 30);
    }
}
