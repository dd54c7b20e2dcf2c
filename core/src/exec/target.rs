use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Remote destination given as `[user@]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(target: &str) -> Result<Self> {
        let (user, rest) = match target.split_once('@') {
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, target),
        };

        let (host, port) = match rest.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("Invalid port in target \"{}\"", target)))?;
                (host, Some(port))
            }
            None => (rest, None),
        };

        if host.is_empty() {
            return Err(Error::Config(format!("Missing host in target \"{}\"", target)));
        }

        Ok(Self {
            user: user.filter(|u| !u.is_empty()),
            host: host.to_string(),
            port,
        })
    }
}

impl Target {
    /// Store URI the build engine copies closures to
    pub fn store_uri(&self) -> String {
        format!("ssh-ng://{}", self)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_only() {
        let target: Target = "host".parse().unwrap();
        assert_eq!(target.user, None);
        assert_eq!(target.host, "host");
        assert_eq!(target.port, None);
    }

    #[test]
    fn test_parse_user_and_host() {
        let target: Target = "user@host".parse().unwrap();
        assert_eq!(target.user.as_deref(), Some("user"));
        assert_eq!(target.host, "host");
        assert_eq!(target.port, None);
    }

    #[test]
    fn test_parse_host_and_port() {
        let target: Target = "host:222".parse().unwrap();
        assert_eq!(target.user, None);
        assert_eq!(target.host, "host");
        assert_eq!(target.port, Some(222));
    }

    #[test]
    fn test_parse_everything() {
        let target: Target = "user@host:222".parse().unwrap();
        assert_eq!(target.user.as_deref(), Some("user"));
        assert_eq!(target.host, "host");
        assert_eq!(target.port, Some(222));
        assert_eq!(target.to_string(), "user@host:222");
    }

    #[test]
    fn test_parse_rejects_bad_port() {
        assert!("host:ssh".parse::<Target>().is_err());
        assert!("user@:22".parse::<Target>().is_err());
    }

    #[test]
    fn test_store_uri() {
        let target: Target = "deploy@builder".parse().unwrap();
        assert_eq!(target.store_uri(), "ssh-ng://deploy@builder");
    }
}
