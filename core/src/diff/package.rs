//! Packages named by store paths

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

static STORE_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:/nix/store/)?[a-z0-9]+-(.+?)(?:-([0-9].*?))?$")
        .expect("store path pattern is valid")
});

/// Name and version parsed out of a store path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    /// Empty when the path carries no version
    pub version: String,
    /// The path without a `.drv` suffix
    pub path: String,
}

impl Package {
    /// Parse `<hash>-<name>[-<version>][.drv]`, the version starting with a digit
    pub fn parse(path: &str) -> Option<Self> {
        let path = path.strip_suffix(".drv").unwrap_or(path);
        let caps = STORE_PATH_RE.captures(path)?;

        Some(Self {
            name: caps.get(1)?.as_str().to_string(),
            version: caps
                .get(2)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            path: path.to_string(),
        })
    }
}

/// Versions present for each package name of a closure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageSet {
    packages: HashMap<String, HashSet<String>>,
}

impl PackageSet {
    /// Build from store paths, skipping lines that do not parse
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut packages: HashMap<String, HashSet<String>> = HashMap::new();

        // A versionless output counts as the empty version
        for package in paths.into_iter().filter_map(|p| Package::parse(p.as_ref())) {
            packages
                .entry(package.name)
                .or_default()
                .insert(package.version);
        }

        Self { packages }
    }

    /// True if the name is present with at least one version
    pub fn has_package(&self, name: &str) -> bool {
        self.packages.get(name).is_some_and(|v| !v.is_empty())
    }

    /// Versions of a name, `None` when it is absent
    pub fn versions(&self, name: &str) -> Option<&HashSet<String>> {
        if !self.has_package(name) {
            return None;
        }
        self.packages.get(name)
    }

    pub fn num_packages(&self) -> usize {
        self.packages.len()
    }

    pub(crate) fn names(&self) -> HashSet<&str> {
        self.packages.keys().map(String::as_str).collect()
    }

    /// Versions of a name sorted ascending, empty when absent
    pub(crate) fn sorted_versions(&self, name: &str) -> Vec<String> {
        let mut versions: Vec<String> = self
            .versions(name)
            .map(|v| v.iter().cloned().collect())
            .unwrap_or_default();
        versions.sort();
        versions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_version() {
        let pkg = Package::parse("/nix/store/nc394xps4al1r99ziabqvajbkrhxr5b7-gzip-1.13").unwrap();
        assert_eq!(pkg.name, "gzip");
        assert_eq!(pkg.version, "1.13");
    }

    #[test]
    fn test_parse_output_suffix() {
        let pkg =
            Package::parse("/nix/store/3bl0g75vyjgg8gnggwiavbwdxyg6gv20-gnutar-1.35-info").unwrap();
        assert_eq!(pkg.name, "gnutar");
        assert_eq!(pkg.version, "1.35-info");
    }

    #[test]
    fn test_parse_without_version() {
        let pkg =
            Package::parse("/nix/store/i6fl7i35dacvxqpzya6h78nacciwryfh-nixos-rebuild").unwrap();
        assert_eq!(pkg.name, "nixos-rebuild");
        assert_eq!(pkg.version, "");
    }

    #[test]
    fn test_parse_strips_drv() {
        let pkg =
            Package::parse("/nix/store/nc394xps4al1r99ziabqvajbkrhxr5b7-gzip-1.13.drv").unwrap();
        assert_eq!(pkg.name, "gzip");
        assert_eq!(pkg.version, "1.13");
        assert_eq!(pkg.path, "/nix/store/nc394xps4al1r99ziabqvajbkrhxr5b7-gzip-1.13");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(Package::parse(""), None);
        assert_eq!(Package::parse("/nix/store/"), None);
    }

    #[test]
    fn test_package_set() {
        let set = PackageSet::new([
            "/nix/store/nc394xps4al1r99ziabqvajbkrhxr5b7-gzip-1.13",
            "/nix/store/nc394xps4al1r99ziabqvajbkrhxr5b7-gzip-1.13-lib",
            "/nix/store/3bl0g75vyjgg8gnggwiavbwdxyg6gv20-gnutar-1.35-info",
            "/nix/store/i6fl7i35dacvxqpzya6h78nacciwryfh-nixos-rebuild",
            "",
        ]);

        assert_eq!(set.num_packages(), 3);
        assert!(set.has_package("gzip"));
        assert!(set.has_package("gnutar"));
        assert!(set.has_package("nixos-rebuild"));
        assert!(!set.has_package("tar"));
        assert_eq!(set.sorted_versions("gzip"), vec!["1.13", "1.13-lib"]);
        assert_eq!(set.sorted_versions("nixos-rebuild"), vec![""]);
        assert_eq!(set.versions("tar"), None);
    }
}
