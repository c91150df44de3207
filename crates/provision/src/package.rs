//! Package specifications with optional exact version pins
//!
//! A pinned spec (`git=2.7.4`) must resolve to exactly that version; an
//! unpinned spec resolves to latest-available and is flagged as
//! non-reproducible by step validation.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A declared package: name plus optional exact version constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageSpec {
    pub name: String,
    pub version: Option<String>,
}

impl PackageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn pinned(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(version.into()),
        }
    }

    /// Whether the declaration carries an exact version constraint
    pub fn is_pinned(&self) -> bool {
        self.version.is_some()
    }

    /// Parse a `name`, `name=version` or `name==version` declaration
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(Error::InvalidPackageSpec(spec.to_string()));
        }

        // Accept both the `=` and `==` pin separators
        let (name, version) = match spec.split_once('=') {
            Some((name, rest)) => {
                let version = rest.strip_prefix('=').unwrap_or(rest);
                (name.trim(), Some(version.trim()))
            }
            None => (spec, None),
        };

        if name.is_empty() || version.is_some_and(str::is_empty) {
            return Err(Error::InvalidPackageSpec(spec.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            version: version.map(String::from),
        })
    }
}

impl FromStr for PackageSpec {
    type Err = Error;

    fn from_str(spec: &str) -> Result<Self> {
        Self::parse(spec)
    }
}

impl TryFrom<String> for PackageSpec {
    type Error = Error;

    fn try_from(spec: String) -> Result<Self> {
        Self::parse(&spec)
    }
}

impl From<PackageSpec> for String {
    fn from(spec: PackageSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}={}", self.name, version),
            None => f.write_str(&self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unpinned() {
        let spec = PackageSpec::parse("wget").unwrap();
        assert_eq!(spec.name, "wget");
        assert!(!spec.is_pinned());
    }

    #[test]
    fn test_parse_pinned() {
        let spec = PackageSpec::parse("git=1:2.7.4-0ubuntu1").unwrap();
        assert_eq!(spec.name, "git");
        assert_eq!(spec.version.as_deref(), Some("1:2.7.4-0ubuntu1"));
    }

    #[test]
    fn test_parse_double_equals() {
        let spec = PackageSpec::parse("base58==0.2.2").unwrap();
        assert_eq!(spec.name, "base58");
        assert_eq!(spec.version.as_deref(), Some("0.2.2"));
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let spec = PackageSpec::parse("  wget = 1.19 ").unwrap();
        assert_eq!(spec.name, "wget");
        assert_eq!(spec.version.as_deref(), Some("1.19"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(PackageSpec::parse("").is_err());
        assert!(PackageSpec::parse("=1.0").is_err());
        assert!(PackageSpec::parse("wget=").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for raw in ["wget", "git=2.7.4"] {
            assert_eq!(PackageSpec::parse(raw).unwrap().to_string(), raw);
        }
    }
}
