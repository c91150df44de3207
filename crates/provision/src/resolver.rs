//! Package resolution seam
//!
//! Turning a declared spec into an installed version is the one place where
//! the outside world (a package index) leaks into the engine, so it sits
//! behind a trait. The exact-match invariant for pinned specs is enforced by
//! the executor against whatever the resolver answers.

use crate::error::Result;
use crate::package::PackageSpec;

/// Marker version for unpinned declarations
pub const LATEST: &str = "latest";

/// A package after resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    pub name: String,
    pub version: String,
}

/// Resolves declared package specs to concrete installed versions
pub trait Resolver {
    fn resolve(&self, spec: &PackageSpec) -> Result<ResolvedPackage>;
}

/// Resolver that takes declarations at face value: pins resolve to
/// themselves, unpinned specs to the [`LATEST`] marker.
pub struct DeclaredResolver;

impl Resolver for DeclaredResolver {
    fn resolve(&self, spec: &PackageSpec) -> Result<ResolvedPackage> {
        Ok(ResolvedPackage {
            name: spec.name.clone(),
            version: spec
                .version
                .clone()
                .unwrap_or_else(|| LATEST.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_resolver_echoes_pin() {
        let resolved = DeclaredResolver
            .resolve(&PackageSpec::pinned("git", "2.7.4"))
            .unwrap();
        assert_eq!(resolved.version, "2.7.4");
    }

    #[test]
    fn test_declared_resolver_unpinned_is_latest() {
        let resolved = DeclaredResolver.resolve(&PackageSpec::new("wget")).unwrap();
        assert_eq!(resolved.version, LATEST);
    }
}
