//! Step declarations: the atomic unit of provisioning
//!
//! A step is immutable once defined; its identity is the BLAKE3 hash of its
//! full declaration, which is what the layer cache keys on.

use crate::error::{Error, Result};
use crate::package::PackageSpec;
use crate::principal::Principal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// One operation inside a step's command-set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Op {
    /// Install packages into the environment's package database
    Install { packages: Vec<PackageSpec> },

    /// Create a named user with a home directory under /home
    CreateUser { name: String, uid: u32 },

    /// Materialize an isolated runtime tree: `bin/` seeded with executables
    CreateRuntime {
        path: PathBuf,
        #[serde(default)]
        bin: Vec<String>,
    },

    /// Create a directory (and parents) inside the environment
    Mkdir { path: PathBuf },

    /// Write a file inside the environment
    WriteFile {
        path: PathBuf,
        contents: String,
        #[serde(default)]
        executable: bool,
    },

    /// Install a path alias: a global command name redirected to a binary
    /// inside the environment; last write wins
    Alias { name: String, target: PathBuf },

    /// Run an external command with the environment root as working directory
    Run {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Op {
    /// Shell-style rendering for reports and failure messages
    pub fn describe(&self) -> String {
        match self {
            Self::Install { packages } => {
                let specs: Vec<String> = packages.iter().map(ToString::to_string).collect();
                format!("install {}", specs.join(" "))
            }
            Self::CreateUser { name, uid } => format!("useradd -u {uid} {name}"),
            Self::CreateRuntime { path, .. } => format!("create-runtime {}", path.display()),
            Self::Mkdir { path } => format!("mkdir -p {}", path.display()),
            Self::WriteFile { path, .. } => format!("write {}", path.display()),
            Self::Alias { name, target } => format!("alias {} -> {}", name, target.display()),
            Self::Run { program, args } => {
                if args.is_empty() {
                    program.clone()
                } else {
                    format!("{} {}", program, args.join(" "))
                }
            }
        }
    }
}

/// An atomic provisioning action with a declared principal and command-set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub principal: Principal,
    #[serde(default)]
    pub ops: Vec<Op>,
}

impl Step {
    pub fn new(name: impl Into<String>, principal: Principal, ops: Vec<Op>) -> Self {
        Self {
            name: name.into(),
            principal,
            ops,
        }
    }

    /// Identity of the full declaration: BLAKE3 over its canonical
    /// serialization. Any change to the step changes the digest.
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_vec(self).expect("step declarations always serialize");
        blake3::hash(&canonical).to_hex().to_string()
    }

    /// Packages declared across the step's install operations
    pub fn packages(&self) -> impl Iterator<Item = &PackageSpec> {
        self.ops.iter().flat_map(|op| match op {
            Op::Install { packages } => packages.as_slice(),
            _ => &[],
        })
    }

    /// Static validation of the declaration.
    ///
    /// Duplicate package declarations within the step are rejected; unpinned
    /// declarations are flagged as non-reproducible warnings.
    pub fn validate(&self) -> Result<Vec<Warning>> {
        let mut seen = BTreeSet::new();
        let mut warnings = Vec::new();

        for spec in self.packages() {
            if !seen.insert(spec.name.as_str()) {
                return Err(Error::DuplicatePackage {
                    step: self.name.clone(),
                    package: spec.name.clone(),
                });
            }
            if !spec.is_pinned() {
                warnings.push(Warning::UnpinnedPackage {
                    step: self.name.clone(),
                    package: spec.name.clone(),
                });
            }
        }

        Ok(warnings)
    }
}

/// Non-fatal findings collected during a run and reported at the end
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Warning {
    /// A package declared without a version constraint resolves to
    /// latest-available and makes the step non-reproducible
    UnpinnedPackage { step: String, package: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnpinnedPackage { step, package } => write!(
                f,
                "package '{package}' in step '{step}' has no version pin (not reproducible)"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_step(specs: &[&str]) -> Step {
        let packages = specs.iter().map(|s| PackageSpec::parse(s).unwrap()).collect();
        Step::new("packages", Principal::Root, vec![Op::Install { packages }])
    }

    #[test]
    fn test_digest_is_stable() {
        let a = install_step(&["wget", "git=2.7.4"]);
        let b = install_step(&["wget", "git=2.7.4"]);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_digest_changes_with_declaration() {
        let a = install_step(&["wget", "git=2.7.4"]);
        let b = install_step(&["wget", "git=2.7.5"]);
        assert_ne!(a.digest(), b.digest());

        let mut c = install_step(&["wget", "git=2.7.4"]);
        c.principal = Principal::User("indy".into());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let step = install_step(&["wget", "git=2.7.4", "wget"]);
        match step.validate() {
            Err(Error::DuplicatePackage { step, package }) => {
                assert_eq!(step, "packages");
                assert_eq!(package, "wget");
            }
            other => panic!("expected DuplicatePackage, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_duplicates_across_ops() {
        let step = Step::new(
            "packages",
            Principal::Root,
            vec![
                Op::Install {
                    packages: vec![PackageSpec::new("wget")],
                },
                Op::Install {
                    packages: vec![PackageSpec::pinned("wget", "1.19")],
                },
            ],
        );
        assert!(step.validate().is_err());
    }

    #[test]
    fn test_validate_flags_unpinned() {
        let step = install_step(&["wget", "git=2.7.4"]);
        let warnings = step.validate().unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(
            warnings[0],
            Warning::UnpinnedPackage {
                step: "packages".into(),
                package: "wget".into(),
            }
        );
    }

    #[test]
    fn test_describe() {
        let op = Op::Run {
            program: "sh".into(),
            args: vec!["-c".into(), "true".into()],
        };
        assert_eq!(op.describe(), "sh -c true");

        let op = Op::Alias {
            name: "pip".into(),
            target: PathBuf::from("/home/indy/test/bin/pip"),
        };
        assert_eq!(op.describe(), "alias pip -> /home/indy/test/bin/pip");
    }
}
