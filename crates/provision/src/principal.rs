//! Principals: the identity a step executes under
//!
//! The active principal is explicit run state threaded through the pipeline
//! runner, never ambient process identity. It changes only when a step
//! declares a principal different from the current one.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The identity under which a step's command-set runs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Principal {
    /// The superuser; always exists
    Root,
    /// A named unprivileged user; must be created by an earlier step
    User(String),
}

impl Principal {
    /// Parse a principal name; "root" is the superuser, anything else a user
    pub fn named(name: &str) -> Self {
        if name == "root" {
            Self::Root
        } else {
            Self::User(name.to_string())
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self, Self::Root)
    }

    /// The principal's name as it appears in definitions and reports
    pub fn name(&self) -> &str {
        match self {
            Self::Root => "root",
            Self::User(name) => name,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<String> for Principal {
    fn from(name: String) -> Self {
        Self::named(&name)
    }
}

impl From<Principal> for String {
    fn from(principal: Principal) -> Self {
        principal.name().to_string()
    }
}
