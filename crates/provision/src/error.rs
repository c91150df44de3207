//! Error types for the provisioning engine

use crate::principal::Principal;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can abort a provisioning run
#[derive(Error, Debug)]
pub enum Error {
    /// A step declared a principal that has not been created yet
    #[error("step '{step}' switches to unknown principal '{principal}'")]
    UnknownPrincipal { step: String, principal: String },

    /// An operation in a step's command-set failed
    #[error("step '{step}' (as {principal}) failed at `{command}`: {status}")]
    CommandFailure {
        step: String,
        principal: Principal,
        command: String,
        status: String,
    },

    /// The same cache key produced two different results across runs
    #[error(
        "cache conflict for step '{step}': key {key} already maps to {existing}, \
         refusing to overwrite with {candidate}"
    )]
    CacheConflict {
        step: String,
        key: String,
        existing: String,
        candidate: String,
    },

    /// A step declares the same package more than once
    #[error("step '{step}' declares package '{package}' more than once")]
    DuplicatePackage { step: String, package: String },

    /// An installed path alias stopped resolving to an executable
    #[error("alias '{alias}' no longer resolves after step '{step}': {}", .target.display())]
    DanglingAlias {
        step: String,
        alias: String,
        target: PathBuf,
    },

    /// Another run holds the environment root
    #[error("environment root is locked by another run: {}", .0.display())]
    LockHeld(PathBuf),

    /// The run was cancelled at a step boundary
    #[error("run cancelled before step '{step}'")]
    Cancelled { step: String },

    /// A package declaration could not be parsed
    #[error("invalid package spec '{0}'")]
    InvalidPackageSpec(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata (de)serialization error
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;
