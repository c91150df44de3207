//! # Provision
//!
//! A layered, cache-aware environment provisioning engine.
//!
//! This crate provides the core abstractions for replaying an ordered
//! sequence of provisioning steps deterministically: declared principals,
//! a hashable environment state, and a content-addressed layer cache that
//! skips unchanged prefixes.
//!
//! ## Core Concepts
//!
//! - **Step**: one atomic provisioning action with a declared principal
//!   and an ordered command-set
//! - **Principal**: the identity (root or a named user) a step runs under,
//!   threaded explicitly through the run rather than taken from ambient
//!   process identity
//! - **EnvironmentState**: the materialized root plus user/alias/package
//!   metadata, identified by a BLAKE3 content hash
//! - **LayerCache**: store keyed by (predecessor-state-hash, step-digest);
//!   a hit restores the recorded layer instead of re-executing
//! - **Runner**: drives the step sequence, strictly in order, all-or-nothing
//!
//! ## Example
//!
//! ```no_run
//! use provision::{
//!     DeclaredResolver, LayerCache, NoObserver, Op, Pipeline, Principal,
//!     Runner, Step,
//! };
//! use std::path::Path;
//!
//! let pipeline = Pipeline::new(
//!     "base",
//!     vec![
//!         Step::new(
//!             "create-user",
//!             Principal::Root,
//!             vec![Op::CreateUser { name: "indy".into(), uid: 1000 }],
//!         ),
//!         Step::new("become-indy", Principal::named("indy"), vec![]),
//!     ],
//! );
//!
//! let mut cache = LayerCache::open("/var/cache/strata")?;
//! let report = Runner::new(&DeclaredResolver).run(
//!     &pipeline,
//!     Path::new("/srv/envs/base"),
//!     &mut cache,
//!     &mut NoObserver,
//! )?;
//! assert!(report.is_success());
//! # Ok::<(), provision::Error>(())
//! ```

pub mod cache;
pub mod error;
pub mod executor;
pub mod lock;
pub mod package;
pub mod principal;
pub mod resolver;
pub mod runner;
pub mod state;
pub mod step;

pub use cache::{CacheEntry, LayerCache};
pub use error::{Error, Result};
pub use executor::Executor;
pub use lock::StateLock;
pub use package::PackageSpec;
pub use principal::Principal;
pub use resolver::{DeclaredResolver, LATEST, ResolvedPackage, Resolver};
pub use runner::{
    CancelToken, NoObserver, Pipeline, RunFailure, RunObserver, RunOptions, RunOutcome, RunReport,
    Runner, StepReport, StepStatus,
};
pub use state::{EnvironmentState, Metadata, UserRecord};
pub use step::{Op, Step, Warning};
