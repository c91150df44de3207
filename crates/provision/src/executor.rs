//! Step executor: applies one step's command-set under its principal
//!
//! A step executes against a staged copy of the environment root and is
//! committed as a whole on success. A failed step leaves the committed
//! state byte-identical to its predecessor (atomic-at-step granularity;
//! sub-command granularity is deliberately not offered, since later
//! commands in a step may assume earlier ones succeeded).

use crate::error::{Error, Result};
use crate::principal::Principal;
use crate::resolver::Resolver;
use crate::state::{self, EnvironmentState, Metadata, Staging};
use crate::step::{Op, Step};
use std::fs;
use std::path::Path;
use std::process::Command;

/// Applies steps under their declared principals
pub struct Executor<'a> {
    resolver: &'a dyn Resolver,
}

impl<'a> Executor<'a> {
    pub fn new(resolver: &'a dyn Resolver) -> Self {
        Self { resolver }
    }

    /// Execute `step` on top of `state`, honoring the current principal.
    ///
    /// The principal switch (if any) is validated before any filesystem
    /// mutation; the command-set then runs strictly in order against a
    /// staged copy, which replaces the root only when every operation and
    /// the alias re-resolution check succeed.
    pub fn execute(
        &self,
        step: &Step,
        state: &mut EnvironmentState,
        current: &mut Principal,
    ) -> Result<()> {
        switch_principal(step, state.meta(), current)?;

        let mut staging = state.begin_staging()?;
        for op in &step.ops {
            log::debug!("step '{}': {}", step.name, op.describe());
            if let Err(e) = self.apply_op(op, &mut staging, step, current) {
                staging.discard();
                return Err(e);
            }
        }

        if let Err(e) = verify_aliases(&staging, step) {
            staging.discard();
            return Err(e);
        }

        state.commit(staging)
    }

    fn apply_op(
        &self,
        op: &Op,
        staging: &mut Staging,
        step: &Step,
        principal: &Principal,
    ) -> Result<()> {
        let fail = |status: String| Error::CommandFailure {
            step: step.name.clone(),
            principal: principal.clone(),
            command: op.describe(),
            status,
        };

        match op {
            Op::Install { packages } => {
                for spec in packages {
                    let resolved = self.resolver.resolve(spec)?;
                    if let Some(pin) = &spec.version {
                        if resolved.version != *pin {
                            return Err(fail(format!(
                                "resolved version {} does not match pin {}",
                                resolved.version, pin
                            )));
                        }
                    }
                    staging
                        .meta
                        .packages
                        .insert(resolved.name, resolved.version);
                }
                Ok(())
            }

            Op::CreateUser { name, uid } => {
                if name == "root" {
                    return Err(fail("the root user always exists".to_string()));
                }
                if staging.meta.users.contains_key(name) {
                    return Err(fail(format!("user '{name}' already exists")));
                }
                let home = Path::new("/home").join(name);
                fs::create_dir_all(staging.host_path(&home))?;
                staging.meta.users.insert(
                    name.clone(),
                    state::UserRecord {
                        uid: *uid,
                        home,
                    },
                );
                Ok(())
            }

            Op::CreateRuntime { path, bin } => {
                let bin_dir = staging.host_path(path).join("bin");
                fs::create_dir_all(&bin_dir)?;
                for seed in bin {
                    let target = bin_dir.join(seed);
                    fs::write(
                        &target,
                        format!("#!/bin/sh\n# {seed} from the runtime at {}\n", path.display()),
                    )?;
                    make_executable(&target)?;
                }
                Ok(())
            }

            Op::Mkdir { path } => {
                fs::create_dir_all(staging.host_path(path))?;
                Ok(())
            }

            Op::WriteFile {
                path,
                contents,
                executable,
            } => {
                let target = staging.host_path(path);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&target, contents)?;
                if *executable {
                    make_executable(&target)?;
                }
                Ok(())
            }

            Op::Alias { name, target } => {
                if !state::is_executable(&staging.host_path(target)) {
                    return Err(fail(format!(
                        "alias target {} is missing or not executable",
                        target.display()
                    )));
                }
                // Last write wins; overwrites are observable via the table
                staging.meta.aliases.insert(name.clone(), target.clone());
                Ok(())
            }

            Op::Run { program, args } => {
                let output = Command::new(program)
                    .args(args)
                    .current_dir(&staging.dir)
                    .env("PROVISION_ROOT", &staging.dir)
                    .env("PROVISION_PRINCIPAL", principal.name())
                    .output()
                    .map_err(|e| fail(format!("failed to spawn: {e}")))?;

                if output.status.success() {
                    return Ok(());
                }

                let mut status = describe_exit(&output.status);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stderr = stderr.trim();
                if !stderr.is_empty() {
                    status = format!("{status}: {stderr}");
                }
                Err(fail(status))
            }
        }
    }
}

/// Validate and apply the step's principal switch against the predecessor
/// state. Root always exists; named users must have been created by an
/// earlier step. Fails before any filesystem mutation.
pub(crate) fn switch_principal(
    step: &Step,
    meta: &Metadata,
    current: &mut Principal,
) -> Result<()> {
    if step.principal == *current {
        return Ok(());
    }

    if let Principal::User(name) = &step.principal {
        if !meta.users.contains_key(name) {
            return Err(Error::UnknownPrincipal {
                step: step.name.clone(),
                principal: name.clone(),
            });
        }
    }

    log::info!(
        "step '{}': switching principal {} -> {}",
        step.name,
        current,
        step.principal
    );
    *current = step.principal.clone();
    Ok(())
}

/// Every installed alias must still resolve to an executable once the
/// step's command-set has run
fn verify_aliases(staging: &Staging, step: &Step) -> Result<()> {
    for (alias, target) in &staging.meta.aliases {
        if !state::is_executable(&staging.host_path(target)) {
            return Err(Error::DanglingAlias {
                step: step.name.clone(),
                alias: alias.clone(),
                target: target.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

fn describe_exit(status: &std::process::ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {signal}");
        }
    }
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated abnormally".to_string(),
    }
}
