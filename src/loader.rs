//! Pipeline definition loading
//!
//! Definitions are TOML: a pipeline name, an optional `[vars]` table, and
//! an ordered `[[steps]]` list. `${var}` references in string fields are
//! expanded from the vars table; `--base-user`/`--base-uid` override the
//! `base_user`/`base_uid` entries, the general form of the original
//! recipe's build arguments. Unknown variables are a load error.

use anyhow::{Context, Result};
use provision::{Op, PackageSpec, Pipeline, Principal, Step};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// CLI-provided variable overrides
#[derive(Debug, Default)]
pub struct Overrides {
    pub base_user: Option<String>,
    pub base_uid: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineDef {
    name: String,
    #[serde(default)]
    vars: BTreeMap<String, String>,
    #[serde(default)]
    steps: Vec<StepDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepDef {
    name: String,
    principal: String,
    #[serde(default)]
    ops: Vec<OpDef>,
}

/// Raw, string-typed operations as they appear in the definition file
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
enum OpDef {
    Install {
        packages: Vec<String>,
    },
    CreateUser {
        name: String,
        uid: String,
    },
    CreateRuntime {
        path: String,
        #[serde(default)]
        bin: Vec<String>,
    },
    Mkdir {
        path: String,
    },
    WriteFile {
        path: String,
        contents: String,
        #[serde(default)]
        executable: bool,
    },
    Alias {
        name: String,
        target: String,
    },
    Run {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Load a pipeline definition from a file
pub fn load_file(path: &Path, overrides: &Overrides) -> Result<Pipeline> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Could not read {}", path.display()))?;
    load_str(&content, overrides)
        .with_context(|| format!("Invalid pipeline definition: {}", path.display()))
}

/// Load a pipeline definition from a string
pub fn load_str(content: &str, overrides: &Overrides) -> Result<Pipeline> {
    let def: PipelineDef = toml::from_str(content).context("Failed to parse TOML")?;

    let mut vars = def.vars;
    if let Some(user) = &overrides.base_user {
        vars.insert("base_user".to_string(), user.clone());
    }
    if let Some(uid) = overrides.base_uid {
        vars.insert("base_uid".to_string(), uid.to_string());
    }

    let mut steps = Vec::with_capacity(def.steps.len());
    for step in def.steps {
        steps.push(lower_step(step, &vars)?);
    }

    Ok(Pipeline::new(def.name, steps))
}

fn lower_step(def: StepDef, vars: &BTreeMap<String, String>) -> Result<Step> {
    let context = || format!("in step '{}'", def.name);

    let name = expand(&def.name, vars).with_context(context)?;
    let principal = Principal::named(&expand(&def.principal, vars).with_context(context)?);
    let mut ops = Vec::with_capacity(def.ops.len());
    for op in def.ops {
        ops.push(lower_op(op, vars).with_context(context)?);
    }

    Ok(Step::new(name, principal, ops))
}

fn lower_op(def: OpDef, vars: &BTreeMap<String, String>) -> Result<Op> {
    Ok(match def {
        OpDef::Install { packages } => {
            let mut specs = Vec::with_capacity(packages.len());
            for raw in packages {
                specs.push(PackageSpec::parse(&expand(&raw, vars)?)?);
            }
            Op::Install { packages: specs }
        }
        OpDef::CreateUser { name, uid } => {
            let uid = expand(&uid, vars)?;
            Op::CreateUser {
                name: expand(&name, vars)?,
                uid: uid
                    .parse()
                    .with_context(|| format!("invalid uid '{uid}'"))?,
            }
        }
        OpDef::CreateRuntime { path, bin } => Op::CreateRuntime {
            path: expand_path(&path, vars)?,
            bin: bin
                .iter()
                .map(|b| expand(b, vars))
                .collect::<Result<_>>()?,
        },
        OpDef::Mkdir { path } => Op::Mkdir {
            path: expand_path(&path, vars)?,
        },
        OpDef::WriteFile {
            path,
            contents,
            executable,
        } => Op::WriteFile {
            path: expand_path(&path, vars)?,
            contents: expand(&contents, vars)?,
            executable,
        },
        OpDef::Alias { name, target } => Op::Alias {
            name: expand(&name, vars)?,
            target: expand_path(&target, vars)?,
        },
        OpDef::Run { program, args } => Op::Run {
            program: expand(&program, vars)?,
            args: args
                .iter()
                .map(|a| expand(a, vars))
                .collect::<Result<_>>()?,
        },
    })
}

fn expand(input: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let expanded = shellexpand::env_with_context(input, |name: &str| {
        match vars.get(name) {
            Some(value) => Ok(Some(value)),
            None => Err(format!("undefined variable `{name}`")),
        }
    })
    .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(expanded.into_owned())
}

fn expand_path(input: &str, vars: &BTreeMap<String, String>) -> Result<PathBuf> {
    Ok(PathBuf::from(expand(input, vars)?))
}
