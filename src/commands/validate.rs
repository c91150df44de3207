//! Validate command - parse and statically check a pipeline definition

use anyhow::Result;
use std::path::Path;

use crate::Context as AppContext;
use crate::loader::{self, Overrides};
use crate::ui;

pub fn run(ctx: &AppContext, pipeline_file: &Path) -> Result<()> {
    let pipeline = loader::load_file(pipeline_file, &Overrides::default())?;

    let mut warnings = Vec::new();
    for step in &pipeline.steps {
        warnings.extend(step.validate()?);
    }

    if !ctx.quiet {
        ui::header(&format!("Pipeline: {}", pipeline.name));
        for (i, step) in pipeline.steps.iter().enumerate() {
            ui::step(
                i + 1,
                pipeline.steps.len(),
                &format!("{} ({}, {} ops)", step.name, step.principal, step.ops.len()),
            );
        }
        println!();

        for warning in &warnings {
            ui::warn(&warning.to_string());
        }
    }

    ui::success(&format!(
        "{} is valid: {} steps, {} warnings",
        pipeline_file.display(),
        pipeline.steps.len(),
        warnings.len()
    ));
    Ok(())
}
