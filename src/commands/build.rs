//! Build command - run a pipeline against an environment root

use anyhow::{Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use provision::{
    CancelToken, DeclaredResolver, Error, LayerCache, NoObserver, RunObserver, RunOptions,
    RunReport, Runner, Step, StepStatus,
};

use crate::Context as AppContext;
use crate::cli::BuildArgs;
use crate::loader::{self, Overrides};
use crate::ui;

pub fn run(ctx: &AppContext, args: BuildArgs) -> Result<i32> {
    let overrides = Overrides {
        base_user: args.base_user.clone(),
        base_uid: args.base_uid,
    };
    let pipeline = loader::load_file(&args.pipeline, &overrides)?;

    let cache_dir = super::cache_dir(args.cache_dir.as_deref())?;
    let mut cache = LayerCache::open(&cache_dir)
        .with_context(|| format!("Could not open layer cache at {}", cache_dir.display()))?;

    // Ctrl-C cancels at the next step boundary; mid-step state is never
    // committed or cached, so there is nothing to cancel into
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).context("Failed to install Ctrl-C handler")?;
    }

    let runner = Runner::new(&DeclaredResolver)
        .with_options(RunOptions {
            read_cache: !args.no_cache,
        })
        .with_cancel(cancel);

    if !ctx.quiet {
        ui::header(&format!("Pipeline: {}", pipeline.name));
        ui::kv("steps", &pipeline.steps.len().to_string());
        ui::kv("state root", &args.state_root.display().to_string());
        ui::kv("cache", &cache_dir.display().to_string());
        if args.no_cache {
            ui::info("cache reads disabled (--no-cache)");
        }
        println!();
    }

    let report = if ctx.quiet {
        runner.run(&pipeline, &args.state_root, &mut cache, &mut NoObserver)?
    } else {
        let mut progress = StepProgress::new(pipeline.steps.len());
        let result = runner.run(&pipeline, &args.state_root, &mut cache, &mut progress);
        progress.finish();
        result?
    };

    if !ctx.quiet {
        render_report(&report);
    }

    Ok(exit_code(&report))
}

/// Progress bar over the pipeline's steps
struct StepProgress {
    bar: ProgressBar,
}

impl StepProgress {
    fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template("{bar:30.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl RunObserver for StepProgress {
    fn on_step_start(&mut self, _index: usize, _total: usize, step: &Step) {
        self.bar
            .set_message(format!("{} ({})", step.name, step.principal));
    }

    fn on_step_complete(&mut self, _index: usize, step: &Step, cache_hit: bool) {
        let marker = if cache_hit { "cached" } else { "executed" };
        self.bar.println(format!(
            "{} {} {}",
            "✓".green(),
            step.name,
            format!("({marker})").dimmed()
        ));
        self.bar.inc(1);
    }
}

fn render_report(report: &RunReport) {
    println!();
    for (i, step) in report.steps.iter().enumerate() {
        let status = match step.status {
            StepStatus::Succeeded if step.cache_hit => "cached".cyan(),
            StepStatus::Succeeded => "executed".green(),
            StepStatus::Failed => "failed".red(),
            StepStatus::Running => "interrupted".yellow(),
            StepStatus::Pending => "not run".dimmed(),
        };
        ui::step(
            i + 1,
            report.steps.len(),
            &format!("{} ({}) {}", step.name, step.principal, status),
        );
    }
    println!();

    for warning in &report.warnings {
        ui::warn(&warning.to_string());
    }

    match &report.failure {
        None => {
            ui::success(&format!(
                "Completed: {} executed, {} from cache",
                report.executed, report.cache_hits
            ));
            if let Some(hash) = &report.final_hash {
                ui::kv("state", ui::short_hash(hash));
            }
            ui::kv("principal", report.final_principal.name());
        }
        Some(failure) => {
            ui::error(&format!(
                "Aborted at step '{}' (as {})",
                failure.step, failure.principal
            ));
            if let Some(command) = &failure.command {
                ui::kv("command", command);
            }
            ui::kv(
                "path",
                if failure.cache_hit_path {
                    "cache hit (possible cache corruption)"
                } else {
                    "fresh execution"
                },
            );
            ui::kv("cause", &failure.error.to_string());
        }
    }
}

/// Distinct exit codes per abort cause, 0 on completion
fn exit_code(report: &RunReport) -> i32 {
    match &report.failure {
        None => 0,
        Some(failure) => match failure.error {
            Error::CommandFailure { .. } | Error::DanglingAlias { .. } => 2,
            Error::UnknownPrincipal { .. } => 3,
            Error::CacheConflict { .. } => 4,
            _ => 1,
        },
    }
}
