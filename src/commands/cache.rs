//! Cache command - inspect or clear the persisted layer cache

use anyhow::{Context, Result};
use provision::LayerCache;
use std::path::Path;

use crate::Context as AppContext;
use crate::ui;

pub fn stats(ctx: &AppContext, cache_dir: Option<&Path>) -> Result<()> {
    let dir = super::cache_dir(cache_dir)?;
    let cache = LayerCache::open(&dir)
        .with_context(|| format!("Could not open layer cache at {}", dir.display()))?;

    ui::header("Layer cache");
    ui::kv("directory", &dir.display().to_string());
    ui::kv("entries", &cache.len().to_string());
    ui::kv("layers size", &ui::format_size(cache.layers_size()?));

    if ctx.verbose > 0 {
        println!();
        for (key, entry) in cache.entries() {
            ui::dim(&format!(
                "{}  {}  {} ({})",
                ui::short_hash(key),
                ui::short_hash(&entry.result_hash),
                entry.step,
                entry.created_at.format("%Y-%m-%d %H:%M"),
            ));
        }
    }

    Ok(())
}

pub fn clear(_ctx: &AppContext, cache_dir: Option<&Path>, yes: bool) -> Result<()> {
    let dir = super::cache_dir(cache_dir)?;
    let mut cache = LayerCache::open(&dir)
        .with_context(|| format!("Could not open layer cache at {}", dir.display()))?;

    if cache.is_empty() {
        ui::info("Layer cache is already empty");
        return Ok(());
    }

    if !yes {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(format!(
                "Delete {} cached layers ({})?",
                cache.len(),
                ui::format_size(cache.layers_size()?)
            ))
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;

        if !confirmed {
            ui::info("Cancelled");
            return Ok(());
        }
    }

    let removed = cache.clear()?;
    ui::success(&format!("Removed {removed} cache entries"));
    Ok(())
}
