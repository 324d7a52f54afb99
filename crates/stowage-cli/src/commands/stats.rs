use anyhow::{Context as _, Result};
use clap::Args as ClapArgs;

use stowage_core::storage::TEMP_SUFFIX;

use super::Context;

#[derive(ClapArgs)]
pub struct Args {}

pub async fn execute(ctx: &Context, _args: Args) -> Result<()> {
    let stats = ctx.storage.stats();

    let mut pending = 0usize;
    let mut pending_bytes = 0u64;
    let mut entries = tokio::fs::read_dir(&stats.temp_dir)
        .await
        .context("Failed to read temp directory")?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX) {
            continue;
        }
        pending += 1;
        if let Ok(metadata) = entry.metadata().await {
            pending_bytes += metadata.len();
        }
    }

    println!("root:         {}", ctx.storage.root().display());
    println!("temp dir:     {}", stats.temp_dir.display());
    println!("temp files:   {pending} ({pending_bytes} bytes)");
    println!("active locks: {}", stats.active_locks);
    println!(
        "retention:    {}",
        humantime::format_duration(ctx.config.temp_retention)
    );
    Ok(())
}
