use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Args as ClapArgs;

use stowage_core::storage::sweep_temp_dir;

use super::Context;

#[derive(ClapArgs)]
pub struct Args {
    /// Remove temp files older than this (e.g. "30m", "2h"); defaults to the configured retention
    #[arg(long, value_parser = humantime::parse_duration)]
    pub retention: Option<Duration>,
}

pub async fn execute(ctx: &Context, args: Args) -> Result<()> {
    let retention = args.retention.unwrap_or(ctx.config.temp_retention);
    let report = sweep_temp_dir(ctx.storage.temp_dir(), retention)
        .await
        .context("Failed to sweep temp directory")?;

    println!(
        "scanned {} removed {} failed {} (retention {})",
        report.scanned,
        report.removed,
        report.failed,
        humantime::format_duration(retention)
    );
    Ok(())
}
