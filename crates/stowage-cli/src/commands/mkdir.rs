use anyhow::Result;
use clap::Args as ClapArgs;

use stowage_core::path::is_valid_filename;

use super::Context;

#[derive(ClapArgs)]
pub struct Args {
    /// Directory path to create; missing parents are created too
    pub path: String,
}

pub async fn execute(ctx: &Context, args: Args) -> Result<()> {
    let validated = ctx.validator.validate_and_normalize_path(&args.path)?;
    for segment in validated.segments() {
        is_valid_filename(segment)?;
    }
    let path = ctx.validator.full_path(&validated)?;
    ctx.storage.create_dir(&path).await?;
    Ok(())
}
