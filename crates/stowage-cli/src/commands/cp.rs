use anyhow::Result;
use clap::Args as ClapArgs;
use tracing::info;

use super::Context;

#[derive(ClapArgs)]
pub struct Args {
    /// Source file path
    pub source: String,

    /// Destination file path
    pub dest: String,
}

pub async fn execute(ctx: &Context, args: Args) -> Result<()> {
    let source = ctx.resolve(&args.source)?;
    let dest = ctx.resolve_entry(&args.dest)?;
    let copied = ctx.storage.copy_file(&source, &dest).await?;
    info!(bytes = copied, "Copied file");
    Ok(())
}
