use anyhow::Result;
use clap::Args as ClapArgs;

use super::Context;

#[derive(ClapArgs)]
pub struct Args {
    /// Source path
    pub source: String,

    /// Destination path
    pub dest: String,
}

pub async fn execute(ctx: &Context, args: Args) -> Result<()> {
    let source = ctx.resolve(&args.source)?;
    let dest = ctx.resolve_entry(&args.dest)?;
    ctx.storage.move_file(&source, &dest).await?;
    Ok(())
}
