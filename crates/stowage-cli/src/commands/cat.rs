use anyhow::Result;
use clap::Args as ClapArgs;
use tokio::io::AsyncWriteExt;

use super::Context;

#[derive(ClapArgs)]
pub struct Args {
    /// File path within the storage root
    pub file: String,
}

pub async fn execute(ctx: &Context, args: Args) -> Result<()> {
    let path = ctx.resolve(&args.file)?;
    let mut file = ctx.storage.open_file(&path).await?;
    let mut stdout = tokio::io::stdout();
    tokio::io::copy(&mut file, &mut stdout).await?;
    stdout.flush().await?;
    Ok(())
}
