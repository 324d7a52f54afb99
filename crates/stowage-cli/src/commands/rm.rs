use anyhow::Result;
use clap::Args as ClapArgs;

use stowage_core::error::{StorageContext, StorageError};

use super::Context;

#[derive(ClapArgs)]
pub struct Args {
    /// Path to remove; directories are removed with their contents
    pub path: String,

    /// Succeed even if the path does not exist
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(ctx: &Context, args: Args) -> Result<()> {
    let path = ctx.resolve_entry(&args.path)?;

    if !args.force && !ctx.storage.exists(&path).await? {
        return Err(StorageError::NotFound {
            context: StorageContext::new()
                .with_operation("remove")
                .with_path(ctx.storage.display(&path)),
        }
        .into());
    }

    ctx.storage.delete_file(&path).await?;
    Ok(())
}
