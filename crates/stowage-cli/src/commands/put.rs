use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args as ClapArgs;
use tracing::info;

use super::Context;

#[derive(ClapArgs)]
pub struct Args {
    /// Destination path within the storage root
    pub path: String,

    /// Read content from a local file instead of stdin
    #[arg(short, long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Permission bits for the stored file, in octal
    #[arg(long, default_value = "644", value_parser = parse_mode)]
    pub mode: u32,
}

fn parse_mode(s: &str) -> Result<u32, String> {
    let mode = u32::from_str_radix(s, 8).map_err(|_| format!("'{s}' is not an octal mode"))?;
    if mode > 0o7777 {
        return Err(format!("mode {s} is out of range"));
    }
    Ok(mode)
}

pub async fn execute(ctx: &Context, args: Args) -> Result<()> {
    let target = ctx.resolve_entry(&args.path)?;

    let written = match &args.input {
        Some(local) => {
            let mut file = tokio::fs::File::open(local)
                .await
                .with_context(|| format!("Failed to open {}", local.display()))?;
            ctx.storage.write_file_stream(&target, &mut file, args.mode).await?
        }
        None => {
            let mut stdin = tokio::io::stdin();
            ctx.storage.write_file_stream(&target, &mut stdin, args.mode).await?
        }
    };

    info!(path = %ctx.storage.display(&target), bytes = written, "Stored file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_core::DEFAULT_FILE_MODE;

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("644"), Ok(DEFAULT_FILE_MODE));
        assert_eq!(parse_mode("0600"), Ok(0o600));
        assert!(parse_mode("999").is_err());
        assert!(parse_mode("17777").is_err());
    }
}
