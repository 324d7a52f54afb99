use anyhow::{Result, anyhow};
use clap::Args as ClapArgs;

use stowage_core::path::{PathError, ValidatedPath, is_valid_filename, sanitize_path};
use stowage_core::PathValidator;

#[derive(ClapArgs)]
pub struct Args {
    /// Paths to validate; each accepted path is printed in normalized form
    #[arg(required = true)]
    pub paths: Vec<String>,
}

fn check_one(validator: &PathValidator, input: &str) -> Result<ValidatedPath, PathError> {
    let validated = validator.validate_and_normalize_path(input)?;
    for segment in validated.segments() {
        is_valid_filename(segment)?;
    }
    Ok(validated)
}

/// Validate without touching the storage root.
pub fn execute(validator: &PathValidator, args: &Args) -> Result<()> {
    let mut first_error = None;
    let mut rejected = 0usize;

    for input in &args.paths {
        match check_one(validator, input) {
            Ok(path) => println!("{path}"),
            Err(e) => {
                println!("rejected {}: {e}", sanitize_path(input));
                rejected += 1;
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        None => Ok(()),
        Some(e) => Err(anyhow!(e).context(format!("{rejected} of {} paths rejected", args.paths.len()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_one() {
        let validator = PathValidator::new("/srv/stowage");
        assert_eq!(check_one(&validator, "a//b/./c.txt").unwrap().as_str(), "/a/b/c.txt");
        assert_eq!(check_one(&validator, "/a/../../x"), Err(PathError::PathTraversal));
        assert!(matches!(
            check_one(&validator, "/docs/CON.txt"),
            Err(PathError::InvalidFilename { .. })
        ));
    }
}
