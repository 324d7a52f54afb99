//! Single-segment filename checks.

use super::PathError;

/// Maximum filename length in bytes.
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Windows device names that cannot be used as a file stem on any platform we
/// might later sync to.
pub const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const FORBIDDEN_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0'];

/// Check that `name` is usable as a single path segment.
///
/// # Examples
///
/// ```
/// use stowage_core::path::is_valid_filename;
///
/// assert!(is_valid_filename("My Report (v2).pdf").is_ok());
/// assert!(is_valid_filename("CON.txt").is_err());
/// assert!(is_valid_filename("file|pipe.txt").is_err());
/// ```
pub fn is_valid_filename(name: &str) -> Result<(), PathError> {
    let invalid = |reason| PathError::InvalidFilename {
        name: super::sanitize_path(name),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name == "." || name == ".." {
        return Err(invalid("name is a directory reference"));
    }
    if name.len() > MAX_FILENAME_LENGTH {
        return Err(invalid("name is longer than 255 bytes"));
    }
    if name.contains(FORBIDDEN_CHARS) || name.chars().any(char::is_control) {
        return Err(invalid("name contains a forbidden character"));
    }
    if name.starts_with(char::is_whitespace) || name.ends_with(char::is_whitespace) {
        return Err(invalid("name has leading or trailing whitespace"));
    }
    if name.ends_with('.') {
        return Err(invalid("name ends with a dot"));
    }
    if is_reserved(name) {
        return Err(invalid("name is a reserved device name"));
    }
    Ok(())
}

/// `CON`, `con.txt` and `Lpt1.tar.gz` are all reserved: only the part before
/// the first dot counts.
fn is_reserved(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name);
    RESERVED_NAMES.iter().any(|reserved| stem.eq_ignore_ascii_case(reserved))
}
