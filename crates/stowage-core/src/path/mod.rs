//! Path validation for caller-supplied storage paths.
//!
//! Every path that reaches the filesystem or the metadata store passes through
//! [`PathValidator`] first. The validator produces a [`ValidatedPath`], a
//! virtual `/`-rooted path that is guaranteed, by construction, to:
//!
//! - start with a single `/` separator,
//! - contain no parent-directory segment in any encoding,
//! - stay inside the storage root once joined onto it.
//!
//! # Layered Checks
//!
//! Traversal is checked three times, independently:
//!
//! 1. The raw input is scanned for `..` in literal, percent-encoded,
//!    double-encoded, backslash and Unicode compatibility forms.
//! 2. The normalized path is scanned again and walked with a depth counter.
//! 3. The joined system path is re-checked for containment relative to the
//!    root ([`PathValidator::validate_and_get_full_path`]).
//!
//! Removing any of the three changes behavior; they are not redundant
//! optimizations of each other.

mod filename;
mod validator;

use std::fmt;

use thiserror::Error;

pub use filename::{is_valid_filename, MAX_FILENAME_LENGTH, RESERVED_NAMES};
pub use validator::{sanitize_path, PathValidator, MAX_PATH_LENGTH};
pub(crate) use validator::display_relative;

/// Errors produced while validating a path or filename.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    EmptyPath,

    #[error("path is too long: {len} bytes (max {max})")]
    PathTooLong { len: usize, max: usize },

    #[error("path contains invalid characters")]
    InvalidCharacters,

    #[error("path traversal detected")]
    PathTraversal,

    /// The joined system path escaped the storage root.
    #[error("path resolves outside the storage root")]
    InvalidPath,

    #[error("invalid filename '{name}': {reason}")]
    InvalidFilename { name: String, reason: &'static str },

    /// The path lies inside a directory the storage keeps for itself.
    #[error("'/{name}' is reserved for internal use")]
    ReservedPath { name: String },
}

/// A normalized, root-confined virtual path such as `/docs/report.pdf`.
///
/// Only [`PathValidator`] can construct one. The root itself is `/`.
///
/// # Examples
///
/// ```
/// use stowage_core::path::PathValidator;
///
/// let validator = PathValidator::new("/srv/stowage");
/// let path = validator.validate_and_normalize_path("docs//./report.pdf").unwrap();
/// assert_eq!(path.as_str(), "/docs/report.pdf");
/// assert_eq!(path.file_name(), Some("report.pdf"));
/// assert_eq!(path.parent().unwrap().as_str(), "/docs");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidatedPath(String);

impl ValidatedPath {
    /// Wrap an already-normalized path. Callers inside the crate must have run
    /// the full validation pipeline first.
    pub(crate) fn from_normalized(path: String) -> Self {
        debug_assert!(path.starts_with('/'));
        ValidatedPath(path)
    }

    /// The storage root (`/`).
    #[inline]
    pub fn root() -> Self {
        ValidatedPath("/".to_string())
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final segment of the path, or `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// Parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) | None => Some(Self::root()),
            Some(idx) => Some(ValidatedPath(self.0[..idx].to_string())),
        }
    }

    /// Append a single filename segment.
    ///
    /// The name is checked with [`is_valid_filename`] and the joined path goes
    /// through the same traversal scan as [`PathValidator`], so names such as
    /// `x..y` or `%2e%2e` are refused here too. Length limits and reserved
    /// directories are the validator's business; re-validate the result when
    /// they matter.
    pub fn join(&self, name: &str) -> Result<Self, PathError> {
        is_valid_filename(name)?;
        let joined = if self.is_root() {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.0)
        };
        if validator::contains_traversal(&joined) {
            return Err(PathError::PathTraversal);
        }
        validator::check_depth(&joined)?;
        Ok(ValidatedPath(joined))
    }

    /// Path segments without the leading separator.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Whether `self` is `other` or lies underneath it.
    pub fn starts_with(&self, other: &ValidatedPath) -> bool {
        if other.is_root() {
            return true;
        }
        self.0 == other.0
            || (self.0.starts_with(&other.0) && self.0.as_bytes().get(other.0.len()) == Some(&b'/'))
    }
}

impl AsRef<str> for ValidatedPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ValidatedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
