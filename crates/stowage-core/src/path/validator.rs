//! The path validation pipeline.

use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};

use relative_path::RelativePath;
use tracing::{debug, trace};
use unicode_normalization::UnicodeNormalization;

use super::{PathError, ValidatedPath};

/// Maximum accepted input length in bytes.
pub const MAX_PATH_LENGTH: usize = 4096;

/// How many layers of percent-encoding are peeled off while scanning.
const MAX_DECODE_DEPTH: usize = 3;

/// Lower-cased substrings that are rejected outright, before any decoding.
///
/// Decoding below catches the general case; these cover encodings that do not
/// decode to valid UTF-8 (`%c0%ae` is an overlong `.`) and make the common
/// attack shapes explicit.
const TRAVERSAL_PATTERNS: &[&str] = &[
    "..",
    "%2e%2e",
    "%2e.",
    ".%2e",
    "%252e%252e",
    "%252e.",
    ".%252e",
    "..%2f",
    "..%5c",
    "..\\",
    "%c0%ae",
    "\u{2025}",
    "\u{ff0e}\u{ff0e}",
];

/// Validates caller-supplied paths against a storage root.
///
/// The validator is cheap to clone and holds no shared state; each storage
/// instance builds its own from its configured root.
///
/// # Example
///
/// ```
/// use stowage_core::path::{PathError, PathValidator};
///
/// let validator = PathValidator::new("/srv/stowage");
///
/// let full = validator.validate_and_get_full_path("/photos/cat.jpg").unwrap();
/// assert!(full.starts_with("/srv/stowage"));
///
/// assert_eq!(
///     validator.validate_and_normalize_path("/photos/%2e%2e/etc/passwd"),
///     Err(PathError::PathTraversal),
/// );
/// ```
#[derive(Debug, Clone)]
pub struct PathValidator {
    root: PathBuf,
    max_length: usize,
    reserved_dir: Option<String>,
}

impl PathValidator {
    /// Create a validator confining paths to `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_length: MAX_PATH_LENGTH,
            reserved_dir: None,
        }
    }

    /// Override the maximum accepted input length.
    #[must_use]
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Refuse paths under the top-level directory `name` (compared ASCII
    /// case-insensitively) with [`PathError::ReservedPath`].
    ///
    /// Storage keeps its temp directory there; callers must never read,
    /// write or remove anything inside it.
    #[must_use]
    pub fn with_reserved_dir(mut self, name: impl Into<String>) -> Self {
        self.reserved_dir = Some(name.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_reserved(&self, normalized: &str) -> Result<(), PathError> {
        let Some(reserved) = self.reserved_dir.as_deref() else {
            return Ok(());
        };
        match normalized.split('/').find(|s| !s.is_empty()) {
            Some(first) if first.eq_ignore_ascii_case(reserved) => {
                debug!(normalized = %normalized, "Rejected path inside reserved directory");
                Err(PathError::ReservedPath {
                    name: reserved.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Validate and normalize a caller-supplied path.
    ///
    /// `/./file.txt` becomes `/file.txt`, duplicate and back-slash separators are
    /// collapsed, and a single leading `/` is forced. Any `..`, in any
    /// encoding and in any position, is rejected with
    /// [`PathError::PathTraversal`].
    pub fn validate_and_normalize_path(&self, input: &str) -> Result<ValidatedPath, PathError> {
        if input.is_empty() {
            return Err(PathError::EmptyPath);
        }
        if input.len() > self.max_length {
            return Err(PathError::PathTooLong {
                len: input.len(),
                max: self.max_length,
            });
        }
        if input.contains(['\0', '\r', '\n', '\t']) {
            return Err(PathError::InvalidCharacters);
        }

        if contains_traversal(input) {
            debug!(input = %sanitize_path(input), "Rejected traversal in raw path");
            return Err(PathError::PathTraversal);
        }

        let normalized = normalize(input);

        if contains_traversal(&normalized) {
            debug!(normalized = %sanitize_path(&normalized), "Rejected traversal after normalization");
            return Err(PathError::PathTraversal);
        }
        check_depth(&normalized)?;
        self.check_reserved(&normalized)?;

        trace!(input = %sanitize_path(input), normalized = %normalized, "Path validated");
        Ok(ValidatedPath::from_normalized(normalized))
    }

    /// Validate a path and resolve it to a system path under the root.
    ///
    /// After joining, the relative offset from the root is computed again from
    /// the physical path and rejected with [`PathError::InvalidPath`] unless
    /// every component is a plain name.
    pub fn validate_and_get_full_path(&self, input: &str) -> Result<PathBuf, PathError> {
        let validated = self.validate_and_normalize_path(input)?;
        self.full_path(&validated)
    }

    /// Resolve an already-validated path to its system path, re-checking
    /// containment.
    pub fn full_path(&self, path: &ValidatedPath) -> Result<PathBuf, PathError> {
        self.check_reserved(path.as_str())?;
        let relative = RelativePath::new(path.as_str().trim_start_matches('/'));
        let full = relative.to_path(&self.root);

        let offset = full.strip_prefix(&self.root).map_err(|_| PathError::InvalidPath)?;
        let escapes = offset.components().any(|c| !matches!(c, Component::Normal(_)))
            || offset.to_string_lossy().starts_with("..");
        if escapes {
            debug!(path = %path, "Joined path escaped the storage root");
            return Err(PathError::InvalidPath);
        }
        Ok(full)
    }

    /// Check a single filename segment. See [`super::is_valid_filename`].
    pub fn is_valid_filename(name: &str) -> Result<(), PathError> {
        super::is_valid_filename(name)
    }

    /// Render a system path as a root-relative virtual path for messages that
    /// may reach untrusted callers.
    pub fn to_display(&self, full: &Path) -> String {
        display_relative(&self.root, full)
    }
}

/// Render `full` relative to `root` as `/a/b`, without leaking the root.
pub(crate) fn display_relative(root: &Path, full: &Path) -> String {
    match full.strip_prefix(root) {
        Ok(rel) => {
            let joined = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            format!("/{joined}")
        }
        Err(_) => "<outside storage root>".to_string(),
    }
}

/// Best-effort cleanup for logging and display.
///
/// Replaces `..` with `__` and strips control characters. Never use the result
/// for an authorization decision.
pub fn sanitize_path(input: &str) -> String {
    input.replace("..", "__").chars().filter(|c| !c.is_control()).collect()
}

/// Whether `input` contains a parent-directory reference in any encoding we
/// know of.
pub(super) fn contains_traversal(input: &str) -> bool {
    let lowered = input.to_lowercase();
    if TRAVERSAL_PATTERNS.iter().any(|pattern| lowered.contains(pattern)) {
        return true;
    }

    let mut layer: Cow<'_, str> = Cow::Borrowed(&lowered);
    for _ in 0..MAX_DECODE_DEPTH {
        if has_dot_dot(&layer) {
            return true;
        }
        let decoded = {
            let bytes = urlencoding::decode_binary(layer.as_bytes());
            String::from_utf8_lossy(&bytes).to_lowercase()
        };
        if decoded == *layer {
            break;
        }
        layer = Cow::Owned(decoded);
    }
    has_dot_dot(&layer)
}

/// `..` directly, with back-slashes, or after NFKC folding (fullwidth and
/// leader dots fold to `.`).
fn has_dot_dot(s: &str) -> bool {
    if s.contains("..") {
        return true;
    }
    let folded: String = s.nfkc().collect();
    folded.contains("..") || folded.replace('\\', "/").split('/').any(|seg| seg == "..")
}

/// Collapse `input` into a clean absolute-style virtual path.
fn normalize(input: &str) -> String {
    let unified = input.replace('\\', "/");
    let segments: Vec<&str> = unified
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect();

    let mut out = format!("/{}", segments.join("/"));
    while out.contains("//") {
        out = out.replace("//", "/");
    }
    out
}

/// Walk segments with a nesting counter; a path that climbs above its start
/// is rejected even if it is otherwise well-formed.
pub(super) fn check_depth(normalized: &str) -> Result<(), PathError> {
    let mut depth: i64 = 0;
    for segment in normalized.split('/').filter(|s| !s.is_empty()) {
        if segment == ".." {
            depth -= 1;
            if depth < 0 {
                return Err(PathError::PathTraversal);
            }
        } else if segment != "." {
            depth += 1;
        }
    }
    Ok(())
}
