//! Exit codes for the CLI.
//!
//! These follow common Unix conventions and provide meaningful
//! status information for scripting and automation.

/// Successful execution
pub const SUCCESS: u8 = 0;

/// General/unspecified error
pub const GENERAL_ERROR: u8 = 1;

/// Input was refused before anything changed: bad arguments, an invalid or
/// traversing path, an unusable config
pub const REJECTED_INPUT: u8 = 2;

/// File or directory not found (within the storage root)
pub const NOT_FOUND: u8 = 3;
