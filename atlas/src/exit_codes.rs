//! Stable exit codes for atlas CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid arguments, config, storage or other errors.
pub const INVALID: i32 = 1;
/// The requested run or knowledge host does not exist.
pub const NOT_FOUND: i32 = 2;
