//! Stable exit codes for storyloop CLI commands.

/// Every story passed (or the requested command succeeded).
pub const OK: i32 = 0;
/// Invalid config or arguments, or no usable plan could be generated or loaded.
pub const INVALID: i32 = 1;
/// The run stopped with unfinished stories (retries, iteration ceiling, store failure).
pub const FAILED: i32 = 2;
/// The run was cancelled; the plan is kept for resuming.
pub const CANCELLED: i32 = 3;
