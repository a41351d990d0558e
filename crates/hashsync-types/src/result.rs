//! Result type alias for hashsync operations

use crate::Error;

/// Result type alias for hashsync operations
pub type Result<T> = std::result::Result<T, Error>;
