//! Error types and handling for hashsync
//!
//! Errors fall into a small taxonomy that callers act on differently:
//! transient transfer errors are retried in place, checksum failures force a
//! full re-fetch, unsupported and elevation errors are terminal, and
//! cancellation is not an error at all (the pipeline reports `Stopped`).

use crate::ContentHash;
use std::fmt;
use std::path::{Path, PathBuf};

/// Error severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorSeverity {
    /// Low severity - operation can continue
    Low,
    /// Medium severity - operation should be retried
    Medium,
    /// High severity - operation should be aborted
    High,
    /// Critical severity - the job cannot run in this environment at all
    Critical,
}

/// One file whose content did not match its manifest hash
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChecksumMismatch {
    /// Manifest name (or placed path) of the offending file
    pub name: String,
    /// Hash the manifest expects
    pub expected: ContentHash,
    /// Hash actually computed, if the file could be read
    pub actual: Option<ContentHash>,
}

impl fmt::Display for ChecksumMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.actual {
            Some(actual) => write!(
                f,
                "{} (expected {}, got {})",
                self.name, self.expected, actual
            ),
            None => write!(f, "{} (expected {}, unreadable)", self.name, self.expected),
        }
    }
}

/// Main error type for hashsync operations
#[derive(thiserror::Error, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {message}")]
    Io {
        /// Error message from the I/O operation
        message: String,
    },

    /// File not found
    #[error("File not found: {path}")]
    FileNotFound {
        /// Path to the file that was not found
        path: PathBuf,
    },

    /// Permission denied
    #[error("Permission denied: {path}")]
    PermissionDenied {
        /// Path to the file with permission issues
        path: PathBuf,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Transient network error (timeouts, resets, 5xx responses)
    #[error("Network error: {message}")]
    Network {
        /// Error message describing the network issue
        message: String,
    },

    /// The remote refused the request with a status that retrying will not fix
    #[error("Request to {url} rejected with HTTP status {status}")]
    RemoteRejected {
        /// Requested URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// Downloaded or placed content did not match the manifest
    #[error("Checksum verification failed for {} file(s): {}", .files.len(), format_mismatches(.files))]
    ChecksumFailed {
        /// Every offending file
        files: Vec<ChecksumMismatch>,
    },

    /// Malformed or inconsistent manifest
    #[error("Manifest error: {message}")]
    Manifest {
        /// Error message describing the manifest issue
        message: String,
    },

    /// The job is structurally impossible in this environment
    #[error("Unsupported: {message}")]
    Unsupported {
        /// Why the job cannot run
        message: String,
    },

    /// The out-of-process elevated helper failed
    #[error("Elevated helper failed (exit code {}): {message}", .exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    Elevation {
        /// Exit code reported by the helper, if it exited normally
        exit_code: Option<i32>,
        /// Error message describing the failure
        message: String,
    },

    /// An operation was invoked in a state that does not allow it
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Error message describing the state conflict
        message: String,
    },

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("Operation timed out after {seconds} seconds")]
    Timeout {
        /// Number of seconds after which the operation timed out
        seconds: u64,
    },

    /// Generic error with custom message
    #[error("{message}")]
    Other {
        /// Custom error message
        message: String,
    },
}

fn format_mismatches(files: &[ChecksumMismatch]) -> String {
    const SHOWN: usize = 5;
    let mut names: Vec<String> = files.iter().take(SHOWN).map(|m| m.name.clone()).collect();
    if files.len() > SHOWN {
        names.push(format!("and {} more", files.len() - SHOWN));
    }
    names.join(", ")
}

/// Error kind for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// I/O related errors
    Io,
    /// Configuration errors
    Config,
    /// Network errors
    Network,
    /// Checksum verification errors
    Checksum,
    /// Manifest errors
    Manifest,
    /// Structurally unsupported jobs
    Unsupported,
    /// Elevated helper errors
    Elevation,
    /// State machine misuse
    State,
    /// Cancellation
    Cancelled,
    /// Timeout
    Timeout,
    /// Other errors
    Other,
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::FileNotFound { .. } | Self::PermissionDenied { .. } => ErrorKind::Io,
            Self::Config { .. } => ErrorKind::Config,
            Self::Network { .. } | Self::RemoteRejected { .. } => ErrorKind::Network,
            Self::ChecksumFailed { .. } => ErrorKind::Checksum,
            Self::Manifest { .. } => ErrorKind::Manifest,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Elevation { .. } => ErrorKind::Elevation,
            Self::InvalidState { .. } => ErrorKind::State,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Other { .. } => ErrorKind::Other,
        }
    }

    /// Get the error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Io { .. } => ErrorSeverity::Medium,
            Self::FileNotFound { .. } | Self::PermissionDenied { .. } => ErrorSeverity::High,
            Self::Config { .. } => ErrorSeverity::High,
            Self::Network { .. } => ErrorSeverity::Medium,
            Self::RemoteRejected { .. } => ErrorSeverity::High,
            Self::ChecksumFailed { .. } => ErrorSeverity::High,
            Self::Manifest { .. } => ErrorSeverity::High,
            Self::Unsupported { .. } => ErrorSeverity::Critical,
            Self::Elevation { .. } => ErrorSeverity::High,
            Self::InvalidState { .. } => ErrorSeverity::High,
            Self::Cancelled => ErrorSeverity::Low,
            Self::Timeout { .. } => ErrorSeverity::Medium,
            Self::Other { .. } => ErrorSeverity::Medium,
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { message } => {
                message.contains("Interrupted")
                    || message.contains("WouldBlock")
                    || message.contains("timed out")
                    || message.contains("reset")
            }
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::Cancelled => false,
            Self::FileNotFound { .. }
            | Self::PermissionDenied { .. }
            | Self::Config { .. }
            | Self::RemoteRejected { .. }
            | Self::ChecksumFailed { .. }
            | Self::Manifest { .. }
            | Self::Unsupported { .. }
            | Self::Elevation { .. }
            | Self::InvalidState { .. }
            | Self::Other { .. } => false,
        }
    }

    /// Check if this error should trigger a retry
    pub fn should_retry(&self) -> bool {
        self.is_recoverable() && self.severity() <= ErrorSeverity::Medium
    }

    /// Whether this error represents user-initiated cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Map an I/O failure on a known path, keeping not-found and
    /// permission failures as their own variants
    pub fn io_at(path: &Path, action: &str, error: &std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound {
                path: path.to_path_buf(),
            },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => Self::Io {
                message: format!("Failed to {} '{}': {}", action, path.display(), error),
            },
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a new manifest error
    pub fn manifest<S: Into<String>>(message: S) -> Self {
        Self::Manifest {
            message: message.into(),
        }
    }

    /// Create a new unsupported error
    pub fn unsupported<S: Into<String>>(message: S) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create a new elevation error
    pub fn elevation<S: Into<String>>(exit_code: Option<i32>, message: S) -> Self {
        Self::Elevation {
            exit_code,
            message: message.into(),
        }
    }

    /// Create a new invalid state error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn hash(byte: u8) -> ContentHash {
        ContentHash::from_bytes([byte; 32])
    }

    proptest! {
        #[test]
        fn test_error_recoverability_logic(message in ".*") {
            let errors = vec![
                Error::Io { message: message.clone() },
                Error::Network { message: message.clone() },
                Error::Manifest { message: message.clone() },
                Error::Unsupported { message: message.clone() },
                Error::Other { message },
            ];

            for error in errors {
                // Anything we retry must be recoverable and at most Medium
                if error.should_retry() {
                    prop_assert!(error.is_recoverable());
                    prop_assert!(error.severity() <= ErrorSeverity::Medium);
                }
            }
        }

        #[test]
        fn test_timeout_error_properties(seconds in 1u64..3600u64) {
            let error = Error::Timeout { seconds };

            prop_assert_eq!(error.kind(), ErrorKind::Timeout);
            prop_assert_eq!(error.severity(), ErrorSeverity::Medium);
            prop_assert!(error.should_retry());
        }
    }

    #[test]
    fn test_error_severity_ordering() {
        assert!(ErrorSeverity::Low < ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium < ErrorSeverity::High);
        assert!(ErrorSeverity::High < ErrorSeverity::Critical);
    }

    #[rstest]
    #[case(Error::network("connection reset"), true)]
    #[case(Error::Timeout { seconds: 30 }, true)]
    #[case(Error::RemoteRejected { url: "http://x/a".into(), status: 404 }, false)]
    #[case(Error::ChecksumFailed { files: vec![] }, false)]
    #[case(Error::unsupported("no executable path"), false)]
    #[case(Error::elevation(Some(1223), "declined"), false)]
    #[case(Error::Cancelled, false)]
    fn test_retry_policy(#[case] error: Error, #[case] retry: bool) {
        assert_eq!(error.should_retry(), retry);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "test file");
        let error = Error::from(io_error);

        assert_eq!(error.kind(), ErrorKind::Io);
        assert!(error.to_string().contains("test file"));
    }

    #[test]
    fn test_io_at_keeps_path() {
        let path = Path::new("/install/data/a.pak");
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            Error::io_at(path, "open", &missing),
            Error::FileNotFound { path: p } if p == path
        ));

        let other = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let text = Error::io_at(path, "read", &other).to_string();
        assert!(text.contains("Failed to read '/install/data/a.pak'"));
    }

    #[test]
    fn test_checksum_failed_lists_offenders() {
        let error = Error::ChecksumFailed {
            files: vec![
                ChecksumMismatch {
                    name: "a.bin".to_string(),
                    expected: hash(1),
                    actual: Some(hash(2)),
                },
                ChecksumMismatch {
                    name: "b.bin".to_string(),
                    expected: hash(3),
                    actual: None,
                },
            ],
        };

        let text = error.to_string();
        assert!(text.contains("2 file(s)"));
        assert!(text.contains("a.bin"));
        assert!(text.contains("b.bin"));
        assert_eq!(error.kind(), ErrorKind::Checksum);
    }

    #[test]
    fn test_checksum_failed_truncates_long_lists() {
        let files = (0..8)
            .map(|i| ChecksumMismatch {
                name: format!("f{i}"),
                expected: hash(i),
                actual: None,
            })
            .collect();
        let text = Error::ChecksumFailed { files }.to_string();
        assert!(text.contains("and 3 more"));
        assert!(!text.contains("f7"));
    }

    #[test]
    fn test_elevation_error_reports_exit_code() {
        let error = Error::elevation(Some(5), "access denied");
        assert!(error.to_string().contains("exit code 5"));
        assert_eq!(error.severity(), ErrorSeverity::High);

        let killed = Error::elevation(None, "terminated by signal");
        assert!(killed.to_string().contains("exit code none"));
    }

    #[test]
    fn test_unsupported_is_critical() {
        let error = Error::unsupported("cannot locate executable");
        assert_eq!(error.severity(), ErrorSeverity::Critical);
        assert!(!error.is_recoverable());
    }

    #[test]
    fn test_cancelled_error() {
        let error = Error::Cancelled;

        assert!(error.is_cancelled());
        assert_eq!(error.kind(), ErrorKind::Cancelled);
        assert!(!error.should_retry());
    }
}
