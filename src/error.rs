use std::fmt;
use std::io;
use std::path::PathBuf;

/// Custom error type for sockd library operations
#[derive(Debug)]
pub enum SockdError {
    /// IO errors (file read/write, socket operations)
    Io { context: String, source: io::Error },

    /// Configuration errors (invalid builder input, validation failures)
    Config { message: String },

    /// Starting lock is held by a fresh peer
    LockContended { lock_path: PathBuf, age_ms: u64 },

    /// Lock verification found another process's PID after acquisition
    LockLost {
        lock_path: PathBuf,
        expected: String,
        found: String,
    },

    /// Fatal endpoint bind failure (anything other than address-in-use)
    Bind {
        socket_path: PathBuf,
        source: io::Error,
    },

    /// A pending request was cancelled before a response arrived
    Cancelled { reason: String },

    /// JSON serialization/deserialization errors
    Json {
        context: String,
        source: serde_json::Error,
    },

    /// Generic error with context (for migration from anyhow)
    Other { message: String },
}

impl fmt::Display for SockdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { context, source } => {
                write!(f, "{context}: {source}")
            }
            Self::Config { message } => {
                write!(f, "Configuration error: {message}")
            }
            Self::LockContended { lock_path, age_ms } => {
                write!(
                    f,
                    "Starting lock {} is held by another process ({age_ms}ms old)",
                    lock_path.display()
                )
            }
            Self::LockLost {
                lock_path,
                expected,
                found,
            } => {
                write!(
                    f,
                    "Lost the starting lock at {}: wrote {expected:?}, found {found:?}",
                    lock_path.display()
                )
            }
            Self::Bind {
                socket_path,
                source,
            } => {
                write!(
                    f,
                    "Failed to bind endpoint {}: {source}",
                    socket_path.display()
                )
            }
            Self::Cancelled { reason } => {
                write!(f, "Request cancelled: {reason}")
            }
            Self::Json { context, source } => {
                write!(f, "JSON error in {context}: {source}")
            }
            Self::Other { message } => {
                write!(f, "{message}")
            }
        }
    }
}

impl std::error::Error for SockdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } | Self::Bind { source, .. } => Some(source),
            Self::Json { source, .. } => Some(source),
            _ => None,
        }
    }
}

// Conversions from standard error types
impl From<io::Error> for SockdError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            context: "IO operation failed".to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for SockdError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            context: "JSON operation failed".to_string(),
            source: err,
        }
    }
}

impl From<anyhow::Error> for SockdError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            message: err.to_string(),
        }
    }
}

// Helper methods for creating errors with context
impl SockdError {
    pub fn io_error(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn lock_contended(lock_path: PathBuf, age_ms: u64) -> Self {
        Self::LockContended { lock_path, age_ms }
    }

    pub fn lock_lost(
        lock_path: PathBuf,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::LockLost {
            lock_path,
            expected: expected.into(),
            found: found.into(),
        }
    }

    #[must_use]
    pub const fn bind_error(socket_path: PathBuf, source: io::Error) -> Self {
        Self::Bind {
            socket_path,
            source,
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn json_error(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Whether this error is a cancellation (vs a transport/lifecycle failure)
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Result type alias for sockd operations
pub type Result<T> = std::result::Result<T, SockdError>;
