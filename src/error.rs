//! Error types for the swarm trainer
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Retry / fatality classification for the training loop
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for trainer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    ConnectionRefused = 302,

    // Protocol errors (4xx)
    ProtocolVersion = 400,
    ProtocolMalformed = 401,
    ProtocolUnexpected = 402,

    // Directory errors (5xx)
    DirectoryUnavailable = 500,

    // Round errors (6xx)
    NoGroupFormed = 600,
    PeerDroppedMidRound = 601,
    RoundAborted = 602,

    // Local compute errors (7xx)
    LocalComputeFailure = 700,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Connection errors
            400..=499 => 40, // Protocol errors
            500..=599 => 50, // Directory errors
            600..=699 => 60, // Round errors
            700..=799 => 70, // Local compute errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the trainer
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Connection failed
    #[error("Failed to reach peer at {addr}: {message}")]
    ConnectionFailed { addr: String, message: String },

    /// Connection or exchange timed out
    #[error("Request to {addr} timed out after {timeout_ms}ms")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersion { expected: String, actual: String },

    /// Malformed message
    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    /// Peer answered with a message we did not ask for
    #[error("Unexpected reply: expected {expected}, got {actual}")]
    ProtocolUnexpected { expected: String, actual: String },

    // ─────────────────────────────────────────────────────────────
    // Directory Errors
    // ─────────────────────────────────────────────────────────────

    /// No directory replica accepted a write
    #[error("Directory unavailable for key '{key}': {message}")]
    DirectoryUnavailable { key: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Round Errors
    // ─────────────────────────────────────────────────────────────

    /// Matchmaking ended without a usable group
    #[error("No averaging group formed for epoch {epoch}: {reason}")]
    NoGroupFormed { epoch: u64, reason: String },

    /// A group member stopped responding during the exchange
    #[error("Peer {peer_id} dropped out of group {group_id}")]
    PeerDroppedMidRound { peer_id: String, group_id: String },

    /// The round could not complete and was rolled back
    #[error("Averaging round {group_id} aborted: {reason}")]
    RoundAborted { group_id: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Local Compute Errors
    // ─────────────────────────────────────────────────────────────

    /// The local training collaborator failed
    #[error("Local {stage} failed: {message}")]
    LocalComputeFailure { stage: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                std::io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::ProtocolMalformed,

            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,

            Error::ProtocolVersion { .. } => ErrorCode::ProtocolVersion,
            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::ProtocolUnexpected { .. } => ErrorCode::ProtocolUnexpected,

            Error::DirectoryUnavailable { .. } => ErrorCode::DirectoryUnavailable,

            Error::NoGroupFormed { .. } => ErrorCode::NoGroupFormed,
            Error::PeerDroppedMidRound { .. } => ErrorCode::PeerDroppedMidRound,
            Error::RoundAborted { .. } => ErrorCode::RoundAborted,

            Error::LocalComputeFailure { .. } => ErrorCode::LocalComputeFailure,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout { .. }
                | Error::DirectoryUnavailable { .. }
                | Error::NoGroupFormed { .. }
                | Error::PeerDroppedMidRound { .. }
                | Error::RoundAborted { .. }
                | Error::Io(_)
        )
    }

    /// Check if the error is fatal (process should exit)
    ///
    /// Peer churn and network failures are never fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Config(_)
                | Error::LocalComputeFailure { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'swarm-trainer config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'swarm-trainer config validate' to see details."
            ),
            Error::ConfigValidation { .. } | Error::Config(_) => Some(
                "Review the configuration file and fix the invalid values."
            ),

            Error::ConnectionFailed { .. } => Some(
                "Check that the peer address is reachable and that 'announce_addr' is set when behind NAT."
            ),
            Error::ConnectionTimeout { .. } => Some(
                "The peer may be overloaded or gone. It will be dropped for this round and retried later."
            ),

            Error::ProtocolVersion { .. } => Some(
                "All peers of a run must use compatible releases. Run 'swarm-trainer version' on each peer."
            ),

            Error::DirectoryUnavailable { .. } => Some(
                "No directory replica is reachable. Verify 'initial_peers' points at live peers."
            ),
            Error::NoGroupFormed { .. } => Some(
                "Not enough peers were looking for a group. The round is retried on the next cycle."
            ),
            Error::RoundAborted { .. } => Some(
                "Local state was rolled back. Consider raising 'allreduce_timeout_ms' on slow links."
            ),

            Error::LocalComputeFailure { .. } => Some(
                "The local training step is broken. Fix the trainer before rejoining the collaboration."
            ),

            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        let code = self.code();
        format!("[{}] {}", code.as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors (for ergonomic error creation)
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(addr: impl fmt::Display, message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            addr: addr.to_string(),
            message: message.into(),
        }
    }

    /// Create a connection timeout error
    pub fn connection_timeout(addr: impl fmt::Display, timeout_ms: u64) -> Self {
        Error::ConnectionTimeout {
            addr: addr.to_string(),
            timeout_ms,
        }
    }

    /// Create an unexpected reply error
    pub fn unexpected_reply(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Error::ProtocolUnexpected {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a directory unavailable error
    pub fn directory_unavailable(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::DirectoryUnavailable {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a no-group error
    pub fn no_group(epoch: u64, reason: impl Into<String>) -> Self {
        Error::NoGroupFormed {
            epoch,
            reason: reason.into(),
        }
    }

    /// Create a round aborted error
    pub fn round_aborted(group_id: impl fmt::Display, reason: impl Into<String>) -> Self {
        Error::RoundAborted {
            group_id: group_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a local compute failure
    pub fn local_compute(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Error::LocalComputeFailure {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.as_str(), "E100");
        assert_eq!(ErrorCode::DirectoryUnavailable.as_str(), "E500");
        assert_eq!(ErrorCode::RoundAborted.as_str(), "E602");
        assert_eq!(ErrorCode::InternalError.as_str(), "E900");
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(ErrorCode::ConfigNotFound.exit_code(), 10);
        assert_eq!(ErrorCode::IoRead.exit_code(), 20);
        assert_eq!(ErrorCode::ConnectionFailed.exit_code(), 30);
        assert_eq!(ErrorCode::NoGroupFormed.exit_code(), 60);
        assert_eq!(ErrorCode::LocalComputeFailure.exit_code(), 70);
        assert_eq!(ErrorCode::InternalError.exit_code(), 90);
    }

    #[test]
    fn test_error_display() {
        let err = Error::config_not_found("/path/to/config.toml");
        assert!(err.to_string().contains("/path/to/config.toml"));

        let err = Error::local_compute("gradient", "NaN loss");
        assert_eq!(err.to_string(), "Local gradient failed: NaN loss");
    }

    #[test]
    fn test_round_errors_are_recoverable() {
        let errors = [
            Error::directory_unavailable("run_progress", "no replica"),
            Error::no_group(3, "alone"),
            Error::PeerDroppedMidRound {
                peer_id: "ab12".into(),
                group_id: "g".into(),
            },
            Error::round_aborted("g", "timeout"),
        ];

        for err in &errors {
            assert!(err.is_retryable(), "{} should be retryable", err);
            assert!(!err.is_fatal(), "{} should not be fatal", err);
        }
    }

    #[test]
    fn test_network_errors_not_fatal() {
        assert!(!Error::connection_failed("127.0.0.1:1", "refused").is_fatal());
        assert!(!Error::connection_timeout("127.0.0.1:1", 500).is_fatal());
        assert!(!Error::unexpected_reply("PONG", "ACK").is_fatal());
    }

    #[test]
    fn test_local_compute_is_fatal() {
        let err = Error::local_compute("apply", "optimizer diverged");
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert_ne!(err.exit_code(), 0);
    }

    #[test]
    fn test_error_suggestions() {
        let err = Error::config_not_found("/test");
        assert!(err.suggestion().unwrap().contains("config init"));

        let err = Error::directory_unavailable("k", "down");
        assert!(err.suggestion().unwrap().contains("initial_peers"));
    }

    #[test]
    fn test_format_for_terminal() {
        let err = Error::config_not_found("/test/config.toml");
        let formatted = err.format_for_terminal();

        assert!(formatted.contains("E100"));
        assert!(formatted.contains("\x1b[31m"));
        assert!(formatted.contains("Hint"));
    }

    #[test]
    fn test_format_for_log() {
        let err = Error::round_aborted("grp", "owner lost");
        let formatted = err.format_for_log();

        assert!(formatted.contains("[E602]"));
        assert!(!formatted.contains("\x1b["));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert_eq!(err.code(), ErrorCode::IoNotFound);

        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: Error = io_err.into();
        assert_eq!(err.code(), ErrorCode::ConnectionRefused);
    }
}
