use thiserror::Error;

/// Typed category for a failed iptables invocation.
///
/// Derived from the tool's stderr; the distinction matters because some
/// categories are caller mistakes (surfaced as client errors by the API)
/// and some are environment problems (surfaced as server errors).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IptablesErrorKind {
    /// Rule parameters are invalid for the target chain/table
    /// (e.g. DNAT outside nat/OUTPUT).
    InvalidArgument,
    /// Chain, target, or match module does not exist.
    UnknownChainOrTarget,
    /// No rule matched the given specification.
    RuleNotFound,
    /// Operation requires root privileges.
    PermissionDenied,
    /// The xtables lock is held by another process.
    ResourceLocked,
    /// The iptables binary is not installed or not in PATH.
    ToolMissing,
    /// Anything the classifier could not place.
    Other,
}

impl IptablesErrorKind {
    /// Whether this failure is caused by the caller's input rather than
    /// the environment. Client errors map to 4xx on the HTTP surface.
    pub const fn is_client_error(self) -> bool {
        matches!(
            self,
            IptablesErrorKind::InvalidArgument
                | IptablesErrorKind::UnknownChainOrTarget
                | IptablesErrorKind::RuleNotFound
        )
    }
}

/// Core error types for rewall
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite storage operation failed
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// iptables command execution failed
    #[error("iptables error: {message}")]
    Iptables {
        kind: IptablesErrorKind,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Input validation failed before any external call
    #[error("validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Referenced entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal logic error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a validation error on a named field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Classifies raw iptables/iptables-nft stderr into a typed category with
/// a user-facing message.
///
/// The match strings cover both the legacy and nft-backed frontends; the
/// fallback keeps the trimmed raw text so nothing is lost.
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    pub fn classify(stderr: &str) -> (IptablesErrorKind, String) {
        let lower = stderr.to_lowercase();

        // nft backend reports bad target/chain combinations this way
        if lower.contains("rule_append failed (invalid argument)")
            || lower.contains("invalid argument")
        {
            if lower.contains("dnat") && lower.contains("output") {
                return (
                    IptablesErrorKind::InvalidArgument,
                    "DNAT is not allowed here (only nat PREROUTING/OUTPUT)".to_string(),
                );
            }
            return (
                IptablesErrorKind::InvalidArgument,
                "invalid parameters for this chain/table (check target compatibility, e.g. DNAT only in nat)".to_string(),
            );
        }

        if lower.contains("no chain/target/match by that name") {
            return (
                IptablesErrorKind::UnknownChainOrTarget,
                "chain, target or match module not found".to_string(),
            );
        }

        if lower.contains("bad rule") || lower.contains("does a matching rule exist") {
            return (
                IptablesErrorKind::RuleNotFound,
                "no rule matches that specification".to_string(),
            );
        }

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return (
                IptablesErrorKind::PermissionDenied,
                "permission denied (root privileges required)".to_string(),
            );
        }

        if lower.contains("resource temporarily unavailable")
            || lower.contains("xtables lock")
            || lower.contains("resource busy")
        {
            return (
                IptablesErrorKind::ResourceLocked,
                "iptables lock is held by another process, retry shortly".to_string(),
            );
        }

        if lower.contains("command not found") || lower.contains("no such file") {
            return (
                IptablesErrorKind::ToolMissing,
                "iptables binary not found on this system".to_string(),
            );
        }

        (
            IptablesErrorKind::Other,
            format!("iptables error: {}", stderr.trim()),
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
