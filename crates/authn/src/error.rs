//! Gate error types.
//!
//! Every store and engine operation returns [`Result<T>`](Result). Only the
//! pipeline's outer guard turns a [`GateError`] into a transport response,
//! using [`GateError::status`] and [`GateError::public_message`].

use signgate_storage::StorageError;
use thiserror::Error;

/// Result alias for gate operations.
pub type Result<T> = std::result::Result<T, GateError>;

/// Errors produced by the access-control gate.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GateError {
    /// Malformed address or CIDR text.
    ///
    /// `line` carries the 1-based position of the entry when it came from a
    /// batch.
    #[error("{}", invalid_format_message(.input, .line))]
    InvalidFormat {
        /// The rejected text.
        input: String,
        /// 1-based position within the submitted batch, if any.
        line: Option<usize>,
    },

    /// A required field is missing or blank.
    #[error("{0}")]
    Validation(String),

    /// The referenced token or range does not exist or is not in a usable
    /// state.
    #[error("{0}")]
    NotFound(String),

    /// Missing, invalid, or revoked credentials.
    #[error("Unauthorized")]
    Unauthorized,

    /// The caller's address is not on the allow-list.
    #[error("Request from remote address {address} is forbidden")]
    Forbidden {
        /// The rejected caller address.
        address: String,
    },

    /// A uniqueness constraint rejected the write.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Settings are contradictory; the service must not start.
    #[error("{0}")]
    InvalidConfiguration(String),

    /// The randomness source failed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// The caller-supplied deadline elapsed.
    #[error("Operation timed out")]
    Timeout,

    /// Persistence or cache failure.
    ///
    /// Wraps the original [`StorageError`] to preserve the source chain.
    #[error("Storage error: {0}")]
    Storage(#[source] StorageError),
}

fn invalid_format_message(input: &str, line: &Option<usize>) -> String {
    match line {
        Some(line) => format!("Invalid IP [{input}] on line [{line}]"),
        None => format!("Invalid IP [{input}]"),
    }
}

impl GateError {
    /// Creates an `InvalidFormat` error for a standalone input.
    #[must_use]
    pub fn invalid_format(input: impl Into<String>) -> Self {
        Self::InvalidFormat { input: input.into(), line: None }
    }

    /// Creates an `InvalidFormat` error for the entry at 1-based `line`.
    #[must_use]
    pub fn invalid_format_at(input: impl Into<String>, line: usize) -> Self {
        Self::InvalidFormat { input: input.into(), line: Some(line) }
    }

    /// Creates a `Validation` error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a `NotFound` error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Creates a `Forbidden` error for `address`.
    #[must_use]
    pub fn forbidden(address: impl Into<String>) -> Self {
        Self::Forbidden { address: address.into() }
    }

    /// Creates an `InvalidConfiguration` error.
    #[must_use]
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    /// Creates a `Crypto` error.
    #[must_use]
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto(message.into())
    }

    /// Transport status code for this error.
    ///
    /// Whitelist rejections share 401 with authentication failures so the
    /// response does not reveal which gate refused the request.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidFormat { .. } | Self::Validation(_) => 400,
            Self::Unauthorized | Self::Forbidden { .. } => 401,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Timeout => 504,
            Self::InvalidConfiguration(_) | Self::Crypto(_) | Self::Storage(_) => 500,
        }
    }

    /// Message safe to show to the caller, if any.
    ///
    /// Internal failures return `None`; their detail stays in logs.
    #[must_use]
    pub fn public_message(&self) -> Option<String> {
        match self {
            Self::Unauthorized | Self::Forbidden { .. } => Some("Unauthorized".to_owned()),
            Self::InvalidFormat { .. }
            | Self::Validation(_)
            | Self::NotFound(_)
            | Self::InvalidConfiguration(_) => Some(self.to_string()),
            Self::Conflict(_) | Self::Crypto(_) | Self::Timeout | Self::Storage(_) => None,
        }
    }
}

impl From<StorageError> for GateError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict { key } => Self::Conflict(key),
            StorageError::Timeout => Self::Timeout,
            other => Self::Storage(other),
        }
    }
}
