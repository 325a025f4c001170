use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories surfaced at the RPC boundary.
///
/// Every kind maps onto exactly one transport status; the server crate owns
/// that mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Cancelled,
    DeadlineExceeded,
    InvalidAddress,
    InvalidArgument,
    DecodeError,
    NotFound,
    AlreadyExists,
    PermissionError,
    NetworkError,
    InsufficientBalance,
    InternalError,
    UnknownError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::InvalidAddress => "invalid_address",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::DecodeError => "decode_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::PermissionError => "permission_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::InsufficientBalance => "insufficient_balance",
            ErrorKind::InternalError => "internal_error",
            ErrorKind::UnknownError => "unknown_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The service-wide error: a kind tag, a human description, an optional
/// wrapped cause and the backtrace captured when it was built.
pub struct ChatError {
    kind: ErrorKind,
    description: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    backtrace: Arc<Backtrace>,
}

impl ChatError {
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            source: None,
            backtrace: Arc::new(Backtrace::capture()),
        }
    }

    /// Attach the underlying cause.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    // -- Constructors for the named errors of the taxonomy --

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn deadline_exceeded(what: impl fmt::Display) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, format!("deadline exceeded: {what}"))
    }

    pub fn invalid_address(address: impl fmt::Display) -> Self {
        Self::new(ErrorKind::InvalidAddress, format!("invalid address {address}"))
    }

    pub fn invalid_argument(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, description)
    }

    pub fn decode(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::DecodeError, description)
    }

    pub fn not_found(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, description)
    }

    pub fn contact_not_found(key: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("contact {key} not found"))
    }

    pub fn discussion_not_found(id: u64) -> Self {
        Self::new(ErrorKind::NotFound, format!("discussion {id} not found"))
    }

    pub fn no_route_found(destination: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("no route found to {destination}"))
    }

    pub fn already_exists(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, description)
    }

    pub fn contact_already_exists(address: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::AlreadyExists,
            format!("contact with address {address} already exists"),
        )
    }

    pub fn discussion_already_exists(key: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::AlreadyExists,
            format!("discussion with participants [{key}] already exists"),
        )
    }

    pub fn permission(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionError, description)
    }

    pub fn network(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkError, description)
    }

    pub fn insufficient_balance(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::InsufficientBalance, description)
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, description)
    }

    pub fn unknown(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownError, description)
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.description)?;
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatError")
            .field("kind", &self.kind)
            .field("description", &self.description)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl std::error::Error for ChatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("Signature must be {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("Invalid recovery header byte {0}")]
    InvalidHeader(u8),

    #[error("Invalid secret key")]
    InvalidSecretKey,

    #[error("secp256k1 error: {0}")]
    Secp(#[from] secp256k1::Error),
}

impl From<PayloadError> for ChatError {
    fn from(err: PayloadError) -> Self {
        ChatError::decode("cannot decode payload").with_source(err)
    }
}

impl From<SignatureError> for ChatError {
    fn from(err: SignatureError) -> Self {
        ChatError::invalid_argument("bad signature").with_source(err)
    }
}
