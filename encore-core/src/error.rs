//! Error types for ENCORE gateway operations
//!
//! Every error is `Clone` so that a single in-flight operation (a token
//! refresh, a deduplicated fetch) can hand the same failure to all of its
//! waiters.

use thiserror::Error;

/// Coarse classification handed to the route layer.
///
/// The route layer owns the final HTTP mapping; `status_hint` is only the
/// conventional default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    NotFound,
    BadRequest,
    /// The gateway's own backend credentials or session were refused.
    Auth,
    ServiceUnavailable,
    /// The caller went away; not a failure of the gateway.
    Cancelled,
    Internal,
}

impl ErrorClass {
    /// Classify a backend message code.
    ///
    /// `401` ("no records match") never reaches here; find and get turn it
    /// into an empty result first.
    pub fn from_backend_code(code: &str) -> Self {
        match code.trim().parse::<u32>() {
            Ok(101) => ErrorClass::NotFound,
            Ok(102 | 105 | 106 | 500..=511 | 1708 | 1710) => ErrorClass::BadRequest,
            Ok(212 | 952) => ErrorClass::Auth,
            Ok(10 | 802 | 958) => ErrorClass::ServiceUnavailable,
            _ => ErrorClass::Internal,
        }
    }

    /// Conventional HTTP status for this class.
    pub fn status_hint(&self) -> u16 {
        match self {
            ErrorClass::NotFound => 404,
            ErrorClass::BadRequest => 400,
            ErrorClass::Auth => 403,
            ErrorClass::ServiceUnavailable => 503,
            ErrorClass::Cancelled => 499,
            ErrorClass::Internal => 500,
        }
    }
}

/// Outbound transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timed out after {attempts} attempt(s)")]
    TimedOut { attempts: u32 },

    #[error("Network failure after {attempts} attempt(s): {reason}")]
    Network { attempts: u32, reason: String },

    #[error("Request failed and is not retryable: {reason}")]
    Fatal { reason: String },

    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("Gateway is shutting down")]
    Closed,
}

/// Errors reported by the backend itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend rejected the session token")]
    Unauthorized,

    #[error("Backend refused authorization after token refresh")]
    AuthorizationFailed,

    #[error("Backend error {code}: {message}")]
    Rejected { code: String, message: String },

    #[error("Unexpected HTTP status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Malformed backend response: {reason}")]
    Malformed { reason: String },
}

/// Errors decoding inbound payloads at the gateway boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Required field missing: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Malformed payload: {reason}")]
    Malformed { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Master error type for all gateway errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl GatewayError {
    /// Coarse class for the route layer.
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::Transport(TransportError::Cancelled) => ErrorClass::Cancelled,
            GatewayError::Transport(TransportError::Fatal { .. }) => ErrorClass::Internal,
            GatewayError::Transport(_) => ErrorClass::ServiceUnavailable,
            GatewayError::Backend(BackendError::Unauthorized)
            | GatewayError::Backend(BackendError::AuthorizationFailed) => ErrorClass::Auth,
            GatewayError::Backend(BackendError::Rejected { code, .. }) => {
                ErrorClass::from_backend_code(code)
            }
            GatewayError::Backend(BackendError::Http { status, .. }) => match status {
                404 => ErrorClass::NotFound,
                400 | 422 => ErrorClass::BadRequest,
                401 | 403 => ErrorClass::Auth,
                502..=504 => ErrorClass::ServiceUnavailable,
                _ => ErrorClass::Internal,
            },
            GatewayError::Backend(BackendError::Malformed { .. }) => ErrorClass::Internal,
            GatewayError::Decode(_) => ErrorClass::BadRequest,
            GatewayError::Config(_) => ErrorClass::Internal,
        }
    }

    /// True when the caller cancelled the operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GatewayError::Transport(TransportError::Cancelled))
    }

    /// True for the first-time 401 that warrants a token refresh.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, GatewayError::Backend(BackendError::Unauthorized))
    }

    /// Backend message code, when the backend supplied one.
    pub fn backend_code(&self) -> Option<&str> {
        match self {
            GatewayError::Backend(BackendError::Rejected { code, .. }) => Some(code.as_str()),
            _ => None,
        }
    }
}

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

// =============================================================================
// TESTS
// =============================================================================
