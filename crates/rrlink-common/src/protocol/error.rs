use std::time::Duration;

use thiserror::Error;

/// Provider error codes carried in the `code` field of cloud REST responses.
///
/// The code is kept next to the provider's message so callers can switch on
/// the category ([`RrError::kind`]) while still reporting the original text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// 2003: the account email is malformed
    InvalidEmail,
    /// 1001: required request parameters are missing
    MissingParameters,
    /// 9002: too many requests (or too many verification codes) in a short period
    TooManyRequests,
    /// 2008: no account exists for the email
    AccountDoesNotExist,
    /// 2018: the email verification code is wrong
    InvalidCode,
    /// 3009: the user agreement has never been accepted
    NoUserAgreement,
    /// 3006: the user agreement must be accepted again
    InvalidUserAgreement,
    /// 2010: the account token or credentials were rejected
    InvalidCredentials,
}

impl ApiErrorKind {
    /// Maps a provider response code to a known error kind.
    ///
    /// Returns `None` for codes with no dedicated meaning; those surface as
    /// [`RrError::RequestFailed`].
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            2003 => Some(Self::InvalidEmail),
            1001 => Some(Self::MissingParameters),
            9002 => Some(Self::TooManyRequests),
            2008 => Some(Self::AccountDoesNotExist),
            2018 => Some(Self::InvalidCode),
            3009 => Some(Self::NoUserAgreement),
            3006 => Some(Self::InvalidUserAgreement),
            2010 => Some(Self::InvalidCredentials),
            _ => None,
        }
    }
}

/// Coarse error categories used to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    FrameCorrupt,
    Timeout,
    TransportFailure,
    RateLimitExceeded,
    AuthRejected,
    CredentialsInvalid,
    QuotaOrAgreementRequired,
    RequestFailed,
    Device,
    Internal,
}

#[derive(Error, Debug)]
pub enum RrError {
    #[error("Corrupt frame: {0}")]
    FrameCorrupt(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Rate limit exceeded for '{category}', retry after {retry_after:?}")]
    RateLimitExceeded {
        category: String,
        retry_after: Duration,
    },

    #[error("API error {code} ({kind:?}): {msg}")]
    Api {
        kind: ApiErrorKind,
        code: i64,
        msg: String,
    },

    #[error("Request failed with code {code}: {msg}")]
    RequestFailed { code: i64, msg: String },

    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RrError {
    /// Builds the error for a non-success provider response.
    ///
    /// Known codes become [`RrError::Api`]; anything else becomes
    /// [`RrError::RequestFailed`] carrying the raw code and message.
    pub fn from_api_code(code: i64, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match ApiErrorKind::from_code(code) {
            Some(kind) => RrError::Api { kind, code, msg },
            None => RrError::RequestFailed { code, msg },
        }
    }

    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RrError::FrameCorrupt(_) => ErrorKind::FrameCorrupt,
            RrError::Timeout(_) => ErrorKind::Timeout,
            RrError::TransportFailure(_) | RrError::Connection(_) | RrError::Io(_) => {
                ErrorKind::TransportFailure
            }
            RrError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            RrError::Api { kind, .. } => match kind {
                ApiErrorKind::InvalidCredentials => ErrorKind::CredentialsInvalid,
                ApiErrorKind::TooManyRequests
                | ApiErrorKind::NoUserAgreement
                | ApiErrorKind::InvalidUserAgreement => ErrorKind::QuotaOrAgreementRequired,
                ApiErrorKind::InvalidEmail
                | ApiErrorKind::MissingParameters
                | ApiErrorKind::AccountDoesNotExist
                | ApiErrorKind::InvalidCode => ErrorKind::AuthRejected,
            },
            RrError::RequestFailed { .. } | RrError::Http(_) | RrError::InvalidResponse(_) => {
                ErrorKind::RequestFailed
            }
            RrError::DeviceError(_) => ErrorKind::Device,
            RrError::InvalidRequest(_) | RrError::JsonSerialization(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, RrError>;
