use std::fmt;

use reqwest::StatusCode;

/// A response the portal answered with, but not the way we needed: either a
/// non-success status or a body that was not JSON when JSON was required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    pub status: u16,
    pub status_text: String,
}

impl FetchError {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
        }
    }

    /// The portal itself is down.
    pub fn is_server_down(&self) -> bool {
        self.status >= 500
    }

    /// The session token or cookies were rejected.
    pub fn is_auth_problem(&self) -> bool {
        matches!(self.status, 401 | 403 | 409)
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code: {}\ntext: {}", self.status, self.status_text)
    }
}

/// Caller input rejected before anything goes over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidSubject(String),
    InvalidPeriod,
}

impl ValidationError {
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidSubject(_) => 10,
            Self::InvalidPeriod => 11,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSubject(id) => write!(f, "Invalid id: {id}"),
            Self::InvalidPeriod => write!(f, "Invalid period"),
        }
    }
}

/// How a report job ended when it did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolFailure {
    Initialization,
    Channel(String),
    Task(String),
    Aborted,
    Unknown(String),
}

impl ProtocolFailure {
    /// Maps a side-channel close code onto a failure. `None` for 4000, which
    /// is a clean close.
    pub fn from_close_code(code: Option<u16>, reason: &str) -> Option<Self> {
        match code {
            Some(4000) => None,
            Some(4001) => Some(Self::Initialization),
            Some(4002) => Some(Self::Channel(reason.to_string())),
            Some(4003) => Some(Self::Task(reason.to_string())),
            Some(4009) => Some(Self::Aborted),
            _ => Some(Self::Unknown(reason.to_string())),
        }
    }

    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::Initialization => Some(4001),
            Self::Channel(_) => Some(4002),
            Self::Task(_) => Some(4003),
            Self::Aborted => Some(4009),
            Self::Unknown(_) => None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Initialization => 12,
            Self::Channel(_) => 13,
            Self::Task(_) => 14,
            Self::Aborted => 4009,
            Self::Unknown(_) => -10,
        }
    }
}

impl fmt::Display for ProtocolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialization => write!(f, "Error during initialization."),
            Self::Channel(message) => write!(f, "Error in socket.\nError: {message}"),
            Self::Task(message) => write!(f, "Error in task.\nError: {message}"),
            Self::Aborted => write!(f, "Report job was aborted."),
            Self::Unknown(message) => write!(f, "Unknown error.\nError: {message}"),
        }
    }
}

#[derive(Debug)]
pub enum PortalError {
    Fetch(FetchError),
    Request(reqwest::Error),
    Validation(ValidationError),
    Protocol(ProtocolFailure),
    Extraction(String),
    UnsupportedHost(String),
    NotLoggedIn,
    InvalidHeader(String),
    Json(serde_json::Error),
}

impl PortalError {
    pub(crate) fn extraction(message: impl Into<String>) -> Self {
        Self::Extraction(message.into())
    }

    /// Numeric code for callers that report errors as envelopes.
    pub fn code(&self) -> i32 {
        match self {
            Self::Fetch(error) => i32::from(error.status),
            Self::Validation(error) => error.code(),
            Self::Protocol(failure) => failure.code(),
            _ => 0,
        }
    }
}

impl fmt::Display for PortalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch(error) => write!(f, "{error}"),
            Self::Request(error) => write!(f, "request error: {error}"),
            Self::Validation(error) => write!(f, "{error}"),
            Self::Protocol(failure) => write!(f, "{failure}"),
            Self::Extraction(message) => write!(f, "could not extract data: {message}"),
            Self::UnsupportedHost(host) => write!(f, "this server ({host}) is not supported"),
            Self::NotLoggedIn => write!(f, "session has no auth token, log in first"),
            Self::InvalidHeader(value) => write!(f, "value can't be sent as a header: {value:?}"),
            Self::Json(error) => write!(f, "serialization error: {error}"),
        }
    }
}

impl std::error::Error for PortalError {}

impl From<reqwest::Error> for PortalError {
    fn from(error: reqwest::Error) -> Self {
        Self::Request(error)
    }
}

impl From<serde_json::Error> for PortalError {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(error)
    }
}

impl From<FetchError> for PortalError {
    fn from(error: FetchError) -> Self {
        Self::Fetch(error)
    }
}

impl From<ValidationError> for PortalError {
    fn from(error: ValidationError) -> Self {
        Self::Validation(error)
    }
}

impl From<ProtocolFailure> for PortalError {
    fn from(failure: ProtocolFailure) -> Self {
        Self::Protocol(failure)
    }
}
