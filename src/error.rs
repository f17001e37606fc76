use http::Method;
use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

const CAPACITY_EXCEEDED_STATUS: i32 = 429;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Write,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Write => "write",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutPhase {
    Connect,
    Response,
    ResponseBody,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Connect => "connect",
            Self::Response => "response",
            Self::ResponseBody => "response_body",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    Transport,
    Timeout,
    Body,
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    HttpStatus,
    Parse,
    DecodeContentEncoding,
    ResponseBodyTooLarge,
    CapacityExceeded,
    DispatcherClosed,
    Cancelled,
    RetryExhausted,
    DeadlineExceeded,
    Internal,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Body => "body",
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::HttpStatus => "http_status",
            Self::Parse => "parse",
            Self::DecodeContentEncoding => "decode_content_encoding",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::DispatcherClosed => "dispatcher_closed",
            Self::Cancelled => "cancelled",
            Self::RetryExhausted => "retry_exhausted",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Failure raised by a [`ResponseParser`](crate::ResponseParser) on malformed input.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ParseError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out in {phase} after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        phase: TimeoutPhase,
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("failed to produce request body: {source}")]
    Body {
        #[source]
        source: std::io::Error,
    },
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}")]
    InvalidHeaderName { name: String },
    #[error("invalid header value for {name}")]
    InvalidHeaderValue { name: String },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("http status error {status} for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("parse error: {source}")]
    Parse {
        #[source]
        source: ParseError,
    },
    #[error("failed to decode response content-encoding {encoding}: {message}")]
    DecodeContentEncoding { encoding: String, message: String },
    #[error("response body too large ({actual_bytes} bytes > {limit_bytes} bytes)")]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
    },
    #[error("request queue is full (capacity {capacity})")]
    CapacityExceeded { capacity: usize },
    #[error("dispatcher is shut down")]
    DispatcherClosed,
    #[error("request was cancelled")]
    Cancelled,
    #[error("retry limit exceeded after {attempts} attempts for {method} {uri}")]
    RetryExhausted {
        attempts: usize,
        method: Method,
        uri: String,
    },
    #[error("request deadline exceeded after {timeout_ms}ms for {method} {uri}")]
    DeadlineExceeded {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Body { .. } => ErrorCode::Body,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Parse { .. } => ErrorCode::Parse,
            Self::DecodeContentEncoding { .. } => ErrorCode::DecodeContentEncoding,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            Self::DispatcherClosed => ErrorCode::DispatcherClosed,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::RetryExhausted { .. } => ErrorCode::RetryExhausted,
            Self::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            Self::Internal { .. } => ErrorCode::Internal,
        }
    }

    /// HTTP status carried by this failure, or `-1` when the failure did not
    /// come from a server response.
    pub fn status_code(&self) -> i32 {
        match self {
            Self::HttpStatus { status, .. } => i32::from(*status),
            Self::CapacityExceeded { .. } => CAPACITY_EXCEEDED_STATUS,
            _ => -1,
        }
    }

    /// Server error body for status failures, a descriptive message otherwise.
    pub fn body(&self) -> String {
        match self {
            Self::HttpStatus { body, .. } => body.clone(),
            Self::CapacityExceeded { .. } => "Too Many Requests".to_owned(),
            other => other.to_string(),
        }
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Network level faults that a retry may plausibly fix.
    pub const fn is_transient_io(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    pub const fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub(crate) fn transport(
        kind: TransportErrorKind,
        method: &Method,
        uri: &str,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Transport {
            kind,
            method: method.clone(),
            uri: uri.to_owned(),
            source: source.into(),
        }
    }
}
