use http::Method;

use crate::connection::Connection;
use crate::error::Error;
use crate::util::truncate_body;

/// Per-attempt view of a command handed to interceptors.
#[derive(Clone, Debug)]
pub struct RequestContext {
    method: Method,
    uri: String,
    attempt: usize,
    max_attempts: usize,
}

impl RequestContext {
    pub(crate) fn new(method: Method, uri: String, attempt: usize, max_attempts: usize) -> Self {
        Self {
            method,
            uri,
            attempt,
            max_attempts,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Target URI with credentials, query and fragment removed.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// One-based attempt number.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

/// Observation and mutation hooks around each attempt. Every hook defaults
/// to a no-op; interceptors run in registration order.
pub trait Interceptor: Send + Sync {
    /// Runs after the request configurator and before the body is written.
    /// An error here is treated like a transport fault of the attempt.
    fn on_request(
        &self,
        _context: &RequestContext,
        _connection: &mut dyn Connection,
    ) -> crate::Result<()> {
        Ok(())
    }

    fn on_response_headers(
        &self,
        _context: &RequestContext,
        _status: u16,
        _connection: &dyn Connection,
    ) {
    }

    fn on_success(&self, _context: &RequestContext, _body: &str) {}

    fn on_error(&self, _context: &RequestContext, _status: u16, _body: &str) {}

    fn on_failure(&self, _context: &RequestContext, _error: &Error) {}
}

/// Logs every hook through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn on_request(
        &self,
        context: &RequestContext,
        _connection: &mut dyn Connection,
    ) -> crate::Result<()> {
        tracing::debug!(
            method = %context.method(),
            uri = context.uri(),
            attempt = context.attempt(),
            max_attempts = context.max_attempts(),
            "sending request"
        );
        Ok(())
    }

    fn on_response_headers(&self, context: &RequestContext, status: u16, _connection: &dyn Connection) {
        tracing::debug!(
            method = %context.method(),
            uri = context.uri(),
            status,
            "response received"
        );
    }

    fn on_success(&self, context: &RequestContext, body: &str) {
        tracing::debug!(
            method = %context.method(),
            uri = context.uri(),
            body_len = body.len(),
            "request succeeded"
        );
    }

    fn on_error(&self, context: &RequestContext, status: u16, body: &str) {
        tracing::warn!(
            method = %context.method(),
            uri = context.uri(),
            status,
            body = %truncate_body(body.as_bytes()),
            "request failed with status"
        );
    }

    fn on_failure(&self, context: &RequestContext, error: &Error) {
        tracing::warn!(
            method = %context.method(),
            uri = context.uri(),
            code = error.code().as_str(),
            error = %error,
            "request failed"
        );
    }
}
