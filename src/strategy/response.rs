use bytes::Bytes;

use crate::connection::Connection;
use crate::content_encoding::decode_content_encoded_body_limited;
use crate::error::Error;
use crate::util::redact_uri_for_logs;

pub const DEFAULT_MAX_DECODED_BODY_BYTES: usize = 8 * 1024 * 1024;
pub const NO_ERROR_BODY: &str = "No error body provided.";

/// Reads the body of a successful (2xx) response as text.
pub trait ResponseReader: Send + Sync {
    fn read_success(&self, connection: &mut dyn Connection) -> crate::Result<String>;
}

/// Decodes `Content-Encoding` unless the transport already did, then reads
/// the body as UTF-8 (invalid sequences are replaced).
#[derive(Clone, Copy, Debug)]
pub struct DefaultResponseReader {
    max_decoded_bytes: usize,
}

impl DefaultResponseReader {
    pub const fn new() -> Self {
        Self {
            max_decoded_bytes: DEFAULT_MAX_DECODED_BODY_BYTES,
        }
    }

    pub fn max_decoded_bytes(mut self, max_decoded_bytes: usize) -> Self {
        self.max_decoded_bytes = max_decoded_bytes.max(1);
        self
    }
}

impl Default for DefaultResponseReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseReader for DefaultResponseReader {
    fn read_success(&self, connection: &mut dyn Connection) -> crate::Result<String> {
        let body = connection.read_body()?;
        let body = decode_unless_transparent(connection, body, self.max_decoded_bytes)?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

fn decode_unless_transparent(
    connection: &dyn Connection,
    body: Bytes,
    max_bytes: usize,
) -> crate::Result<Bytes> {
    if connection.decodes_transparently() {
        return Ok(body);
    }
    let encoding = connection.response_header("Content-Encoding");
    decode_content_encoded_body_limited(body, encoding.as_deref(), max_bytes)
}

/// Turns a non-retried, non-2xx response into the terminal error.
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, connection: &mut dyn Connection, status: u16) -> Error;
}

/// Prefers the dedicated error stream, falls back to the regular body and
/// finally to [`NO_ERROR_BODY`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
    fn handle_error(&self, connection: &mut dyn Connection, status: u16) -> Error {
        let raw = match connection.read_error_body() {
            Some(body) => Some(body),
            None => connection.read_body().ok(),
        };
        let body = raw
            .map(|raw| {
                let decoded =
                    decode_unless_transparent(connection, raw.clone(), DEFAULT_MAX_DECODED_BODY_BYTES)
                        .unwrap_or(raw);
                String::from_utf8_lossy(&decoded).into_owned()
            })
            .filter(|body| !body.is_empty())
            .unwrap_or_else(|| NO_ERROR_BODY.to_owned());

        Error::HttpStatus {
            status,
            method: connection.method().clone(),
            uri: redact_uri_for_logs(connection.url()),
            body,
        }
    }
}
