//! Blocking connection contract the engine executes commands against.
//!
//! A [`Connection`] is single use: the command loop asks the factory for a
//! fresh one on every attempt and closes it on every exit path.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderName, HeaderValue, Method};

use crate::error::Error;

pub mod scripted;
#[cfg(feature = "transport-ureq")]
pub mod ureq;

pub use scripted::{CapturedRequest, ScriptedConnectionFactory, ScriptedReply, ScriptedResponse};
#[cfg(feature = "transport-ureq")]
pub use self::ureq::UreqConnectionFactory;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
}

impl Timeouts {
    pub const fn new(connect: Duration, read: Duration) -> Self {
        Self { connect, read }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
    }
}

pub trait Connection: Send {
    fn url(&self) -> &str;

    fn set_timeouts(&mut self, timeouts: Timeouts);

    fn set_method(&mut self, method: Method);

    fn method(&self) -> &Method;

    /// Replaces any previous value of the header.
    fn set_header(&mut self, name: &str, value: &str) -> crate::Result<()>;

    fn request_header(&self, name: &str) -> Option<String>;

    fn write_body(&mut self, body: Bytes) -> crate::Result<()>;

    /// Sends the request and returns the response status. Connect and read
    /// faults come back as `Err`, non-2xx statuses as `Ok`.
    fn execute(&mut self) -> crate::Result<u16>;

    fn response_header(&self, name: &str) -> Option<String>;

    fn read_body(&mut self) -> crate::Result<Bytes>;

    /// Dedicated error stream, for transports that keep one apart from the
    /// regular body.
    fn read_error_body(&mut self) -> Option<Bytes> {
        None
    }

    /// True when the transport already strips `Content-Encoding`.
    fn decodes_transparently(&self) -> bool {
        false
    }

    fn close(&mut self);
}

pub trait ConnectionFactory: Send + Sync {
    fn create(&self, url: &str) -> crate::Result<Box<dyn Connection>>;
}

pub(crate) fn parse_header(name: &str, value: &str) -> crate::Result<(HeaderName, HeaderValue)> {
    let header_name =
        HeaderName::from_bytes(name.as_bytes()).map_err(|_| Error::InvalidHeaderName {
            name: name.to_owned(),
        })?;
    let header_value = HeaderValue::from_str(value).map_err(|_| Error::InvalidHeaderValue {
        name: name.to_owned(),
    })?;
    Ok((header_name, header_value))
}

#[cfg(test)]
mod tests {
    use super::parse_header;
    use crate::error::ErrorCode;

    #[test]
    fn parse_header_rejects_invalid_names_and_values() {
        let name_error = parse_header("bad header", "x").expect_err("space in name must fail");
        assert_eq!(name_error.code(), ErrorCode::InvalidHeaderName);

        let value_error =
            parse_header("x-trace", "line\nbreak").expect_err("newline in value must fail");
        assert_eq!(value_error.code(), ErrorCode::InvalidHeaderValue);

        let (name, value) = parse_header("X-Trace", "abc").expect("valid header");
        assert_eq!(name.as_str(), "x-trace");
        assert_eq!(value, "abc");
    }
}
