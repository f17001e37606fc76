use std::io::Read;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method};

use super::{Connection, ConnectionFactory, Timeouts, parse_header};
use crate::error::{Error, TimeoutPhase, TransportErrorKind};
use crate::util::redact_uri_for_logs;

pub const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_USER_AGENT: &str = concat!("netq/", env!("CARGO_PKG_VERSION"));

/// Connection factory backed by a shared blocking `ureq` agent.
#[derive(Clone)]
pub struct UreqConnectionFactory {
    agent: ::ureq::Agent,
    max_response_body_bytes: usize,
}

impl UreqConnectionFactory {
    pub fn new() -> Self {
        Self::with_agent(make_agent(DEFAULT_USER_AGENT))
    }

    /// Uses a caller-configured agent (TLS roots, proxy, pooling). The agent
    /// must be built with `http_status_as_error(false)` so non-2xx statuses
    /// reach the retry loop as statuses.
    pub fn with_agent(agent: ::ureq::Agent) -> Self {
        Self {
            agent,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
        }
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }
}

impl Default for UreqConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UreqConnectionFactory {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("UreqConnectionFactory")
            .field("max_response_body_bytes", &self.max_response_body_bytes)
            .finish_non_exhaustive()
    }
}

impl ConnectionFactory for UreqConnectionFactory {
    fn create(&self, url: &str) -> crate::Result<Box<dyn Connection>> {
        Ok(Box::new(UreqConnection {
            agent: self.agent.clone(),
            url: url.to_owned(),
            redacted_url: redact_uri_for_logs(url),
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            timeouts: Timeouts::default(),
            max_response_body_bytes: self.max_response_body_bytes,
            response: None,
        }))
    }
}

pub(crate) fn make_agent(user_agent: &str) -> ::ureq::Agent {
    let config = ::ureq::Agent::config_builder()
        .http_status_as_error(false)
        .user_agent(user_agent)
        .build();
    config.new_agent()
}

struct UreqConnection {
    agent: ::ureq::Agent,
    url: String,
    redacted_url: String,
    method: Method,
    headers: HeaderMap,
    body: Option<Bytes>,
    timeouts: Timeouts,
    max_response_body_bytes: usize,
    response: Option<::ureq::http::Response<::ureq::Body>>,
}

impl UreqConnection {
    fn build_request<S>(&self, body: S) -> crate::Result<::ureq::http::Request<S>> {
        let mut builder = ::ureq::http::Request::builder()
            .method(self.method.as_str())
            .uri(self.url.as_str());
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        builder.body(body).map_err(|_| Error::InvalidUri {
            uri: self.redacted_url.clone(),
        })
    }

    fn run_configured_request<S: ::ureq::AsSendBody>(
        &self,
        request: ::ureq::http::Request<S>,
    ) -> crate::Result<::ureq::http::Response<::ureq::Body>> {
        let configured_request = self
            .agent
            .configure_request(request)
            .timeout_connect(Some(self.timeouts.connect))
            .timeout_recv_response(Some(self.timeouts.read))
            .timeout_recv_body(Some(self.timeouts.read))
            .build();

        self.agent
            .run(configured_request)
            .map_err(|source| match source {
                ::ureq::Error::Timeout(_) => Error::Timeout {
                    phase: TimeoutPhase::Response,
                    timeout_ms: self.timeouts.read.as_millis(),
                    method: self.method.clone(),
                    uri: self.redacted_url.clone(),
                },
                other => Error::Transport {
                    kind: classify_ureq_transport_error(&other),
                    method: self.method.clone(),
                    uri: self.redacted_url.clone(),
                    source: Box::new(other),
                },
            })
    }

    fn map_body_read_error(&self, source: std::io::Error) -> Error {
        if let Some(::ureq::Error::Timeout(_)) = wrapped_ureq_error(&source) {
            return Error::Timeout {
                phase: TimeoutPhase::ResponseBody,
                timeout_ms: self.timeouts.read.as_millis(),
                method: self.method.clone(),
                uri: self.redacted_url.clone(),
            };
        }
        if source.kind() == std::io::ErrorKind::TimedOut {
            return Error::Timeout {
                phase: TimeoutPhase::ResponseBody,
                timeout_ms: self.timeouts.read.as_millis(),
                method: self.method.clone(),
                uri: self.redacted_url.clone(),
            };
        }
        Error::transport(
            TransportErrorKind::Read,
            &self.method,
            &self.redacted_url,
            source,
        )
    }
}

impl Connection for UreqConnection {
    fn url(&self) -> &str {
        &self.url
    }

    fn set_timeouts(&mut self, timeouts: Timeouts) {
        self.timeouts = timeouts;
    }

    fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    fn method(&self) -> &Method {
        &self.method
    }

    fn set_header(&mut self, name: &str, value: &str) -> crate::Result<()> {
        let (name, value) = parse_header(name, value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    fn request_header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    }

    fn write_body(&mut self, body: Bytes) -> crate::Result<()> {
        self.body = Some(body);
        Ok(())
    }

    fn execute(&mut self) -> crate::Result<u16> {
        let response = match &self.body {
            Some(body) => {
                let request = self.build_request(body.to_vec())?;
                self.run_configured_request(request)?
            }
            None => {
                let request = self.build_request(())?;
                self.run_configured_request(request)?
            }
        };
        let status = response.status().as_u16();
        self.response = Some(response);
        Ok(status)
    }

    fn response_header(&self, name: &str) -> Option<String> {
        self.response
            .as_ref()?
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    }

    fn read_body(&mut self) -> crate::Result<Bytes> {
        let Some(mut response) = self.response.take() else {
            return Err(Error::Internal {
                message: "response body read before the request was executed".to_owned(),
            });
        };
        let result = read_all_body_limited(&mut response, self.max_response_body_bytes);
        self.response = Some(response);
        match result {
            Ok(body) => Ok(body),
            Err(ReadBodyError::TooLarge { actual_bytes }) => Err(Error::ResponseBodyTooLarge {
                limit_bytes: self.max_response_body_bytes,
                actual_bytes,
            }),
            Err(ReadBodyError::Read(source)) => Err(self.map_body_read_error(source)),
        }
    }

    fn close(&mut self) {
        self.response = None;
        self.body = None;
    }
}

fn classify_ureq_transport_error(error: &::ureq::Error) -> TransportErrorKind {
    match error {
        ::ureq::Error::HostNotFound => TransportErrorKind::Dns,
        ::ureq::Error::Tls(_) | ::ureq::Error::Rustls(_) | ::ureq::Error::Pem(_) => {
            TransportErrorKind::Tls
        }
        ::ureq::Error::ConnectProxyFailed(_) | ::ureq::Error::ConnectionFailed => {
            TransportErrorKind::Connect
        }
        ::ureq::Error::Io(source) => match source.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportErrorKind::Read
            }
            std::io::ErrorKind::NotFound => TransportErrorKind::Dns,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::AddrNotAvailable => TransportErrorKind::Connect,
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => TransportErrorKind::Read,
            std::io::ErrorKind::WriteZero => TransportErrorKind::Write,
            _ => TransportErrorKind::Other,
        },
        _ => TransportErrorKind::Other,
    }
}

fn wrapped_ureq_error(io_error: &std::io::Error) -> Option<&::ureq::Error> {
    io_error
        .get_ref()
        .and_then(|source| source.downcast_ref::<::ureq::Error>())
}

enum ReadBodyError {
    Read(std::io::Error),
    TooLarge { actual_bytes: usize },
}

fn read_all_body_limited(
    response: &mut ::ureq::http::Response<::ureq::Body>,
    max_bytes: usize,
) -> Result<Bytes, ReadBodyError> {
    let mut reader = response.body_mut().as_reader();
    let mut collected = Vec::new();
    let mut chunk = [0_u8; 8192];
    let mut total_len = 0_usize;

    loop {
        let read = reader.read(&mut chunk).map_err(ReadBodyError::Read)?;
        if read == 0 {
            break;
        }
        total_len = total_len.saturating_add(read);
        if total_len > max_bytes {
            return Err(ReadBodyError::TooLarge {
                actual_bytes: total_len,
            });
        }
        collected.extend_from_slice(&chunk[..read]);
    }

    Ok(Bytes::from(collected))
}
