//! In-memory connection backend that replays a script of replies and records
//! every request it sees.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method};

use super::{Connection, ConnectionFactory, Timeouts, parse_header};
use crate::error::{Error, TimeoutPhase, TransportErrorKind};
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug)]
pub struct ScriptedResponse {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    error_body: Option<Bytes>,
    latency: Duration,
}

impl ScriptedResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            error_body: None,
            latency: Duration::ZERO,
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200).body(body)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Body served through the dedicated error stream.
    pub fn error_body(mut self, body: impl Into<Bytes>) -> Self {
        self.error_body = Some(body.into());
        self
    }

    /// Invalid header pairs are ignored.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let Ok((name, value)) = parse_header(name, value) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Simulated server-side latency before the status is returned.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[derive(Clone, Debug)]
pub enum ScriptedReply {
    Respond(ScriptedResponse),
    Fault {
        kind: TransportErrorKind,
        message: String,
    },
    Timeout,
}

impl From<ScriptedResponse> for ScriptedReply {
    fn from(response: ScriptedResponse) -> Self {
        Self::Respond(response)
    }
}

/// Request as observed by the scripted backend at execution time.
#[derive(Clone, Debug)]
pub struct CapturedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub timeouts: Timeouts,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    replies: Mutex<VecDeque<ScriptedReply>>,
    fallback: Mutex<Option<ScriptedReply>>,
    captured: Mutex<Vec<CapturedRequest>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Cloneable handle to a reply script shared by every connection it creates.
#[derive(Clone, Debug, Default)]
pub struct ScriptedConnectionFactory {
    state: Arc<ScriptState>,
    decodes_transparently: bool,
}

impl ScriptedConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, response: ScriptedResponse) -> Self {
        self.push(ScriptedReply::Respond(response))
    }

    pub fn fail(self, kind: TransportErrorKind, message: impl Into<String>) -> Self {
        self.push(ScriptedReply::Fault {
            kind,
            message: message.into(),
        })
    }

    pub fn time_out(self) -> Self {
        self.push(ScriptedReply::Timeout)
    }

    /// Reply used once the script runs dry. Without one, exhausted scripts
    /// fail with a connect fault.
    pub fn fallback(self, reply: impl Into<ScriptedReply>) -> Self {
        *lock_unpoisoned(&self.state.fallback) = Some(reply.into());
        self
    }

    pub fn transparent_decoding(mut self, enabled: bool) -> Self {
        self.decodes_transparently = enabled;
        self
    }

    pub fn push(self, reply: impl Into<ScriptedReply>) -> Self {
        lock_unpoisoned(&self.state.replies).push_back(reply.into());
        self
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        lock_unpoisoned(&self.state.captured).clone()
    }

    /// Number of requests that reached execution.
    pub fn request_count(&self) -> usize {
        lock_unpoisoned(&self.state.captured).len()
    }

    pub fn connections_opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> Option<ScriptedReply> {
        if let Some(reply) = lock_unpoisoned(&self.state.replies).pop_front() {
            return Some(reply);
        }
        lock_unpoisoned(&self.state.fallback).clone()
    }
}

impl ConnectionFactory for ScriptedConnectionFactory {
    fn create(&self, url: &str) -> crate::Result<Box<dyn Connection>> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            factory: self.clone(),
            url: url.to_owned(),
            method: Method::GET,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timeouts: Timeouts::default(),
            response: None,
            closed: false,
        }))
    }
}

struct ScriptedConnection {
    factory: ScriptedConnectionFactory,
    url: String,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
    timeouts: Timeouts,
    response: Option<ScriptedResponse>,
    closed: bool,
}

impl ScriptedConnection {
    fn capture(&self) {
        let headers = self
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_owned(), value.to_owned()))
            })
            .collect();
        lock_unpoisoned(&self.factory.state.captured).push(CapturedRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers,
            body: self.body.clone(),
            timeouts: self.timeouts,
        });
    }
}

impl Connection for ScriptedConnection {
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
        self.body = body;
        Ok(())
    }

    fn execute(&mut self) -> crate::Result<u16> {
        self.capture();
        match self.factory.next_reply() {
            Some(ScriptedReply::Respond(response)) => {
                if !response.latency.is_zero() {
                    thread::sleep(response.latency);
                }
                let status = response.status;
                self.response = Some(response);
                Ok(status)
            }
            Some(ScriptedReply::Fault { kind, message }) => {
                Err(Error::transport(kind, &self.method, &self.url, message))
            }
            Some(ScriptedReply::Timeout) => Err(Error::Timeout {
                phase: TimeoutPhase::Response,
                timeout_ms: self.timeouts.read.as_millis(),
                method: self.method.clone(),
                uri: self.url.clone(),
            }),
            None => Err(Error::transport(
                TransportErrorKind::Connect,
                &self.method,
                &self.url,
                "no scripted reply left",
            )),
        }
    }

    fn response_header(&self, name: &str) -> Option<String> {
        self.response
            .as_ref()?
            .headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    }

    fn read_body(&mut self) -> crate::Result<Bytes> {
        match &self.response {
            Some(response) => Ok(response.body.clone()),
            None => Err(Error::Internal {
                message: "response body read before the request was executed".to_owned(),
            }),
        }
    }

    fn read_error_body(&mut self) -> Option<Bytes> {
        self.response.as_ref()?.error_body.clone()
    }

    fn decodes_transparently(&self) -> bool {
        self.factory.decodes_transparently
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.response = None;
            self.factory.state.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ScriptedConnectionFactory, ScriptedResponse};
    use crate::connection::ConnectionFactory;
    use crate::error::TransportErrorKind;

    #[test]
    fn replays_script_in_order_and_captures_requests() {
        let factory = ScriptedConnectionFactory::new()
            .respond(ScriptedResponse::new(503).header("Retry-After", "1"))
            .fail(TransportErrorKind::Read, "reset")
            .respond(ScriptedResponse::ok("done"));

        let mut first = factory.create("http://api.test/a").expect("create");
        first.set_header("X-Trace", "1").expect("header");
        assert_eq!(first.execute().expect("status"), 503);
        assert_eq!(first.response_header("retry-after").as_deref(), Some("1"));
        first.close();
        first.close();

        let mut second = factory.create("http://api.test/a").expect("create");
        let error = second.execute().expect_err("scripted fault");
        assert_eq!(error.transport_kind(), Some(TransportErrorKind::Read));
        second.close();

        let mut third = factory.create("http://api.test/a").expect("create");
        assert_eq!(third.execute().expect("status"), 200);
        assert_eq!(third.read_body().expect("body").as_ref(), b"done");
        third.close();

        let requests = factory.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].header("x-trace"), Some("1"));
        assert_eq!(factory.connections_opened(), 3);
        assert_eq!(factory.connections_closed(), 3);
    }

    #[test]
    fn exhausted_script_uses_fallback() {
        let factory = ScriptedConnectionFactory::new().fallback(ScriptedResponse::ok("again"));
        for _ in 0..3 {
            let mut connection = factory.create("http://api.test/").expect("create");
            assert_eq!(connection.execute().expect("status"), 200);
        }

        let empty = ScriptedConnectionFactory::new();
        let mut connection = empty.create("http://api.test/").expect("create");
        let error = connection.execute().expect_err("no replies");
        assert_eq!(error.transport_kind(), Some(TransportErrorKind::Connect));
    }
}
