//! Request descriptions and the per-command retry loop.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use http::Method;
use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::connection::{
    Connection, ConnectionFactory, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT, Timeouts,
};
use crate::error::Error;
use crate::future::Cancelable;
use crate::interceptor::{Interceptor, RequestContext};
use crate::result::NetResult;
use crate::strategy::{
    BackoffStrategy, BodyWriter, BytesBodyWriter, DefaultErrorHandler, DefaultMethodStrategy,
    DefaultRequestConfigurator, DefaultResponseReader, ErrorHandler, HeaderFirstBackoff,
    JsonBodyWriter, MethodStrategy, MultipartBodyWriter, NoBodyWriter,
    PatchOverrideMethodStrategy, RequestConfigurator, ResponseReader, RetryPolicy,
    StatusWhitelistRetryPolicy, retry_after_delay,
};
use crate::util::{lock_unpoisoned, redact_uri_for_logs, retry_after_seconds};

pub const DEFAULT_CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// GET, PUT and DELETE may be repeated without changing the outcome.
pub fn is_idempotent_method(method: &Method) -> bool {
    *method == Method::GET || *method == Method::PUT || *method == Method::DELETE
}

/// What gets sent: method, relative path, query, headers and content type.
///
/// Request configurators receive this mutably, so they can stamp headers
/// that must survive across attempts (an idempotency key for instance).
#[derive(Clone, Debug)]
pub struct RequestSpec {
    method: Method,
    path: String,
    query: HashMap<String, String>,
    headers: Vec<(String, String)>,
    content_type: String,
    idempotent: bool,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let idempotent = is_idempotent_method(&method);
        Self {
            method,
            path: path.into(),
            query: HashMap::new(),
            headers: Vec::new(),
            content_type: DEFAULT_CONTENT_TYPE.to_owned(),
            idempotent,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &HashMap<String, String> {
        &self.query
    }

    pub fn set_query(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.query.insert(name.into(), value.into());
    }

    /// Headers in insertion order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Last write wins; names compare case-insensitively.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some(slot) => *slot = (name, value),
            None => self.headers.push((name, value)),
        }
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = content_type.into();
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }
}

#[derive(Debug, Default)]
struct CancelFlag {
    cancelled: AtomicBool,
    sleep_lock: Mutex<()>,
    wake: Condvar,
}

/// Shared cancellation flag of one command. Set once, never reset.
#[derive(Clone, Debug, Default)]
pub struct CommandHandle {
    inner: Arc<CancelFlag>,
}

impl CommandHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when this call flipped the flag.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _guard = lock_unpoisoned(&self.inner.sleep_lock);
        self.inner.wake.notify_all();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless cancelled first. Returns `false` when the
    /// sleep was cut short by cancellation. A duration past the range of
    /// `Instant` only ends through cancellation.
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now().checked_add(duration);
        let mut guard = lock_unpoisoned(&self.inner.sleep_lock);
        loop {
            if self.is_cancelled() {
                return false;
            }
            guard = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return true;
                    }
                    match self.inner.wake.wait_timeout(guard, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
                None => match self.inner.wake.wait(guard) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                },
            };
        }
    }
}

impl Cancelable for CommandHandle {
    fn cancel(&self) {
        CommandHandle::cancel(self);
    }
}

/// Dispatcher-wide defaults a command falls back to when it carries no
/// override of its own.
#[derive(Clone, Copy, Debug)]
pub struct ExecutionSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub overall_timeout: Option<Duration>,
    pub max_retries: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            overall_timeout: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// One HTTP request together with the strategies that drive it.
///
/// Strategies left unset are filled with defaults on first execution:
/// whitelist retries for idempotent methods, header-first full-jitter
/// backoff, JSON headers, no body, gzip-aware reading.
pub struct Command {
    request: RequestSpec,
    retry_policy: Option<Box<dyn RetryPolicy>>,
    backoff: Option<Box<dyn BackoffStrategy>>,
    request_configurator: Option<Arc<dyn RequestConfigurator>>,
    body_writer: Option<Arc<dyn BodyWriter>>,
    response_reader: Option<Arc<dyn ResponseReader>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    method_strategy: Option<Arc<dyn MethodStrategy>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    overall_timeout: Option<Duration>,
    max_retries: Option<usize>,
    clock: Option<Arc<dyn Clock>>,
    handle: CommandHandle,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("request", &self.request)
            .field("interceptors", &self.interceptors.len())
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("overall_timeout", &self.overall_timeout)
            .field("max_retries", &self.max_retries)
            .field("cancelled", &self.handle.is_cancelled())
            .finish()
    }
}

impl Command {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let method_strategy: Option<Arc<dyn MethodStrategy>> = if method == Method::PATCH {
            Some(Arc::new(PatchOverrideMethodStrategy))
        } else {
            None
        };
        Self {
            request: RequestSpec::new(method, path),
            retry_policy: None,
            backoff: None,
            request_configurator: None,
            body_writer: None,
            response_reader: None,
            error_handler: None,
            method_strategy,
            interceptors: Vec::new(),
            connect_timeout: None,
            read_timeout: None,
            overall_timeout: None,
            max_retries: None,
            clock: None,
            handle: CommandHandle::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn post(path: impl Into<String>, json: impl Into<String>) -> Self {
        Self::new(Method::POST, path).json(json)
    }

    pub fn put(path: impl Into<String>, json: impl Into<String>) -> Self {
        Self::new(Method::PUT, path).json(json)
    }

    /// PATCH is tunnelled through POST with `X-HTTP-Method-Override` unless a
    /// different method strategy is installed.
    pub fn patch(path: impl Into<String>, json: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path).json(json)
    }

    /// POST with a `multipart/form-data` body.
    pub fn multipart(path: impl Into<String>, form: MultipartBodyWriter) -> Self {
        let mut command = Self::new(Method::POST, path);
        command.request.set_content_type(form.content_type());
        command.body_writer = Some(Arc::new(form));
        command
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.set_query(name, value);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.set_header(name, value);
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.request.set_content_type(content_type);
        self
    }

    pub fn json(mut self, json: impl Into<String>) -> Self {
        self.body_writer = Some(Arc::new(JsonBodyWriter::new(json)));
        self
    }

    pub fn json_value<T>(self, value: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let json =
            serde_json::to_string(value).map_err(|source| Error::SerializeJson { source })?;
        Ok(self.json(json))
    }

    pub fn bytes(mut self, body: impl Into<bytes::Bytes>, content_type: impl Into<String>) -> Self {
        let content_type = content_type.into();
        self.request.set_content_type(content_type.clone());
        self.body_writer = Some(Arc::new(BytesBodyWriter::new(body).content_type(content_type)));
        self
    }

    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Some(Box::new(policy));
        self
    }

    pub fn backoff(mut self, backoff: impl BackoffStrategy + 'static) -> Self {
        self.backoff = Some(Box::new(backoff));
        self
    }

    pub fn request_configurator(self, configurator: impl RequestConfigurator + 'static) -> Self {
        self.request_configurator_arc(Arc::new(configurator))
    }

    pub fn request_configurator_arc(mut self, configurator: Arc<dyn RequestConfigurator>) -> Self {
        self.request_configurator = Some(configurator);
        self
    }

    pub fn body_writer(mut self, writer: impl BodyWriter + 'static) -> Self {
        self.body_writer = Some(Arc::new(writer));
        self
    }

    pub fn response_reader(mut self, reader: impl ResponseReader + 'static) -> Self {
        self.response_reader = Some(Arc::new(reader));
        self
    }

    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn method_strategy(mut self, strategy: impl MethodStrategy + 'static) -> Self {
        self.method_strategy = Some(Arc::new(strategy));
        self
    }

    pub fn interceptor(self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptor_arc(Arc::new(interceptor))
    }

    pub fn interceptor_arc(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    /// Upper bound for the whole command, retries and sleeps included.
    pub fn overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    /// Retries beyond the first attempt.
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Time source for the overall timeout and for resolving `Retry-After`
    /// dates. Defaults to the system clock.
    pub fn clock(self, clock: impl Clock + 'static) -> Self {
        self.clock_arc(Arc::new(clock))
    }

    pub fn clock_arc(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn request(&self) -> &RequestSpec {
        &self.request
    }

    pub fn handle(&self) -> CommandHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// Body size as reported by the body writer, zero for bodyless commands.
    pub fn estimated_payload_bytes(&self) -> u64 {
        self.body_writer
            .as_ref()
            .and_then(|writer| writer.estimated_len())
            .unwrap_or(0)
    }

    pub(crate) fn append_interceptors<'a>(
        &mut self,
        interceptors: impl IntoIterator<Item = &'a Arc<dyn Interceptor>>,
    ) {
        self.interceptors.extend(interceptors.into_iter().cloned());
    }

    /// Installs `configurator` unless the command already carries one.
    pub(crate) fn default_request_configurator(&mut self, configurator: &Arc<dyn RequestConfigurator>) {
        if self.request_configurator.is_none() {
            self.request_configurator = Some(Arc::clone(configurator));
        }
    }

    /// Runs the retry loop against `url`, opening a fresh connection from
    /// `factory` for every attempt.
    pub fn execute(
        &mut self,
        factory: &dyn ConnectionFactory,
        url: &str,
        settings: &ExecutionSettings,
    ) -> NetResult<String> {
        let redacted_uri = redact_uri_for_logs(url);
        let method = self.request.method().clone();
        let span = tracing::info_span!("netq.request", method = %method, uri = %redacted_uri);
        let _entered = span.enter();

        let max_attempts = self
            .max_retries
            .unwrap_or(settings.max_retries)
            .saturating_add(1);
        let timeouts = Timeouts::new(
            self.connect_timeout.unwrap_or(settings.connect_timeout),
            self.read_timeout.unwrap_or(settings.read_timeout),
        );
        let overall_timeout = self.overall_timeout.or(settings.overall_timeout);
        let clock = self
            .clock
            .get_or_insert_with(|| Arc::new(SystemClock))
            .clone();
        let started_at = clock.now();

        let Command {
            request,
            retry_policy,
            backoff,
            request_configurator,
            body_writer,
            response_reader,
            error_handler,
            method_strategy,
            interceptors,
            handle,
            ..
        } = self;
        let backoff = backoff.get_or_insert_with(|| Box::new(HeaderFirstBackoff::default()));
        let mut attempt_runner = AttemptRunner {
            idempotent: request.is_idempotent(),
            request,
            retry_policy: retry_policy
                .get_or_insert_with(|| Box::new(StatusWhitelistRetryPolicy::default()))
                .as_mut(),
            request_configurator: Arc::clone(
                request_configurator.get_or_insert_with(|| Arc::new(DefaultRequestConfigurator)),
            ),
            body_writer: Arc::clone(body_writer.get_or_insert_with(|| Arc::new(NoBodyWriter))),
            response_reader: Arc::clone(
                response_reader.get_or_insert_with(|| Arc::new(DefaultResponseReader::new())),
            ),
            error_handler: Arc::clone(
                error_handler.get_or_insert_with(|| Arc::new(DefaultErrorHandler)),
            ),
            method_strategy: Arc::clone(
                method_strategy.get_or_insert_with(|| Arc::new(DefaultMethodStrategy)),
            ),
            interceptors: interceptors.as_slice(),
        };

        let mut previous_delay: Option<Duration> = None;
        for attempt in 1..=max_attempts {
            if handle.is_cancelled() {
                tracing::debug!(attempt, "command cancelled before attempt");
                return NetResult::Error(Error::Cancelled);
            }

            let context =
                RequestContext::new(method.clone(), redacted_uri.clone(), attempt, max_attempts);
            let retry_after = match attempt_runner.run(factory, url, timeouts, &context) {
                AttemptOutcome::Finished(result) => return result,
                AttemptOutcome::Retry { retry_after } => retry_after
                    .map(|raw_value| retry_after_seconds(&raw_value, clock.now_system())),
            };

            if attempt == max_attempts {
                break;
            }

            let delay = match previous_delay {
                None => {
                    let initial = backoff.initial_delay();
                    if retry_after_delay(retry_after.as_deref()).is_some() {
                        backoff.next_delay(initial, retry_after.as_deref())
                    } else {
                        initial
                    }
                }
                Some(previous) => backoff.next_delay(previous, retry_after.as_deref()),
            };
            previous_delay = Some(delay);

            if let Some(total) = overall_timeout
                && clock
                    .now()
                    .saturating_duration_since(started_at)
                    .saturating_add(delay)
                    >= total
            {
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    timeout_ms = total.as_millis() as u64,
                    "retry would exceed overall timeout"
                );
                return NetResult::Error(Error::DeadlineExceeded {
                    timeout_ms: total.as_millis(),
                    method,
                    uri: redacted_uri,
                });
            }

            tracing::warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling retry"
            );
            if !handle.sleep(delay) {
                tracing::debug!(attempt, "command cancelled during backoff");
                return NetResult::Error(Error::Cancelled);
            }
        }

        tracing::warn!(attempts = max_attempts, "retry limit exceeded");
        NetResult::Error(Error::RetryExhausted {
            attempts: max_attempts,
            method,
            uri: redacted_uri,
        })
    }
}

enum AttemptOutcome {
    Finished(NetResult<String>),
    Retry { retry_after: Option<String> },
}

/// Closes the wrapped connection on every exit path.
struct ConnectionGuard(Box<dyn Connection>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

struct AttemptRunner<'a> {
    request: &'a mut RequestSpec,
    idempotent: bool,
    retry_policy: &'a mut dyn RetryPolicy,
    request_configurator: Arc<dyn RequestConfigurator>,
    body_writer: Arc<dyn BodyWriter>,
    response_reader: Arc<dyn ResponseReader>,
    error_handler: Arc<dyn ErrorHandler>,
    method_strategy: Arc<dyn MethodStrategy>,
    interceptors: &'a [Arc<dyn Interceptor>],
}

impl AttemptRunner<'_> {
    fn run(
        &mut self,
        factory: &dyn ConnectionFactory,
        url: &str,
        timeouts: Timeouts,
        context: &RequestContext,
    ) -> AttemptOutcome {
        let result = factory.create(url).and_then(|connection| {
            let mut guard = ConnectionGuard(connection);
            self.exchange(guard.0.as_mut(), timeouts, context)
        });
        match result {
            Ok(outcome) => outcome,
            Err(error) => {
                if self.retry_policy.should_retry_on_error(&error, self.idempotent) {
                    tracing::debug!(attempt = context.attempt(), error = %error, "retryable failure");
                    return AttemptOutcome::Retry { retry_after: None };
                }
                for interceptor in self.interceptors {
                    interceptor.on_failure(context, &error);
                }
                AttemptOutcome::Finished(NetResult::Error(error))
            }
        }
    }

    /// One request/response exchange on an open connection. `Err` means the
    /// exchange itself failed; statuses are reported through the outcome.
    fn exchange(
        &mut self,
        connection: &mut dyn Connection,
        timeouts: Timeouts,
        context: &RequestContext,
    ) -> crate::Result<AttemptOutcome> {
        connection.set_timeouts(timeouts);
        self.method_strategy.apply(connection, self.request.method())?;
        self.request_configurator.configure(connection, self.request)?;
        for interceptor in self.interceptors {
            interceptor.on_request(context, connection)?;
        }
        self.body_writer.write(connection, self.request)?;

        let status = connection.execute()?;
        for interceptor in self.interceptors {
            interceptor.on_response_headers(context, status, connection);
        }

        if (200..300).contains(&status) {
            let body = if status == 204 {
                String::new()
            } else {
                self.response_reader.read_success(connection)?
            };
            for interceptor in self.interceptors {
                interceptor.on_success(context, &body);
            }
            return Ok(AttemptOutcome::Finished(NetResult::Success(body)));
        }

        if self.retry_policy.should_retry_on_status(status, self.idempotent) {
            tracing::debug!(attempt = context.attempt(), status, "retryable status");
            return Ok(AttemptOutcome::Retry {
                retry_after: connection.response_header("Retry-After"),
            });
        }

        let error = self.error_handler.handle_error(connection, status);
        let body = error.body();
        for interceptor in self.interceptors {
            interceptor.on_error(context, status, &body);
        }
        Ok(AttemptOutcome::Finished(NetResult::Error(error)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant, SystemTime};

    use http::Method;

    use super::{Command, ExecutionSettings, RequestSpec, is_idempotent_method};
    use crate::connection::{Connection, ScriptedConnectionFactory, ScriptedResponse};
    use crate::error::{Error, TransportErrorKind};
    use crate::interceptor::{Interceptor, RequestContext};
    use crate::result::NetResult;
    use crate::clock::ManualClock;
    use crate::strategy::{BackoffStrategy, FixedBackoff, NeverRetry};

    const URL: &str = "http://api.test/items";

    fn fast(command: Command) -> Command {
        command.backoff(FixedBackoff::new(Duration::from_millis(1)))
    }

    #[test]
    fn idempotency_follows_the_method() {
        assert!(is_idempotent_method(&Method::GET));
        assert!(is_idempotent_method(&Method::PUT));
        assert!(is_idempotent_method(&Method::DELETE));
        assert!(!is_idempotent_method(&Method::POST));
        assert!(!is_idempotent_method(&Method::PATCH));
    }

    #[test]
    fn request_headers_are_case_insensitive_and_last_write_wins() {
        let mut request = RequestSpec::new(Method::GET, "/");
        request.set_header("X-Trace", "a");
        request.set_header("x-trace", "b");
        assert_eq!(request.header("X-TRACE"), Some("b"));
        assert_eq!(request.headers().count(), 1);
    }

    #[test]
    fn retries_whitelisted_statuses_until_success() {
        let factory = ScriptedConnectionFactory::new()
            .respond(ScriptedResponse::new(503))
            .respond(ScriptedResponse::new(502))
            .respond(ScriptedResponse::ok(r#"{"id":1}"#));
        let mut command = fast(Command::get("/items"));

        let result = command.execute(&factory, URL, &ExecutionSettings::default());

        match result {
            NetResult::Success(body) => assert_eq!(body, r#"{"id":1}"#),
            NetResult::Error(error) => panic!("unexpected error: {error}"),
        }
        assert_eq!(factory.request_count(), 3);
        assert_eq!(factory.connections_opened(), 3);
        assert_eq!(factory.connections_closed(), 3);
    }

    #[test]
    fn post_is_not_retried_by_default() {
        let factory = ScriptedConnectionFactory::new()
            .respond(ScriptedResponse::new(503).body("busy"))
            .respond(ScriptedResponse::ok("late"));
        let mut command = fast(Command::post("/items", "{}"));

        let result = command.execute(&factory, URL, &ExecutionSettings::default());

        match result {
            NetResult::Error(Error::HttpStatus { status, body, .. }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "busy");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(factory.request_count(), 1);
    }

    #[test]
    fn no_content_yields_empty_body() {
        let factory = ScriptedConnectionFactory::new()
            .respond(ScriptedResponse::new(204).body("ignored"));
        let mut command = Command::delete("/items/1");
        let result = command.execute(&factory, URL, &ExecutionSettings::default());
        assert_eq!(result.data().map(String::as_str), Some(""));
    }

    #[test]
    fn exhausts_after_max_retries() {
        let factory =
            ScriptedConnectionFactory::new().fallback(ScriptedResponse::new(500));
        let mut command = fast(Command::get("/items")).max_retries(2);

        let result = command.execute(&factory, URL, &ExecutionSettings::default());

        match &result {
            NetResult::Error(Error::RetryExhausted { attempts, .. }) => assert_eq!(*attempts, 3),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(factory.request_count(), 3);
        assert_eq!(result.status_code(), -1);
    }

    #[test]
    fn transport_faults_are_retried_for_idempotent_commands() {
        let factory = ScriptedConnectionFactory::new()
            .fail(TransportErrorKind::Connect, "refused")
            .time_out()
            .respond(ScriptedResponse::ok("ok"));
        let mut command = fast(Command::get("/items"));

        let result = command.execute(&factory, URL, &ExecutionSettings::default());

        assert_eq!(result.data().map(String::as_str), Some("ok"));
        assert_eq!(factory.connections_opened(), 3);
    }

    #[test]
    fn terminal_transport_fault_is_returned() {
        let factory =
            ScriptedConnectionFactory::new().fail(TransportErrorKind::Dns, "no such host");
        let mut command = Command::get("/items").retry_policy(NeverRetry);

        let result = command.execute(&factory, URL, &ExecutionSettings::default());

        match result {
            NetResult::Error(error) => {
                assert_eq!(error.transport_kind(), Some(TransportErrorKind::Dns));
                assert_eq!(error.status_code(), -1);
            }
            NetResult::Success(body) => panic!("unexpected success: {body}"),
        }
    }

    #[test]
    fn cancelled_command_never_touches_the_transport() {
        let factory = ScriptedConnectionFactory::new().respond(ScriptedResponse::ok("ok"));
        let mut command = Command::get("/items");
        assert!(command.handle().cancel());
        assert!(!command.cancel());

        let result = command.execute(&factory, URL, &ExecutionSettings::default());

        assert!(matches!(result, NetResult::Error(Error::Cancelled)));
        assert_eq!(factory.connections_opened(), 0);
    }

    #[test]
    fn cancel_interrupts_backoff_sleep() {
        let factory = ScriptedConnectionFactory::new().fallback(ScriptedResponse::new(503));
        let mut command =
            Command::get("/items").backoff(FixedBackoff::new(Duration::from_secs(30)));
        let handle = command.handle();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.cancel();
        });

        let started = Instant::now();
        let result = command.execute(&factory, URL, &ExecutionSettings::default());
        canceller.join().expect("join canceller");

        assert!(matches!(result, NetResult::Error(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(factory.request_count(), 1);
    }

    #[test]
    fn overall_timeout_stops_retrying() {
        let factory = ScriptedConnectionFactory::new().fallback(ScriptedResponse::new(503));
        let mut command = Command::get("/items")
            .backoff(FixedBackoff::new(Duration::from_secs(5)))
            .overall_timeout(Duration::from_secs(1));

        let result = command.execute(&factory, URL, &ExecutionSettings::default());

        assert!(matches!(result, NetResult::Error(Error::DeadlineExceeded { .. })));
        assert_eq!(factory.request_count(), 1);
    }

    #[test]
    fn enormous_retry_after_waits_for_cancellation() {
        let factory = ScriptedConnectionFactory::new()
            .respond(ScriptedResponse::new(503).header("Retry-After", "18446744073709551615"))
            .respond(ScriptedResponse::ok("{}"));
        let mut command = Command::get("/items");
        let handle = command.handle();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.cancel();
        });

        let result = command.execute(&factory, URL, &ExecutionSettings::default());
        canceller.join().expect("join canceller");

        assert!(matches!(result, NetResult::Error(Error::Cancelled)));
        assert_eq!(factory.request_count(), 1);
    }

    #[test]
    fn enormous_retry_after_exceeds_the_overall_timeout() {
        let factory = ScriptedConnectionFactory::new()
            .respond(ScriptedResponse::new(503).header("Retry-After", "18446744073709551615"))
            .respond(ScriptedResponse::ok("{}"));
        let mut command = Command::get("/items").overall_timeout(Duration::from_secs(1));

        let result = command.execute(&factory, URL, &ExecutionSettings::default());

        assert!(matches!(result, NetResult::Error(Error::DeadlineExceeded { .. })));
        assert_eq!(factory.request_count(), 1);
    }

    struct RecordingBackoff {
        seen: Arc<Mutex<Vec<Option<String>>>>,
    }

    impl BackoffStrategy for RecordingBackoff {
        fn initial_delay(&mut self) -> Duration {
            Duration::from_millis(1)
        }

        fn next_delay(&mut self, _current: Duration, retry_after: Option<&str>) -> Duration {
            self.seen
                .lock()
                .expect("lock seen")
                .push(retry_after.map(str::to_owned));
            Duration::from_millis(1)
        }
    }

    #[test]
    fn retry_after_date_is_resolved_against_the_command_clock() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let retry_at = httpdate::fmt_http_date(now + Duration::from_secs(2));
        let factory = ScriptedConnectionFactory::new()
            .respond(ScriptedResponse::new(503).header("Retry-After", &retry_at))
            .respond(ScriptedResponse::ok("{}"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut command = Command::get("/items")
            .backoff(RecordingBackoff { seen: Arc::clone(&seen) })
            .clock(ManualClock::starting_at(now));

        let result = command.execute(&factory, URL, &ExecutionSettings::default());

        assert!(matches!(result, NetResult::Success(_)), "unexpected result: {result:?}");
        assert_eq!(factory.request_count(), 2);
        assert_eq!(*seen.lock().expect("lock seen"), vec![Some("2".to_owned())]);
    }

    #[test]
    fn patch_is_tunnelled_through_post() {
        let factory = ScriptedConnectionFactory::new().respond(ScriptedResponse::ok("{}"));
        let mut command = Command::patch("/items/1", r#"{"name":"x"}"#);

        let _ = command.execute(&factory, URL, &ExecutionSettings::default());

        let captured = &factory.requests()[0];
        assert_eq!(captured.method, Method::POST);
        assert_eq!(captured.header("X-HTTP-Method-Override"), Some("PATCH"));
        assert_eq!(captured.body_text(), r#"{"name":"x"}"#);
    }

    #[test]
    fn default_headers_and_timeouts_are_applied() {
        let factory = ScriptedConnectionFactory::new().respond(ScriptedResponse::ok("{}"));
        let settings = ExecutionSettings {
            connect_timeout: Duration::from_secs(2),
            ..ExecutionSettings::default()
        };
        let mut command = Command::get("/items")
            .header("X-Trace", "t-1")
            .read_timeout(Duration::from_secs(7));

        let _ = command.execute(&factory, URL, &settings);

        let captured = &factory.requests()[0];
        assert_eq!(captured.header("accept"), Some("application/json"));
        assert_eq!(captured.header("accept-encoding"), Some("gzip"));
        assert_eq!(captured.header("x-trace"), Some("t-1"));
        assert_eq!(captured.timeouts.connect, Duration::from_secs(2));
        assert_eq!(captured.timeouts.read, Duration::from_secs(7));
    }

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
        requests: AtomicUsize,
    }

    impl Interceptor for Recording {
        fn on_request(
            &self,
            context: &RequestContext,
            _connection: &mut dyn Connection,
        ) -> crate::Result<()> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.events
                .lock()
                .expect("events lock")
                .push(format!("request#{}", context.attempt()));
            Ok(())
        }

        fn on_response_headers(&self, _context: &RequestContext, status: u16, _connection: &dyn Connection) {
            self.events.lock().expect("events lock").push(format!("status {status}"));
        }

        fn on_success(&self, _context: &RequestContext, body: &str) {
            self.events.lock().expect("events lock").push(format!("success {body}"));
        }

        fn on_error(&self, _context: &RequestContext, status: u16, _body: &str) {
            self.events.lock().expect("events lock").push(format!("error {status}"));
        }
    }

    #[test]
    fn interceptors_see_every_attempt() {
        let recording = Arc::new(Recording::default());
        let factory = ScriptedConnectionFactory::new()
            .respond(ScriptedResponse::new(503))
            .respond(ScriptedResponse::ok("done"));
        let mut command = fast(Command::get("/items")).interceptor_arc(recording.clone());

        let _ = command.execute(&factory, URL, &ExecutionSettings::default());

        assert_eq!(recording.requests.load(Ordering::SeqCst), 2);
        assert_eq!(
            *recording.events.lock().expect("events lock"),
            vec!["request#1", "status 503", "request#2", "status 200", "success done"]
        );
    }

    #[test]
    fn terminal_status_reaches_on_error() {
        let recording = Arc::new(Recording::default());
        let factory = ScriptedConnectionFactory::new().respond(ScriptedResponse::new(404));
        let mut command = Command::get("/items").interceptor_arc(recording.clone());

        let result = command.execute(&factory, URL, &ExecutionSettings::default());

        assert_eq!(result.status_code(), 404);
        assert_eq!(
            *recording.events.lock().expect("events lock"),
            vec!["request#1", "status 404", "error 404"]
        );
    }

    #[test]
    fn json_value_serializes_body() {
        #[derive(serde::Serialize)]
        struct Item {
            name: &'static str,
        }

        let factory = ScriptedConnectionFactory::new().respond(ScriptedResponse::ok("{}"));
        let mut command = Command::new(Method::POST, "/items")
            .json_value(&Item { name: "pen" })
            .expect("serialize item");
        assert_eq!(command.estimated_payload_bytes(), 14);

        let _ = command.execute(&factory, URL, &ExecutionSettings::default());
        assert_eq!(factory.requests()[0].body_text(), r#"{"name":"pen"}"#);
    }
}
