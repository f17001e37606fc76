//! Bounded worker pool that executes commands and resolves their futures.

mod queue;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::command::{Command, CommandHandle, DEFAULT_MAX_RETRIES, ExecutionSettings};
use crate::connection::{ConnectionFactory, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT};
use crate::error::Error;
use crate::future::{CancellableFuture, Completer, DeliveryJob, DeliverySink, DeliveryThread, Outcome};
use crate::interceptor::Interceptor;
use crate::parser::{JsonResponseParser, ResponseParser};
use crate::response::{ResponseHandler, ResponseType};
use crate::result::NetResult;
use crate::strategy::LoadProbe;
use crate::util::{build_url, lock_unpoisoned, redact_uri_for_logs};

use self::queue::{BoundedQueue, OfferError};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "netq-worker";

/// How a finished command is handed to its caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The typed value; failures fail the future.
    Value,
    /// The full [`NetResult`]; only cancellation fails the future.
    Result,
}

type Resolve = Box<dyn FnOnce(NetResult<String>) -> DeliveryJob + Send>;

struct RequestTask {
    id: u64,
    base_url: String,
    command: Command,
    mode: DeliveryMode,
    resolve: Resolve,
}

struct Inner {
    queue: BoundedQueue<RequestTask>,
    registry: Mutex<HashMap<u64, CommandHandle>>,
    next_id: AtomicU64,
    factory: Arc<dyn ConnectionFactory>,
    sink: Arc<dyn DeliverySink>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    settings: ExecutionSettings,
}

impl Inner {
    fn finish(&self, id: u64, job: DeliveryJob) {
        self.sink.execute(job);
        lock_unpoisoned(&self.registry).remove(&id);
    }
}

/// Executes commands on a fixed pool of worker threads fed by one bounded
/// queue. Results are parsed on the worker and delivered through the
/// configured [`DeliverySink`].
pub struct Dispatcher<P = JsonResponseParser> {
    inner: Arc<Inner>,
    handler: Arc<ResponseHandler<P>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<P> fmt::Debug for Dispatcher<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &lock_unpoisoned(&self.workers).len())
            .field("queue_capacity", &self.inner.queue.capacity())
            .field("queued", &self.inner.queue.len())
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl Dispatcher<JsonResponseParser> {
    pub fn builder() -> DispatcherBuilder<JsonResponseParser> {
        DispatcherBuilder::new()
    }
}

impl<P: ResponseParser> Dispatcher<P> {
    /// Submits `command` against `base_url`. The future resolves with the
    /// parsed value (`None` for an empty body) or fails with the error.
    pub fn enqueue<T>(
        &self,
        base_url: &str,
        command: Command,
        response_type: ResponseType<T>,
    ) -> CancellableFuture<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let handler = Arc::clone(&self.handler);
        self.submit(base_url, command, DeliveryMode::Value, move |raw| {
            match handler.handle(raw, &response_type) {
                NetResult::Success(value) => Outcome::Value(value),
                NetResult::Error(Error::Cancelled) => Outcome::Cancelled,
                NetResult::Error(error) => Outcome::Failed(error),
            }
        })
    }

    /// Like [`enqueue`](Self::enqueue), but failures arrive as
    /// [`NetResult::Error`] values instead of failing the future.
    pub fn enqueue_result<T>(
        &self,
        base_url: &str,
        command: Command,
        response_type: ResponseType<T>,
    ) -> CancellableFuture<NetResult<Option<T>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let handler = Arc::clone(&self.handler);
        self.submit(base_url, command, DeliveryMode::Result, move |raw| {
            match handler.handle(raw, &response_type) {
                NetResult::Error(Error::Cancelled) => Outcome::Cancelled,
                handled => Outcome::Value(handled),
            }
        })
    }

    fn submit<V, F>(
        &self,
        base_url: &str,
        mut command: Command,
        mode: DeliveryMode,
        to_outcome: F,
    ) -> CancellableFuture<V>
    where
        V: Send + 'static,
        F: FnOnce(NetResult<String>) -> Outcome<V> + Send + 'static,
    {
        let inner = &self.inner;
        command.append_interceptors(&inner.interceptors);

        let future = CancellableFuture::new();
        let handle = command.handle();
        future.attach(handle.clone());

        let completer: Completer<V> = future.completer();
        let resolve: Resolve = Box::new(move |raw: NetResult<String>| -> DeliveryJob {
            let outcome = to_outcome(raw);
            Box::new(move || completer.resolve(outcome))
        });

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock_unpoisoned(&inner.registry).insert(id, handle);

        let task = RequestTask {
            id,
            base_url: base_url.to_owned(),
            command,
            mode,
            resolve,
        };
        match inner.queue.offer(task) {
            Ok(()) => {}
            Err(OfferError::Full(task)) => {
                tracing::warn!(
                    capacity = inner.queue.capacity(),
                    path = task.command.request().path(),
                    "request queue full, rejecting command"
                );
                let error = Error::CapacityExceeded {
                    capacity: inner.queue.capacity(),
                };
                inner.finish(task.id, (task.resolve)(NetResult::Error(error)));
            }
            Err(OfferError::Closed(task)) => {
                tracing::debug!("dispatcher closed, rejecting command");
                inner.finish(task.id, (task.resolve)(NetResult::Error(Error::DispatcherClosed)));
            }
        }
        future
    }
}

impl<P> Dispatcher<P> {
    /// Stops accepting work, lets queued commands finish and joins the
    /// workers.
    pub fn shutdown(&self) {
        tracing::info!(queued = self.inner.queue.len(), "dispatcher shutting down");
        self.inner.queue.close();
        self.join_workers();
    }

    /// Stops accepting work, cancels queued and running commands and joins
    /// the workers.
    pub fn shutdown_now(&self) {
        let drained = self.inner.queue.close_and_drain();
        tracing::info!(drained = drained.len(), "dispatcher shutting down now");
        for task in drained {
            task.command.cancel();
            self.inner
                .finish(task.id, (task.resolve)(NetResult::Error(Error::Cancelled)));
        }
        self.cancel_all();
        self.join_workers();
    }

    /// Cancels every command that has not reached a terminal state yet.
    /// Returns how many were newly cancelled.
    pub fn cancel_all(&self) -> usize {
        let handles: Vec<CommandHandle> = lock_unpoisoned(&self.inner.registry)
            .values()
            .cloned()
            .collect();
        handles.iter().filter(|handle| handle.cancel()).count()
    }

    /// Commands submitted but not yet delivered, queued ones included.
    pub fn active_count(&self) -> usize {
        lock_unpoisoned(&self.inner.registry).len()
    }

    pub fn queued_len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.inner.queue.capacity()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.queue.is_closed()
    }

    /// Queue fill ratio in `[0, 1]`, for [`QueueAwareBackoff`](crate::QueueAwareBackoff).
    /// Reports zero once the dispatcher is gone.
    pub fn load_probe(&self) -> Arc<dyn LoadProbe> {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move || {
            inner.upgrade().map_or(0.0, |inner| {
                inner.queue.len() as f64 / inner.queue.capacity() as f64
            })
        })
    }

    fn join_workers(&self) {
        let workers = std::mem::take(&mut *lock_unpoisoned(&self.workers));
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::error!("dispatcher worker panicked");
            }
        }
    }
}

impl<P> Drop for Dispatcher<P> {
    fn drop(&mut self) {
        self.inner.queue.close();
        let cancelled = self.cancel_all();
        if cancelled > 0 {
            tracing::debug!(cancelled, "dispatcher dropped with active commands");
        }
    }
}

fn worker_loop(inner: Arc<Inner>) {
    tracing::debug!("dispatcher worker started");
    while let Some(task) = inner.queue.take() {
        run_task(&inner, task);
    }
    tracing::debug!("dispatcher worker stopped");
}

fn run_task(inner: &Inner, task: RequestTask) {
    let RequestTask {
        id,
        base_url,
        mut command,
        mode,
        resolve,
    } = task;

    let raw = catch_unwind(AssertUnwindSafe(|| {
        let url = match build_url(&base_url, command.request().path(), command.request().query()) {
            Ok(url) => url,
            Err(error) => return NetResult::Error(error),
        };
        command.execute(inner.factory.as_ref(), &url, &inner.settings)
    }))
    .unwrap_or_else(|panic| {
        let message = panic_message(panic.as_ref());
        tracing::error!(
            uri = %redact_uri_for_logs(&base_url),
            message = %message,
            "command panicked on worker"
        );
        NetResult::Error(Error::Internal { message })
    });

    tracing::debug!(
        id,
        ?mode,
        success = raw.is_success(),
        status = raw.status_code(),
        "command finished"
    );

    let job = match catch_unwind(AssertUnwindSafe(|| resolve(raw))) {
        Ok(job) => job,
        Err(panic) => {
            tracing::error!(message = %panic_message(panic.as_ref()), "response handling panicked");
            // The completer went down with the panic; nothing left to deliver.
            Box::new(|| {})
        }
    };
    inner.finish(id, job);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_owned()
    }
}

/// Configures and starts a [`Dispatcher`].
pub struct DispatcherBuilder<P = JsonResponseParser> {
    parser: P,
    factory: Option<Arc<dyn ConnectionFactory>>,
    workers: usize,
    queue_capacity: usize,
    interceptors: Vec<Arc<dyn Interceptor>>,
    connect_timeout: Duration,
    read_timeout: Duration,
    overall_timeout: Option<Duration>,
    max_retries: usize,
    sink: Option<Arc<dyn DeliverySink>>,
    thread_name_prefix: String,
}

impl<P: fmt::Debug> fmt::Debug for DispatcherBuilder<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("parser", &self.parser)
            .field("workers", &self.workers)
            .field("queue_capacity", &self.queue_capacity)
            .field("interceptors", &self.interceptors.len())
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("overall_timeout", &self.overall_timeout)
            .field("max_retries", &self.max_retries)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .finish()
    }
}

impl Default for DispatcherBuilder<JsonResponseParser> {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherBuilder<JsonResponseParser> {
    pub fn new() -> Self {
        Self {
            parser: JsonResponseParser,
            factory: None,
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            interceptors: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            overall_timeout: None,
            max_retries: DEFAULT_MAX_RETRIES,
            sink: None,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_owned(),
        }
    }
}

impl<P: ResponseParser> DispatcherBuilder<P> {
    pub fn parser<Q: ResponseParser>(self, parser: Q) -> DispatcherBuilder<Q> {
        DispatcherBuilder {
            parser,
            factory: self.factory,
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            interceptors: self.interceptors,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            overall_timeout: self.overall_timeout,
            max_retries: self.max_retries,
            sink: self.sink,
            thread_name_prefix: self.thread_name_prefix,
        }
    }

    pub fn connection_factory_arc(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn connection_factory<F>(self, factory: F) -> Self
    where
        F: ConnectionFactory + 'static,
    {
        self.connection_factory_arc(Arc::new(factory))
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity.max(1);
        self
    }

    pub fn interceptor_arc(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn interceptor<I>(self, interceptor: I) -> Self
    where
        I: Interceptor + 'static,
    {
        self.interceptor_arc(Arc::new(interceptor))
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn overall_timeout(mut self, overall_timeout: Duration) -> Self {
        self.overall_timeout = Some(overall_timeout.max(Duration::from_millis(1)));
        self
    }

    /// Retries beyond the first attempt for commands without an override.
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn delivery_sink_arc(mut self, sink: Arc<dyn DeliverySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn delivery_sink<S>(self, sink: S) -> Self
    where
        S: DeliverySink + 'static,
    {
        self.delivery_sink_arc(Arc::new(sink))
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn build(self) -> crate::Result<Dispatcher<P>> {
        let factory = match self.factory {
            Some(factory) => factory,
            None => default_connection_factory()?,
        };
        let sink: Arc<dyn DeliverySink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(
                DeliveryThread::named(format!("{}-delivery", self.thread_name_prefix))
                    .map_err(|source| spawn_error("delivery", &source))?,
            ),
        };

        let inner = Arc::new(Inner {
            queue: BoundedQueue::new(self.queue_capacity),
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            factory,
            sink,
            interceptors: self.interceptors,
            settings: ExecutionSettings {
                connect_timeout: self.connect_timeout,
                read_timeout: self.read_timeout,
                overall_timeout: self.overall_timeout,
                max_retries: self.max_retries,
            },
        });

        let mut workers = Vec::with_capacity(self.workers);
        for index in 0..self.workers {
            let worker_inner = Arc::clone(&inner);
            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", self.thread_name_prefix))
                .spawn(move || worker_loop(worker_inner));
            match spawned {
                Ok(worker) => workers.push(worker),
                Err(source) => {
                    inner.queue.close();
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(spawn_error("worker", &source));
                }
            }
        }

        tracing::debug!(
            workers = self.workers,
            queue_capacity = self.queue_capacity,
            "dispatcher started"
        );
        Ok(Dispatcher {
            inner,
            handler: Arc::new(ResponseHandler::new(self.parser)),
            workers: Mutex::new(workers),
        })
    }
}

fn spawn_error(role: &str, source: &std::io::Error) -> Error {
    Error::Internal {
        message: format!("failed to spawn {role} thread: {source}"),
    }
}

#[cfg(feature = "transport-ureq")]
fn default_connection_factory() -> crate::Result<Arc<dyn ConnectionFactory>> {
    Ok(Arc::new(crate::connection::UreqConnectionFactory::new()))
}

#[cfg(not(feature = "transport-ureq"))]
fn default_connection_factory() -> crate::Result<Arc<dyn ConnectionFactory>> {
    Err(Error::Internal {
        message: "no connection factory configured and the ureq transport is disabled"
            .to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Dispatcher;
    use crate::command::Command;
    use crate::connection::{ScriptedConnectionFactory, ScriptedResponse};
    use crate::error::Error;
    use crate::future::{InlineDelivery, Outcome};
    use crate::response::ResponseType;
    use crate::strategy::LoadProbe;

    #[test]
    fn builder_clamps_sizes() {
        let dispatcher = Dispatcher::builder()
            .connection_factory(ScriptedConnectionFactory::new())
            .workers(0)
            .queue_capacity(0)
            .delivery_sink(InlineDelivery)
            .build()
            .expect("build dispatcher");
        assert_eq!(dispatcher.queue_capacity(), 1);
        dispatcher.shutdown();
    }

    #[test]
    fn rejected_after_shutdown() {
        let dispatcher = Dispatcher::builder()
            .connection_factory(ScriptedConnectionFactory::new())
            .delivery_sink(InlineDelivery)
            .build()
            .expect("build dispatcher");
        dispatcher.shutdown();
        assert!(dispatcher.is_shutdown());

        let future = dispatcher.enqueue("http://api.test", Command::get("/x"), ResponseType::raw());
        match future.wait_outcome() {
            Outcome::Failed(Error::DispatcherClosed) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(dispatcher.active_count(), 0);
    }

    #[test]
    fn invalid_base_url_fails_the_future() {
        let factory = ScriptedConnectionFactory::new().fallback(ScriptedResponse::ok("{}"));
        let dispatcher = Dispatcher::builder()
            .connection_factory(factory.clone())
            .delivery_sink(InlineDelivery)
            .build()
            .expect("build dispatcher");

        let future = dispatcher.enqueue("not a url", Command::get("/x"), ResponseType::raw());
        match future.wait_timeout(Duration::from_secs(5)) {
            Ok(Outcome::Failed(Error::InvalidUri { .. })) => {}
            Ok(other) => panic!("unexpected outcome: {other:?}"),
            Err(_) => panic!("future did not resolve"),
        }
        assert_eq!(factory.connections_opened(), 0);
        dispatcher.shutdown();
    }

    #[test]
    fn load_probe_tracks_queue_fill() {
        let dispatcher = Dispatcher::builder()
            .connection_factory(ScriptedConnectionFactory::new())
            .delivery_sink(InlineDelivery)
            .build()
            .expect("build dispatcher");
        let probe = dispatcher.load_probe();
        assert_eq!(probe.load_factor(), 0.0);
        drop(dispatcher);
        assert_eq!(probe.load_factor(), 0.0);
    }
}
