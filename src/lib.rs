//! `netq` is a cancellation-aware HTTP request engine for API SDKs.
//!
//! Commands describe one request plus the strategies that drive it (retry
//! policy, backoff, request configurator, body writer, response reader,
//! error handler, interceptors). A [`Dispatcher`] runs them on a bounded
//! worker pool, parses the body on the worker and resolves a
//! [`CancellableFuture`] through a single delivery thread.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use netq::prelude::{ApiClient, Command, Dispatcher, ExponentialBackoff, ResponseType};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Dispatcher::builder()
//!         .workers(4)
//!         .queue_capacity(128)
//!         .connect_timeout(Duration::from_secs(3))
//!         .build()?;
//!     let api = ApiClient::new(Arc::new(dispatcher), "https://api.example.com");
//!
//!     let item = api
//!         .execute(
//!             Command::get("/v1/items/42")
//!                 .query("expand", "owner")
//!                 .backoff(ExponentialBackoff::new(
//!                     Duration::from_millis(100),
//!                     Duration::from_secs(2),
//!                 )),
//!             ResponseType::<Item>::parsed(),
//!         )
//!         .wait()?;
//!
//!     println!("item={item:?}");
//!     Ok(())
//! }
//! ```
//!
//! # Defaults
//!
//! - Idempotent methods (GET, PUT, DELETE) retry 408, 429, 500, 502, 503 and
//!   504 plus transient I/O faults, up to three times.
//! - Backoff honours `Retry-After` and otherwise uses full jitter between
//!   300ms and 8s.
//! - PATCH travels as POST with `X-HTTP-Method-Override: PATCH`.

pub mod api;
pub mod clock;
pub mod command;
pub mod connection;
mod content_encoding;
pub mod dispatcher;
pub mod error;
pub mod future;
pub mod interceptor;
pub mod parser;
pub mod response;
pub mod result;
pub mod strategy;
mod util;

pub use crate::api::ApiClient;
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::command::{Command, CommandHandle, ExecutionSettings, RequestSpec};
pub use crate::connection::{
    Connection, ConnectionFactory, ScriptedConnectionFactory, ScriptedResponse, Timeouts,
};
#[cfg(feature = "transport-ureq")]
pub use crate::connection::UreqConnectionFactory;
pub use crate::dispatcher::{DeliveryMode, Dispatcher, DispatcherBuilder};
pub use crate::error::{Error, ErrorCode, ParseError, TimeoutPhase, TransportErrorKind};
pub use crate::future::{
    CancelHandle, Cancelable, CancellableFuture, Completer, DeliverySink, DeliveryThread,
    InlineDelivery, Outcome,
};
pub use crate::interceptor::{Interceptor, LoggingInterceptor, RequestContext};
pub use crate::parser::{JsonResponseParser, PassthroughResponseParser, ResponseParser};
pub use crate::response::{ResponseHandler, ResponseType};
pub use crate::result::NetResult;
pub use crate::strategy::{
    AdaptiveErrorRateRetryPolicy, AuthAwareRetryPolicy, AuthRequestConfigurator,
    BackoffStrategy, BinaryBackoff, BodyWriter, BreakerState, BytesBodyWriter,
    CacheFriendlyGetRetryPolicy, CircuitBreakerRetryPolicy, CombinedRetryPolicy,
    CompositeRequestConfigurator, DeadlineAwareBackoff, DeadlineRetryPolicy,
    DecorrelatedJitterBackoff, DefaultErrorHandler, DefaultMethodStrategy,
    DefaultRequestConfigurator, DefaultResponseReader, EqualJitterBackoff,
    ErrorCategoryRetryPolicy, ErrorHandler, ExponentialBackoff, FibonacciBackoff, FixedBackoff,
    FullJitterBackoff, HeaderFirstBackoff, IdempotencyKeyConfigurator, IdempotencyKeyRetryPolicy,
    JsonBodyWriter, LoadProbe, MethodStrategy, MultipartBodyWriter, MultipartFile, NeverRetry,
    NoBodyWriter, PatchOverrideMethodStrategy, PayloadSensitiveRetryPolicy, QueueAwareBackoff,
    RateLimitAwareRetryPolicy, RequestConfigurator, ResponseReader, RetryPolicy,
    SharedRetryPolicy, StatusWhitelistRetryPolicy, multipart_boundary, retry_after_delay,
    retry_after_delay_at,
};
pub use crate::util::parse_retry_after;

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        ApiClient, BackoffStrategy, Cancelable, CancellableFuture, Command, CommandHandle,
        Dispatcher, DispatcherBuilder, Error, ErrorCode, ExponentialBackoff, FullJitterBackoff,
        HeaderFirstBackoff, Interceptor, MultipartBodyWriter, MultipartFile, NetResult, Outcome,
        RequestConfigurator, ResponseType, RetryPolicy, StatusWhitelistRetryPolicy,
    };
}
