//! Pluggable pieces a command consults while it executes.
//!
//! Retry policies and backoff strategies are stateful and owned by a single
//! command. Everything else is stateless and shared behind `Arc`.

pub mod backoff;
pub mod body;
pub mod request;
pub mod response;
pub mod retry;

pub use backoff::{
    BackoffStrategy, BinaryBackoff, DeadlineAwareBackoff, DecorrelatedJitterBackoff,
    EqualJitterBackoff, ExponentialBackoff, FibonacciBackoff, FixedBackoff, FullJitterBackoff,
    HeaderFirstBackoff, LoadProbe, QueueAwareBackoff, retry_after_delay, retry_after_delay_at,
};
pub use body::{
    BodyWriter, BytesBodyWriter, JsonBodyWriter, MultipartBodyWriter, MultipartFile,
    NoBodyWriter, multipart_boundary,
};
pub use request::{
    AuthRequestConfigurator, CompositeRequestConfigurator, DefaultMethodStrategy,
    DefaultRequestConfigurator, IdempotencyKeyConfigurator, MethodStrategy,
    PatchOverrideMethodStrategy, RequestConfigurator,
};
pub use response::{DefaultErrorHandler, DefaultResponseReader, ErrorHandler, ResponseReader};
pub use retry::{
    AdaptiveErrorRateRetryPolicy, AuthAwareRetryPolicy, BreakerState,
    CacheFriendlyGetRetryPolicy, CircuitBreakerRetryPolicy, CombinedRetryPolicy,
    DeadlineRetryPolicy, ErrorCategoryRetryPolicy, IdempotencyKeyRetryPolicy, NeverRetry,
    PayloadSensitiveRetryPolicy, RateLimitAwareRetryPolicy, RetryPolicy, SharedRetryPolicy,
    StatusWhitelistRetryPolicy,
};
