use std::sync::Arc;

use http::Method;

use crate::command::RequestSpec;
use crate::connection::Connection;
use crate::util::random_token;

pub const METHOD_OVERRIDE_HEADER: &str = "X-HTTP-Method-Override";
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
const DEFAULT_AUTH_USER_AGENT: &str = concat!("netq/", env!("CARGO_PKG_VERSION"));

/// Puts the command's method on the connection, possibly translated.
pub trait MethodStrategy: Send + Sync {
    fn apply(&self, connection: &mut dyn Connection, method: &Method) -> crate::Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultMethodStrategy;

impl MethodStrategy for DefaultMethodStrategy {
    fn apply(&self, connection: &mut dyn Connection, method: &Method) -> crate::Result<()> {
        connection.set_method(method.clone());
        Ok(())
    }
}

/// Sends `PATCH` as `POST` plus `X-HTTP-Method-Override: PATCH`, for servers
/// and proxies that reject the native verb. Other methods pass through.
#[derive(Clone, Copy, Debug, Default)]
pub struct PatchOverrideMethodStrategy;

impl MethodStrategy for PatchOverrideMethodStrategy {
    fn apply(&self, connection: &mut dyn Connection, method: &Method) -> crate::Result<()> {
        if method == Method::PATCH {
            connection.set_method(Method::POST);
            connection.set_header(METHOD_OVERRIDE_HEADER, Method::PATCH.as_str())?;
        } else {
            connection.set_method(method.clone());
        }
        Ok(())
    }
}

/// Sets request headers before the interceptors and the body writer run.
/// Receives the command's request description mutably so derived headers
/// (an idempotency key, say) stay stable across retries.
pub trait RequestConfigurator: Send + Sync {
    fn configure(
        &self,
        connection: &mut dyn Connection,
        request: &mut RequestSpec,
    ) -> crate::Result<()>;
}

/// Content type, JSON `Accept`, gzip `Accept-Encoding`, then the command's
/// own headers, which win on conflict.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRequestConfigurator;

impl RequestConfigurator for DefaultRequestConfigurator {
    fn configure(
        &self,
        connection: &mut dyn Connection,
        request: &mut RequestSpec,
    ) -> crate::Result<()> {
        connection.set_header("Content-Type", request.content_type())?;
        connection.set_header("Accept", "application/json")?;
        connection.set_header("Accept-Encoding", "gzip")?;
        for (name, value) in request.headers() {
            connection.set_header(name, value)?;
        }
        Ok(())
    }
}

type TokenSource = dyn Fn() -> Option<String> + Send + Sync;

/// Adds a bearer token from a caller-supplied source and a `User-Agent`.
pub struct AuthRequestConfigurator {
    token: Arc<TokenSource>,
    user_agent: String,
}

impl AuthRequestConfigurator {
    pub fn new<F>(token: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        Self {
            token: Arc::new(token),
            user_agent: DEFAULT_AUTH_USER_AGENT.to_owned(),
        }
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

impl RequestConfigurator for AuthRequestConfigurator {
    fn configure(
        &self,
        connection: &mut dyn Connection,
        _request: &mut RequestSpec,
    ) -> crate::Result<()> {
        if let Some(token) = (self.token)()
            && !token.is_empty()
        {
            connection.set_header("Authorization", &format!("Bearer {token}"))?;
        }
        connection.set_header("User-Agent", &self.user_agent)
    }
}

/// Gives non-idempotent commands an `Idempotency-Key` unless they already
/// carry one. The key is stored on the command, so every retry repeats it.
#[derive(Clone, Copy, Debug)]
pub struct IdempotencyKeyConfigurator {
    enabled: bool,
}

impl IdempotencyKeyConfigurator {
    pub const fn new() -> Self {
        Self { enabled: true }
    }

    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

impl Default for IdempotencyKeyConfigurator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestConfigurator for IdempotencyKeyConfigurator {
    fn configure(
        &self,
        connection: &mut dyn Connection,
        request: &mut RequestSpec,
    ) -> crate::Result<()> {
        if !self.enabled || request.is_idempotent() {
            return Ok(());
        }
        let key = match request.header(IDEMPOTENCY_KEY_HEADER) {
            Some(existing) => existing.to_owned(),
            None => {
                let key = random_token(16);
                request.set_header(IDEMPOTENCY_KEY_HEADER, key.clone());
                key
            }
        };
        connection.set_header(IDEMPOTENCY_KEY_HEADER, &key)
    }
}

/// Runs several configurators in order.
#[derive(Clone, Default)]
pub struct CompositeRequestConfigurator {
    items: Vec<Arc<dyn RequestConfigurator>>,
}

impl CompositeRequestConfigurator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, configurator: impl RequestConfigurator + 'static) -> Self {
        self.items.push(Arc::new(configurator));
        self
    }

    pub fn with_arc(mut self, configurator: Arc<dyn RequestConfigurator>) -> Self {
        self.items.push(configurator);
        self
    }
}

impl RequestConfigurator for CompositeRequestConfigurator {
    fn configure(
        &self,
        connection: &mut dyn Connection,
        request: &mut RequestSpec,
    ) -> crate::Result<()> {
        for configurator in &self.items {
            configurator.configure(connection, request)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::{
        AuthRequestConfigurator, CompositeRequestConfigurator, DefaultRequestConfigurator,
        IdempotencyKeyConfigurator, MethodStrategy, PatchOverrideMethodStrategy,
        RequestConfigurator,
    };
    use crate::command::RequestSpec;
    use crate::connection::{ConnectionFactory, ScriptedConnectionFactory};

    #[test]
    fn patch_override_rewrites_only_patch() {
        let factory = ScriptedConnectionFactory::new();
        let mut connection = factory.create("http://api.test/").expect("create");
        PatchOverrideMethodStrategy
            .apply(connection.as_mut(), &Method::PATCH)
            .expect("apply");
        assert_eq!(connection.method(), Method::POST);
        assert_eq!(
            connection.request_header("x-http-method-override").as_deref(),
            Some("PATCH")
        );

        let mut delete = factory.create("http://api.test/").expect("create");
        PatchOverrideMethodStrategy
            .apply(delete.as_mut(), &Method::DELETE)
            .expect("apply");
        assert_eq!(delete.method(), Method::DELETE);
        assert_eq!(delete.request_header("x-http-method-override"), None);
    }

    #[test]
    fn default_configurator_lets_command_headers_win() {
        let factory = ScriptedConnectionFactory::new();
        let mut connection = factory.create("http://api.test/").expect("create");
        let mut request = RequestSpec::new(Method::GET, "/items");
        request.set_header("Accept", "text/csv");

        DefaultRequestConfigurator
            .configure(connection.as_mut(), &mut request)
            .expect("configure");
        assert_eq!(
            connection.request_header("content-type").as_deref(),
            Some("application/json; charset=utf-8")
        );
        assert_eq!(connection.request_header("accept").as_deref(), Some("text/csv"));
        assert_eq!(
            connection.request_header("accept-encoding").as_deref(),
            Some("gzip")
        );
    }

    #[test]
    fn idempotency_key_is_generated_once_for_unsafe_methods() {
        let factory = ScriptedConnectionFactory::new();
        let configurator = IdempotencyKeyConfigurator::new();
        let mut request = RequestSpec::new(Method::POST, "/orders");

        let mut first = factory.create("http://api.test/").expect("create");
        configurator
            .configure(first.as_mut(), &mut request)
            .expect("configure");
        let key = first
            .request_header("idempotency-key")
            .expect("key generated");

        let mut second = factory.create("http://api.test/").expect("create");
        configurator
            .configure(second.as_mut(), &mut request)
            .expect("configure");
        assert_eq!(second.request_header("idempotency-key"), Some(key));

        let mut get_request = RequestSpec::new(Method::GET, "/orders");
        let mut third = factory.create("http://api.test/").expect("create");
        configurator
            .configure(third.as_mut(), &mut get_request)
            .expect("configure");
        assert_eq!(third.request_header("idempotency-key"), None);
    }

    #[test]
    fn composite_runs_auth_after_defaults() {
        let factory = ScriptedConnectionFactory::new();
        let mut connection = factory.create("http://api.test/").expect("create");
        let mut request = RequestSpec::new(Method::GET, "/me");
        let composite = CompositeRequestConfigurator::new()
            .with(DefaultRequestConfigurator)
            .with(AuthRequestConfigurator::new(|| Some("t0k".to_owned())).user_agent("tests/1"));

        composite
            .configure(connection.as_mut(), &mut request)
            .expect("configure");
        assert_eq!(
            connection.request_header("authorization").as_deref(),
            Some("Bearer t0k")
        );
        assert_eq!(
            connection.request_header("user-agent").as_deref(),
            Some("tests/1")
        );
        assert!(connection.request_header("accept").is_some());
    }
}
