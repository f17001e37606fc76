use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::command::Command;
use crate::dispatcher::Dispatcher;
use crate::future::CancellableFuture;
use crate::parser::{JsonResponseParser, ResponseParser};
use crate::response::ResponseType;
use crate::result::NetResult;
use crate::strategy::{MultipartBodyWriter, RequestConfigurator};

/// A base URL bound to a dispatcher, with one-call shortcuts per method.
///
/// Every shortcut exists twice: the plain form resolves with the value and
/// fails the future on error, the `_result` form resolves with a
/// [`NetResult`].
pub struct ApiClient<P = JsonResponseParser> {
    dispatcher: Arc<Dispatcher<P>>,
    base_url: String,
    request_configurator: Option<Arc<dyn RequestConfigurator>>,
}

impl<P> Clone for ApiClient<P> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            base_url: self.base_url.clone(),
            request_configurator: self.request_configurator.clone(),
        }
    }
}

impl<P> fmt::Debug for ApiClient<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("request_configurator", &self.request_configurator.is_some())
            .finish()
    }
}

impl<P: ResponseParser> ApiClient<P> {
    pub fn new(dispatcher: Arc<Dispatcher<P>>, base_url: impl Into<String>) -> Self {
        Self {
            dispatcher,
            base_url: base_url.into(),
            request_configurator: None,
        }
    }

    /// Configurator applied to every command that does not bring its own.
    pub fn request_configurator<C>(self, configurator: C) -> Self
    where
        C: RequestConfigurator + 'static,
    {
        self.request_configurator_arc(Arc::new(configurator))
    }

    pub fn request_configurator_arc(mut self, configurator: Arc<dyn RequestConfigurator>) -> Self {
        self.request_configurator = Some(configurator);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<P>> {
        &self.dispatcher
    }

    pub fn execute<T>(&self, command: Command, response_type: ResponseType<T>) -> CancellableFuture<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let command = self.prepare(command);
        self.dispatcher.enqueue(&self.base_url, command, response_type)
    }

    pub fn execute_result<T>(
        &self,
        command: Command,
        response_type: ResponseType<T>,
    ) -> CancellableFuture<NetResult<Option<T>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let command = self.prepare(command);
        self.dispatcher
            .enqueue_result(&self.base_url, command, response_type)
    }

    pub fn get<T>(&self, path: &str, response_type: ResponseType<T>) -> CancellableFuture<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.execute(Command::get(path), response_type)
    }

    pub fn get_result<T>(
        &self,
        path: &str,
        response_type: ResponseType<T>,
    ) -> CancellableFuture<NetResult<Option<T>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.execute_result(Command::get(path), response_type)
    }

    pub fn post<T>(
        &self,
        path: &str,
        json: impl Into<String>,
        response_type: ResponseType<T>,
    ) -> CancellableFuture<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.execute(Command::post(path, json), response_type)
    }

    pub fn post_result<T>(
        &self,
        path: &str,
        json: impl Into<String>,
        response_type: ResponseType<T>,
    ) -> CancellableFuture<NetResult<Option<T>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.execute_result(Command::post(path, json), response_type)
    }

    pub fn put<T>(
        &self,
        path: &str,
        json: impl Into<String>,
        response_type: ResponseType<T>,
    ) -> CancellableFuture<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.execute(Command::put(path, json), response_type)
    }

    pub fn put_result<T>(
        &self,
        path: &str,
        json: impl Into<String>,
        response_type: ResponseType<T>,
    ) -> CancellableFuture<NetResult<Option<T>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.execute_result(Command::put(path, json), response_type)
    }

    pub fn patch<T>(
        &self,
        path: &str,
        json: impl Into<String>,
        response_type: ResponseType<T>,
    ) -> CancellableFuture<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.execute(Command::patch(path, json), response_type)
    }

    pub fn patch_result<T>(
        &self,
        path: &str,
        json: impl Into<String>,
        response_type: ResponseType<T>,
    ) -> CancellableFuture<NetResult<Option<T>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.execute_result(Command::patch(path, json), response_type)
    }

    pub fn delete<T>(&self, path: &str, response_type: ResponseType<T>) -> CancellableFuture<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.execute(Command::delete(path), response_type)
    }

    pub fn delete_result<T>(
        &self,
        path: &str,
        response_type: ResponseType<T>,
    ) -> CancellableFuture<NetResult<Option<T>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.execute_result(Command::delete(path), response_type)
    }

    pub fn upload<T>(
        &self,
        path: &str,
        form: MultipartBodyWriter,
        response_type: ResponseType<T>,
    ) -> CancellableFuture<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.execute(Command::multipart(path, form), response_type)
    }

    pub fn upload_result<T>(
        &self,
        path: &str,
        form: MultipartBodyWriter,
        response_type: ResponseType<T>,
    ) -> CancellableFuture<NetResult<Option<T>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.execute_result(Command::multipart(path, form), response_type)
    }

    fn prepare(&self, mut command: Command) -> Command {
        if let Some(configurator) = &self.request_configurator {
            command.default_request_configurator(configurator);
        }
        command
    }
}
