use std::fmt;

use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::parser::ResponseParser;
use crate::result::NetResult;

/// Target type of a request. Raw targets receive the body text as-is, parsed
/// targets go through the dispatcher's [`ResponseParser`].
pub struct ResponseType<T> {
    passthrough: Option<fn(String) -> T>,
}

impl<T> Clone for ResponseType<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ResponseType<T> {}

impl<T> fmt::Debug for ResponseType<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseType")
            .field("raw", &self.is_raw())
            .field("target", &std::any::type_name::<T>())
            .finish()
    }
}

impl ResponseType<String> {
    pub const fn raw() -> Self {
        Self {
            passthrough: Some(std::convert::identity),
        }
    }
}

impl<T: DeserializeOwned> ResponseType<T> {
    pub const fn parsed() -> Self {
        Self { passthrough: None }
    }
}

impl<T> ResponseType<T> {
    pub const fn is_raw(&self) -> bool {
        self.passthrough.is_some()
    }
}

/// Converts raw command results into typed ones.
#[derive(Clone, Debug, Default)]
pub struct ResponseHandler<P> {
    parser: P,
}

impl<P: ResponseParser> ResponseHandler<P> {
    pub fn new(parser: P) -> Self {
        Self { parser }
    }

    pub fn parser(&self) -> &P {
        &self.parser
    }

    /// Errors pass through untouched. Raw targets always yield `Some(body)`;
    /// parsed targets yield `None` for an empty body.
    pub fn handle<T>(&self, raw: NetResult<String>, response_type: &ResponseType<T>) -> NetResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let body = match raw {
            NetResult::Success(body) => body,
            NetResult::Error(error) => return NetResult::Error(error),
        };
        if let Some(passthrough) = response_type.passthrough {
            return NetResult::Success(Some(passthrough(body)));
        }
        if body.is_empty() {
            return NetResult::Success(None);
        }
        match self.parser.parse::<T>(&body) {
            Ok(value) => NetResult::Success(Some(value)),
            Err(source) => {
                tracing::debug!(error = %source, "response body failed to parse");
                NetResult::Error(Error::Parse { source })
            }
        }
    }
}
