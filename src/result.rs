use crate::error::Error;

/// Outcome of a request at the transport boundary: either the payload or a
/// structured failure. Exactly one variant is ever present.
#[derive(Debug)]
#[must_use]
pub enum NetResult<T> {
    Success(T),
    Error(Error),
}

impl<T> NetResult<T> {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Success(data) => Some(data),
            Self::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Success(_) => None,
            Self::Error(error) => Some(error),
        }
    }

    /// `-1` for successes and for failures that did not come from a server response.
    pub fn status_code(&self) -> i32 {
        match self {
            Self::Success(_) => -1,
            Self::Error(error) => error.status_code(),
        }
    }

    pub fn map<U>(self, map: impl FnOnce(T) -> U) -> NetResult<U> {
        match self {
            Self::Success(data) => NetResult::Success(map(data)),
            Self::Error(error) => NetResult::Error(error),
        }
    }

    pub fn into_result(self) -> crate::Result<T> {
        match self {
            Self::Success(data) => Ok(data),
            Self::Error(error) => Err(error),
        }
    }
}

impl<T> From<crate::Result<T>> for NetResult<T> {
    fn from(result: crate::Result<T>) -> Self {
        match result {
            Ok(data) => Self::Success(data),
            Err(error) => Self::Error(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::NetResult;
    use crate::error::Error;

    #[test]
    fn error_variant_exposes_status_and_body() {
        let result: NetResult<String> = NetResult::Error(Error::HttpStatus {
            status: 503,
            method: Method::GET,
            uri: "http://api.test/health".to_owned(),
            body: "down".to_owned(),
        });
        assert!(result.is_error());
        assert_eq!(result.status_code(), 503);
        assert_eq!(result.error().map(Error::body).as_deref(), Some("down"));
    }

    #[test]
    fn map_only_touches_success() {
        let result = NetResult::Success(2).map(|value| value * 21);
        assert_eq!(result.data(), Some(&42));

        let failed: NetResult<i32> = NetResult::Error(Error::Cancelled);
        let mapped = failed.map(|value| value + 1);
        assert!(mapped.error().is_some_and(Error::is_cancelled));
    }
}
