use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use rand::Rng;

use crate::error::Error;

const MAX_ERROR_BODY_LEN: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn redact_uri_for_logs(uri_text: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(uri_text) else {
        return uri_text.split('?').next().unwrap_or(uri_text).to_owned();
    };

    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let relative = path.trim_start_matches('/');
    match (base.is_empty(), relative.is_empty()) {
        (true, true) => String::new(),
        (true, false) => relative.to_owned(),
        (false, true) => base.to_owned(),
        (false, false) => format!("{base}/{relative}"),
    }
}

fn is_absolute_http(path: &str) -> bool {
    let lowered = path.get(..8).unwrap_or(path).to_ascii_lowercase();
    lowered.starts_with("http://") || lowered.starts_with("https://")
}

/// Builds the full target URL of a command: base URL, relative path and the
/// form-encoded query parameters.
pub(crate) fn build_url(
    base_url: &str,
    path: &str,
    query: &HashMap<String, String>,
) -> Result<String, Error> {
    let joined = if is_absolute_http(path) {
        path.to_owned()
    } else {
        join_base_path(base_url, path)
    };
    let url_text = append_query_pairs(&joined, query);
    match url::Url::parse(&url_text) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(url_text),
        _ => Err(Error::InvalidUri { uri: url_text }),
    }
}

pub(crate) fn append_query_pairs(path: &str, query: &HashMap<String, String>) -> String {
    if query.is_empty() {
        return path.to_owned();
    }

    let (without_fragment, fragment) = match path.split_once('#') {
        Some((left, right)) => (left, Some(right)),
        None => (path, None),
    };
    let (base, existing_query) = match without_fragment.split_once('?') {
        Some((left, right)) => (left, Some(right)),
        None => (without_fragment, None),
    };

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    if let Some(existing_query) = existing_query {
        for (name, value) in url::form_urlencoded::parse(existing_query.as_bytes()) {
            serializer.append_pair(&name, &value);
        }
    }
    for (name, value) in query {
        serializer.append_pair(name, value);
    }
    let query = serializer.finish();

    let mut merged = format!("{base}?{query}");
    if let Some(fragment) = fragment {
        merged.push('#');
        merged.push_str(fragment);
    }
    merged
}

/// Parses a `Retry-After` value given either as delta seconds or as an
/// HTTP-date (IMF-fixdate, RFC 850 or asctime). Dates in the past yield zero.
pub fn parse_retry_after(raw_value: &str, now: SystemTime) -> Option<Duration> {
    let raw_value = raw_value.trim();
    if raw_value.is_empty() {
        return None;
    }
    if let Ok(seconds) = raw_value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = httpdate::parse_http_date(raw_value).ok()?;
    match date.duration_since(now) {
        Ok(duration) => Some(duration),
        Err(_) => Some(Duration::ZERO),
    }
}

/// Rewrites an HTTP-date `Retry-After` as delta seconds from `now`, rounded
/// up. Delta seconds and unparseable values pass through unchanged.
pub(crate) fn retry_after_seconds(raw_value: &str, now: SystemTime) -> String {
    let trimmed = raw_value.trim();
    if trimmed.parse::<u64>().is_ok() {
        return trimmed.to_owned();
    }
    match httpdate::parse_http_date(trimmed) {
        Ok(date) => {
            let wait = date.duration_since(now).unwrap_or(Duration::ZERO);
            let seconds = wait.as_secs().saturating_add(u64::from(wait.subsec_nanos() > 0));
            seconds.to_string()
        }
        Err(_) => raw_value.to_owned(),
    }
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}

/// Random lowercase hex token, used for multipart boundaries and idempotency keys.
pub(crate) fn random_token(bytes: usize) -> String {
    let mut rng = rand::rng();
    let mut token = String::with_capacity(bytes * 2);
    for _ in 0..bytes {
        let byte: u8 = rng.random();
        token.push_str(&format!("{byte:02x}"));
    }
    token
}
