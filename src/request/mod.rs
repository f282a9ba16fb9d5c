//! Request building and orchestration.
//!
//! A [`RequestBuilder`] collects method, URL, query parameters, headers,
//! body, timeouts and status expectations, then [`send`](RequestBuilder::send)
//! resolves a stream through the pool (retrying transient rejections on a
//! fresh session) and awaits the response under two independent timers.

use std::collections::{BTreeMap, HashSet};
use std::future::pending;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, COOKIE};
use http::{HeaderMap, Method, StatusCode};
use log::debug;
use serde::Serialize;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use url::Url;

use crate::pool::SessionPool;
use crate::response::Response;
use crate::session::SessionStream;
use crate::transport::{RequestHead, ResponseHead, TlsTrust};
use crate::types::{Cookie, ErrorKind, Origin, Result};

/// Stream-acquisition attempts per request.
const MAX_STREAM_ATTEMPTS: u32 = 5;
/// Backoff step between attempts; the n-th failed attempt waits n times
/// this before the next one.
const RETRY_BACKOFF_STEP: Duration = Duration::from_millis(100);
/// How much of an error response body ends up in the status error.
const STATUS_DETAIL_LIMIT: usize = 1000;

/// Builder for one outgoing request.
///
/// Created through the [`Client`](crate::Client) method shorthands.
#[derive(Debug)]
pub struct RequestBuilder {
    pool: SessionPool,
    method: Method,
    url: Result<Url>,
    query: BTreeMap<String, String>,
    headers: HeaderMap,
    body: Option<Bytes>,
    timeout: Option<Duration>,
    response_timeout: Option<Duration>,
    expected: HashSet<StatusCode>,
    trust: Option<TlsTrust>,
    deferred: Option<ErrorKind>,
}

impl RequestBuilder {
    pub(crate) fn new(
        pool: SessionPool,
        method: Method,
        url: &str,
        base_url: Option<&Url>,
        headers: HeaderMap,
        timeout: Option<Duration>,
        response_timeout: Option<Duration>,
        trust: Option<TlsTrust>,
    ) -> Self {
        let url = resolve_url(url, base_url);

        // query parameters already on the URL seed the map
        let mut query = BTreeMap::new();
        if let Ok(url) = &url {
            for (key, value) in url.query_pairs() {
                query.insert(key.into_owned(), value.into_owned());
            }
        }

        Self {
            pool,
            method,
            url,
            query,
            headers,
            body: None,
            timeout,
            response_timeout,
            expected: HashSet::new(),
            trust,
            deferred: None,
        }
    }

    /// Set one query parameter. Setting a key twice keeps the last value.
    #[must_use]
    pub fn query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Set multiple query parameters from any sequence of pairs.
    #[must_use]
    pub fn query<I, K, V>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in parameters {
            self.query.insert(key.into(), value.into());
        }
        self
    }

    /// Set a request header.
    #[must_use]
    pub fn header<K, V>(mut self, name: K, value: V) -> Self
    where
        HeaderName: TryFrom<K>,
        HeaderValue: TryFrom<V>,
    {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => {
                self.deferred
                    .get_or_insert(ErrorKind::InvalidHeader("invalid header name or value".into()));
            }
        }
        self
    }

    /// Shorthand for setting the `accept` header.
    #[must_use]
    pub fn accept(self, value: &str) -> Self {
        self.header(ACCEPT, value)
    }

    /// Shorthand for setting the `content-type` header.
    #[must_use]
    pub fn content_type(self, value: &str) -> Self {
        self.header(CONTENT_TYPE, value)
    }

    /// Append a cookie to the `cookie` header.
    #[must_use]
    pub fn cookie(mut self, name: &str, value: &str) -> Self {
        let pair = format!("{name}={value}");
        let merged = match self.headers.get(COOKIE).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{existing}; {pair}"),
            None => pair,
        };
        match HeaderValue::from_str(&merged) {
            Ok(value) => {
                self.headers.insert(COOKIE, value);
            }
            Err(err) => {
                self.deferred
                    .get_or_insert(ErrorKind::InvalidHeader(err.to_string()));
            }
        }
        self
    }

    /// Append several cookies to the `cookie` header.
    #[must_use]
    pub fn cookies(mut self, cookies: &[Cookie]) -> Self {
        for cookie in cookies {
            self = self.cookie(&cookie.name, &cookie.value);
        }
        self
    }

    /// Send `value` as a json body.
    #[must_use]
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => {
                self.body = Some(Bytes::from(body));
                self.content_type("application/json")
            }
            Err(err) => {
                self.deferred.get_or_insert(ErrorKind::Json(err));
                self
            }
        }
    }

    /// Send a raw request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Declare which status codes count as a valid response. Any status
    /// outside the set fails the request. No expectation accepts any
    /// status.
    #[must_use]
    pub fn expect<I>(mut self, status_codes: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        for code in status_codes {
            match StatusCode::from_u16(code) {
                Ok(status) => {
                    self.expected.insert(status);
                }
                Err(_) => {
                    self.deferred
                        .get_or_insert(ErrorKind::InvalidStatusCode(code));
                }
            }
        }
        self
    }

    /// Bound the whole exchange; the stream is aborted once the deadline
    /// passes.
    #[must_use]
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Bound the wait for response headers only.
    #[must_use]
    pub fn response_timeout(mut self, duration: Duration) -> Self {
        self.response_timeout = Some(duration);
        self
    }

    /// TLS trust anchors for this request's origin.
    #[must_use]
    pub fn trust(mut self, trust: TlsTrust) -> Self {
        self.trust = Some(trust);
        self
    }

    /// Send the request and await the response headers.
    ///
    /// # Errors
    ///
    /// See [`ErrorKind`]; every failure names the method and URL.
    pub async fn send(self) -> Result<Response> {
        let Self {
            pool,
            method,
            url,
            query,
            headers,
            body,
            timeout: total_timeout,
            response_timeout,
            expected,
            trust,
            deferred,
        } = self;

        if let Some(err) = deferred {
            return Err(err);
        }
        let url = url?;
        let origin = Origin::try_from(&url)?;

        let head = RequestHead {
            method: method.clone(),
            origin: origin.clone(),
            path_and_query: render_path(&url, &query),
            headers,
        };

        let mut stream = acquire_stream(&pool, &origin, trust.as_ref(), &head, &method, &url).await?;

        // both timers start when the stream begins sending
        let deadline = total_timeout.map(|t| Instant::now() + t);

        send_with_deadline(
            &mut stream,
            body.unwrap_or_default(),
            deadline,
            total_timeout,
            &method,
            &url,
        )
        .await?;

        let head = await_response_head(
            &mut stream,
            deadline,
            total_timeout,
            response_timeout,
            &method,
            &url,
        )
        .await?;

        debug!("received response for '{method} {url}'");
        let mut response = Response::new(method.clone(), url.clone(), head, stream, deadline, total_timeout);

        if !expected.is_empty() && !expected.contains(&response.status()) {
            return Err(unexpected_status(&mut response, &expected, method, url).await);
        }

        Ok(response)
    }
}

fn resolve_url(input: &str, base_url: Option<&Url>) -> Result<Url> {
    let parse = |input: &str| {
        Url::parse(input).map_err(|err| ErrorKind::ParseUrl(input.to_owned(), err))
    };

    if input.starts_with("http://") || input.starts_with("https://") {
        parse(input)
    } else if let Some(base) = base_url {
        base.join(input)
            .map_err(|err| ErrorKind::ParseUrl(input.to_owned(), err))
    } else {
        parse(input)
    }
}

/// Render the `:path` pseudo header from the URL path and the query map.
fn render_path(url: &Url, query: &BTreeMap<String, String>) -> String {
    if query.is_empty() {
        return url.path().to_owned();
    }

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in query {
        serializer.append_pair(key, value);
    }
    format!("{}?{}", url.path(), serializer.finish())
}

/// Resolve a stream via the pool, retrying transient rejections against a
/// fresh session with linear backoff.
async fn acquire_stream(
    pool: &SessionPool,
    origin: &Origin,
    trust: Option<&TlsTrust>,
    head: &RequestHead,
    method: &Method,
    url: &Url,
) -> Result<SessionStream> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let session = pool
            .get_session(origin, trust)
            .await
            .map_err(|err| request_error(method, url, err))?;

        match session.create_stream(head.clone()).await {
            Ok(stream) => return Ok(stream),
            Err(err) if err.is_retryable_stream() && attempt < MAX_STREAM_ATTEMPTS => {
                let backoff = RETRY_BACKOFF_STEP * attempt;
                debug!(
                    "{method} {url}: stream attempt {attempt} rejected ({err}), retrying in {}ms",
                    backoff.as_millis()
                );
                sleep(backoff).await;
            }
            Err(err) => return Err(request_error(method, url, err)),
        }
    }
}

async fn send_with_deadline(
    stream: &mut SessionStream,
    body: Bytes,
    deadline: Option<Instant>,
    total_timeout: Option<Duration>,
    method: &Method,
    url: &Url,
) -> Result<()> {
    let result = match deadline {
        Some(deadline) => {
            let outcome = timeout_at(deadline, stream.send_body(body)).await;
            match outcome {
                Ok(result) => result,
                Err(_) => {
                    stream.abort();
                    return Err(ErrorKind::RequestTimeout {
                        method: method.clone(),
                        url: url.clone(),
                        after: total_timeout.unwrap_or_default(),
                    });
                }
            }
        }
        None => stream.send_body(body).await,
    };

    result.map_err(|err| request_error(method, url, err))
}

enum Raced {
    Head(Result<ResponseHead>),
    TotalTimeout,
    ResponseTimeout,
}

async fn await_response_head(
    stream: &mut SessionStream,
    deadline: Option<Instant>,
    total_timeout: Option<Duration>,
    response_timeout: Option<Duration>,
    method: &Method,
    url: &Url,
) -> Result<ResponseHead> {
    let raced = tokio::select! {
        result = stream.response() => Raced::Head(result),
        () = sleep_until_or_pending(deadline) => Raced::TotalTimeout,
        () = sleep_or_pending(response_timeout) => Raced::ResponseTimeout,
    };

    match raced {
        Raced::Head(Ok(head)) => Ok(head),
        Raced::Head(Err(err)) => Err(request_error(method, url, err)),
        Raced::TotalTimeout => {
            stream.abort();
            Err(ErrorKind::RequestTimeout {
                method: method.clone(),
                url: url.clone(),
                after: total_timeout.unwrap_or_default(),
            })
        }
        Raced::ResponseTimeout => {
            stream.abort();
            Err(ErrorKind::ResponseTimeout {
                method: method.clone(),
                url: url.clone(),
                after: response_timeout.unwrap_or_default(),
            })
        }
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn sleep_or_pending(duration: Option<Duration>) {
    match duration {
        Some(duration) => sleep(duration).await,
        None => pending().await,
    }
}

/// Build the status-expectation error, pulling a bounded body excerpt for
/// 4xx/5xx responses.
async fn unexpected_status(
    response: &mut Response,
    expected: &HashSet<StatusCode>,
    method: Method,
    url: Url,
) -> ErrorKind {
    let status = response.status();

    let mut codes: Vec<u16> = expected.iter().map(StatusCode::as_u16).collect();
    codes.sort_unstable();
    let rendered: Vec<String> = codes.iter().map(ToString::to_string).collect();
    let expected = if rendered.len() == 1 {
        rendered[0].clone()
    } else {
        format!("one of {}", rendered.join(", "))
    };

    let detail = if status.is_client_error() || status.is_server_error() {
        match response.text().await {
            Ok(body) if !body.is_empty() => {
                let prefix: String = body.chars().take(STATUS_DETAIL_LIMIT).collect();
                format!(" ({prefix})")
            }
            _ => String::new(),
        }
    } else {
        String::new()
    };

    ErrorKind::UnexpectedStatus {
        method,
        url,
        status: status.as_u16(),
        expected,
        detail,
    }
}

fn request_error(method: &Method, url: &Url, source: ErrorKind) -> ErrorKind {
    ErrorKind::Request {
        method: method.clone(),
        url: url.clone(),
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_query_rendering_is_declaration_order_independent() {
        let url = Url::parse("http://example.com/search").unwrap();

        let mut from_pairs = BTreeMap::new();
        for (key, value) in [("b", "2"), ("a", "1"), ("c", "3")] {
            from_pairs.insert(key.to_owned(), value.to_owned());
        }

        let mut from_map = BTreeMap::new();
        for (key, value) in [("c", "3"), ("a", "1"), ("b", "2")] {
            from_map.insert(key.to_owned(), value.to_owned());
        }

        assert_eq!(render_path(&url, &from_pairs), render_path(&url, &from_map));
        assert_eq!(render_path(&url, &from_pairs), "/search?a=1&b=2&c=3");
    }

    #[test]
    fn test_query_last_write_wins() {
        let url = Url::parse("http://example.com/x").unwrap();
        let mut query = BTreeMap::new();
        query.insert("key".to_owned(), "old".to_owned());
        query.insert("key".to_owned(), "new".to_owned());

        assert_eq!(render_path(&url, &query), "/x?key=new");
    }

    #[test]
    fn test_query_values_are_encoded() {
        let url = Url::parse("http://example.com/x").unwrap();
        let mut query = BTreeMap::new();
        query.insert("key".to_owned(), "a value&more".to_owned());

        assert_eq!(render_path(&url, &query), "/x?key=a+value%26more");
    }

    #[test]
    fn test_path_without_query() {
        let url = Url::parse("http://example.com/plain").unwrap();
        assert_eq!(render_path(&url, &BTreeMap::new()), "/plain");
    }

    #[test]
    fn test_resolve_relative_url_against_base() {
        let base = Url::parse("http://api.example.com").unwrap();
        let url = resolve_url("/v1/things", Some(&base)).unwrap();
        assert_eq!(url.as_str(), "http://api.example.com/v1/things");
    }

    #[test]
    fn test_resolve_absolute_url_ignores_base() {
        let base = Url::parse("http://api.example.com").unwrap();
        let url = resolve_url("http://other.example.com/x", Some(&base)).unwrap();
        assert_eq!(url.host_str(), Some("other.example.com"));
    }
}
