//! The received side of one exchange.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use url::Url;

use crate::session::SessionStream;
use crate::transport::ResponseHead;
use crate::types::{Cookie, ErrorKind, Result};

/// A response with its headers received and its body readable on demand.
///
/// The body read is still bounded by the request's total deadline. The
/// session's concurrency slot is held until the body is drained or the
/// response is dropped.
pub struct Response {
    method: Method,
    url: Url,
    head: ResponseHead,
    stream: Option<SessionStream>,
    deadline: Option<Instant>,
    total_timeout: Option<Duration>,
    body: Option<Bytes>,
}

impl Response {
    pub(crate) fn new(
        method: Method,
        url: Url,
        head: ResponseHead,
        stream: SessionStream,
        deadline: Option<Instant>,
        total_timeout: Option<Duration>,
    ) -> Self {
        Self {
            method,
            url,
            head,
            stream: Some(stream),
            deadline,
            total_timeout,
            body: None,
        }
    }

    /// The response status code.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    /// The response headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// A response header as text, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The URL this response answers.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Drain and return the complete response body. Subsequent calls
    /// return the buffered bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::RequestTimeout`] if the request's total
    /// deadline passes while the body is still arriving, or the
    /// transport's stream error.
    pub async fn body(&mut self) -> Result<Bytes> {
        if let Some(body) = &self.body {
            return Ok(body.clone());
        }

        let Some(mut stream) = self.stream.take() else {
            return Ok(Bytes::new());
        };

        let result = match self.deadline {
            Some(deadline) => {
                let outcome = timeout_at(deadline, stream.body()).await;
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        stream.abort();
                        return Err(ErrorKind::RequestTimeout {
                            method: self.method.clone(),
                            url: self.url.clone(),
                            after: self.total_timeout.unwrap_or_default(),
                        });
                    }
                }
            }
            None => stream.body().await,
        };

        let body = result.map_err(|err| ErrorKind::Request {
            method: self.method.clone(),
            url: self.url.clone(),
            source: Box::new(err),
        })?;

        self.body = Some(body.clone());
        Ok(body)
    }

    /// The response body as text (lossily decoded).
    ///
    /// # Errors
    ///
    /// Same as [`Response::body`].
    pub async fn text(&mut self) -> Result<String> {
        let body = self.body().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Deserialize the response body as json.
    ///
    /// # Errors
    ///
    /// Same as [`Response::body`], plus [`ErrorKind::Json`] when the body
    /// is not valid json for `T`.
    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let body = self.body().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Cookies from every `set-cookie` header of this response.
    #[must_use]
    pub fn cookies(&self) -> Vec<Cookie> {
        self.head
            .headers
            .get_all(http::header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(Cookie::parse_list)
            .collect()
    }

    /// Whether the response set a cookie with the given name.
    #[must_use]
    pub fn has_cookie(&self, name: &str) -> bool {
        self.cookies().iter().any(|cookie| cookie.name == name)
    }

    /// The first cookie with the given name, if any.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<Cookie> {
        self.cookies().into_iter().find(|cookie| cookie.name == name)
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
