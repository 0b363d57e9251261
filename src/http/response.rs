//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses and
//! serializing them to a byte buffer for transmission over TCP.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Headers, StatusCode};

/// Framing headers owned by the serializer. Values supplied by callers (for
/// instance copied from an origin response) are dropped and recomputed.
const FRAMING_HEADERS: [&str; 3] = ["content-length", "connection", "transfer-encoding"];

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use cachegate::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    /// Length advertised for a body that is not sent (replies to `HEAD`).
    declared_length: Option<u64>,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            declared_length: None,
            keep_alive: true,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets a plain-text body.
    ///
    /// Adds `Content-Type: text/plain; charset=utf-8` unless a content type was
    /// already set. The `Content-Length` header is written automatically by
    /// [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        if !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets the response body from raw bytes, leaving headers untouched.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Advertises `len` as the `Content-Length` of an omitted body, as an
    /// origin does when answering `HEAD`. A non-empty body takes precedence.
    #[must_use]
    pub fn declared_length(mut self, len: u64) -> Self {
        self.declared_length = Some(len);
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns `true` unless the response was marked `Connection: close`.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the headers set so far.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the buffered body.
    pub fn payload(&self) -> &Bytes {
        &self.body
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Caller-supplied framing headers are discarded, then:
    /// - `Connection: keep-alive` or `Connection: close` is written.
    /// - `Content-Length: <n>` is written from the buffered body, or from
    ///   [`declared_length`](Self::declared_length) when the body is empty.
    ///
    /// `1xx`, `204` and `304` responses carry neither `Content-Length` nor a body.
    pub fn into_bytes(mut self) -> BytesMut {
        let bodiless = is_bodiless(self.status);
        let content_length = match self.declared_length {
            Some(len) if self.body.is_empty() => len,
            _ => self.body.len() as u64,
        };

        for name in FRAMING_HEADERS {
            self.headers.remove(name);
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.insert("Connection", connection);

        let estimated_size = 128 + self.headers.len() * 64 + self.body.len();
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        // Headers
        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Content-Length is always the last header before the blank line
        if !bodiless {
            buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());
        }

        // Header/body separator
        buf.put(&b"\r\n"[..]);

        // Body
        if !bodiless && !self.body.is_empty() {
            buf.put(self.body.as_ref());
        }

        buf
    }
}

fn is_bodiless(status: StatusCode) -> bool {
    let code = status.as_u16();
    (100..200).contains(&code) || code == 204 || code == 304
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}
