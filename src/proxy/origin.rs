//! Outbound forwarding to the single configured origin.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use url::Url;

use crate::cache::RequestTarget;
use crate::http::{Headers, Method, Request, Response, StatusCode};

/// Headers that describe one connection and are never relayed (RFC 9110 §7.6.1).
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Errors talking to the origin. None of them are retried.
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("cannot build upstream URL for {target:?}: {source}")]
    InvalidTarget {
        target: String,
        #[source]
        source: url::ParseError,
    },

    #[error("method {0:?} cannot be forwarded")]
    InvalidMethod(String),

    #[error("origin did not respond within the configured timeout")]
    Timeout(#[source] reqwest::Error),

    #[error("origin request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("origin sent unusable status code {0}")]
    InvalidStatus(u16),
}

impl OriginError {
    /// The status reported to the client when forwarding fails.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidTarget { .. } | Self::InvalidMethod(_) => StatusCode::BAD_REQUEST,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Transport(_) | Self::InvalidStatus(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e)
        } else {
            Self::Transport(e)
        }
    }
}

/// A fully buffered origin response.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    /// End-to-end headers only; framing and hop-by-hop fields are removed.
    pub headers: Headers,
    pub body: Bytes,
    /// The origin's `Content-Length` when it answered `HEAD`.
    pub declared_length: Option<u64>,
}

impl OriginResponse {
    pub fn into_response(self) -> Response {
        let mut response = Response::new(self.status).body_bytes(self.body);
        if let Some(len) = self.declared_length {
            response = response.declared_length(len);
        }
        for (name, value) in self.headers.iter() {
            response.add_header(name, value);
        }
        response
    }
}

/// HTTP client bound to one origin base URL.
#[derive(Debug, Clone)]
pub struct OriginClient {
    client: reqwest::Client,
    base: Url,
}

impl OriginClient {
    /// Builds a client for `base` with a whole-exchange `timeout`.
    ///
    /// Redirects are relayed to the client rather than followed, and
    /// environment proxy settings are ignored.
    pub fn new(base: Url, timeout: Duration) -> Result<Self, OriginError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(OriginError::Transport)?;
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Maps a raw inbound request target onto the origin.
    ///
    /// Used only for targets [`RequestTarget::parse`] refuses; such requests
    /// are never cached. Absolute-form targets contribute only their path and
    /// query.
    pub fn upstream_url(&self, target: &str) -> Result<Url, OriginError> {
        if target.starts_with('/') {
            return Ok(match target.split_once('?') {
                Some((path, query)) => self.join(path, Some(query)),
                None => self.join(target, None),
            });
        }
        let parsed = Url::parse(target).map_err(|source| OriginError::InvalidTarget {
            target: target.to_owned(),
            source,
        })?;
        Ok(self.join(parsed.path(), parsed.query()))
    }

    /// Maps a resolved request target onto the origin.
    ///
    /// The request path is appended to the base path with exactly one `/`
    /// between them, and the base query (if any) is placed before the request
    /// query.
    pub fn rebase(&self, target: &RequestTarget) -> Url {
        self.join(target.path(), target.query())
    }

    fn join(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.base.clone();
        url.set_path(&join_paths(self.base.path(), path));

        let base_query = self.base.query().filter(|q| !q.is_empty());
        let request_query = query.filter(|q| !q.is_empty());
        let merged = match (base_query, request_query) {
            (Some(b), Some(r)) => Some(format!("{b}&{r}")),
            (Some(b), None) => Some(b.to_owned()),
            (None, r) => r.map(str::to_owned),
        };
        url.set_query(merged.as_deref());
        url
    }

    /// Sends `request` to `url` on the origin and buffers the complete response.
    ///
    /// Method, end-to-end headers and body are preserved. `Host` is replaced
    /// by the origin's host and the client address is appended to
    /// `X-Forwarded-For`.
    pub async fn forward(&self, request: &Request, url: Url) -> Result<OriginResponse, OriginError> {
        let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
            .map_err(|_| OriginError::InvalidMethod(request.method().to_string()))?;

        let connection_tokens = connection_tokens(request.headers());
        let mut builder = self.client.request(method, url);
        for (name, value) in request.headers().iter() {
            let skip = is_hop_by_hop(name)
                || connection_tokens.iter().any(|t| t.eq_ignore_ascii_case(name))
                || ["host", "content-length", "upgrade", "x-forwarded-for"]
                    .iter()
                    .any(|h| h.eq_ignore_ascii_case(name));
            if !skip {
                builder = builder.header(name, value);
            }
        }

        if let Some(forwarded_for) = forwarded_for(request) {
            builder = builder.header("X-Forwarded-For", forwarded_for);
        }
        if !request.body().is_empty() {
            builder = builder.body(request.body().clone());
        }

        let response = builder.send().await.map_err(OriginError::from_reqwest)?;

        let code = response.status().as_u16();
        let status = StatusCode::from_u16(code).ok_or(OriginError::InvalidStatus(code))?;

        let declared_length = if *request.method() == Method::Head {
            response
                .headers()
                .get(reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
        } else {
            None
        };

        let mut headers = Headers::with_capacity(response.headers().len());
        for (name, value) in response.headers() {
            let name = name.as_str();
            if is_hop_by_hop(name) || name == "content-length" || name == "upgrade" {
                continue;
            }
            headers.insert(name, String::from_utf8_lossy(value.as_bytes()));
        }

        let body = response.bytes().await.map_err(OriginError::from_reqwest)?;
        Ok(OriginResponse {
            status,
            headers,
            body,
            declared_length,
        })
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Extra header names a client marked as hop-by-hop via `Connection`.
fn connection_tokens(headers: &Headers) -> Vec<String> {
    headers
        .get_all("connection")
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty())
        .collect()
}

fn forwarded_for(request: &Request) -> Option<String> {
    let peer = request.peer_addr()?.ip().to_string();
    let prior: Vec<&str> = request.headers().get_all("x-forwarded-for").collect();
    if prior.is_empty() {
        Some(peer)
    } else {
        Some(format!("{}, {peer}", prior.join(", ")))
    }
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}
