use http::{HeaderMap, Request};
use hyper::body::Bytes;
use serde_json::Value;
use std::time::Duration;

/// Timing and size measurements of one HTTP exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RequestTimings {
    /// Request start until response headers arrived.
    pub waiting: Duration,
    /// Headers until the body was fully read.
    pub receiving: Duration,
    pub duration: Duration,
    /// Approximate bytes on the wire, headers included.
    pub request_size: usize,
    pub response_size: usize,
}

/// What the transport returns for a request that got an answer.
#[derive(Debug, Clone)]
pub struct HttpExchange {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timings: RequestTimings,
}

/// The HTTP collaborator VUs talk to.
///
/// Calls look synchronous to the scenario. Every request in a batch is in
/// flight at the same time and results come back in request order. A
/// transport failure (connect error, timeout) is an `Err` entry, never a
/// panic.
pub trait Transport: Send + Sync {
    fn round_trip(
        &self,
        batch: Vec<Request<String>>,
        timeout: Option<Duration>,
    ) -> Vec<Result<HttpExchange, String>>;
}

/// Response handed to scenario code.
///
/// Transport failures show up as `status == 0` with `error` set so that
/// checks can assert on them like any other response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub method: String,
    pub url: String,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub error: Option<String>,
    pub timings: RequestTimings,
}

impl HttpResponse {
    pub(crate) fn from_result(
        method: String,
        url: String,
        result: Result<HttpExchange, String>,
    ) -> Self {
        match result {
            Ok(exchange) => Self {
                method,
                url,
                status: exchange.status,
                headers: exchange.headers,
                body: exchange.body,
                error: None,
                timings: exchange.timings,
            },
            Err(error) => Self::failed(method, url, error),
        }
    }

    pub(crate) fn failed(method: String, url: String, error: String) -> Self {
        Self {
            method,
            url,
            status: 0,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            error: Some(error),
            timings: RequestTimings::default(),
        }
    }

    /// Got an answer with a 2xx or 3xx status.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..400).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Field of a JSON body addressed by a dotted path (`"Type"`,
    /// `"items.0.id"`). An empty path returns the whole document. `None` if
    /// the body is not JSON or the path does not resolve.
    pub fn json(&self, path: &str) -> Option<Value> {
        let doc: Value = serde_json::from_slice(&self.body).ok()?;
        json_path(&doc, path).cloned()
    }
}

pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
