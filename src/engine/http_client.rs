use std::time::{Duration, Instant};

use http::{HeaderMap, Request};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::warn;

use super::transport::{HttpExchange, RequestTimings};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Pooled HTTP/1.1 + HTTP/2 client over rustls. Must be driven from inside a
/// Tokio runtime.
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HttpClient {
    /// `pool_size` is the maximum idle connections kept per host.
    pub fn new(pool_size: usize) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);

        let tls = match hyper_rustls::HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                warn!(error = %e, "No native CA roots found, HTTPS targets will fail verification");
                let config = rustls::ClientConfig::builder()
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth();
                hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(config)
            }
        };
        let https = tls
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(pool_size)
            .build(https);

        Self { client }
    }

    pub async fn request(&self, req: Request<String>) -> Result<HttpExchange, BoxError> {
        let start = Instant::now();
        let request_size = estimate_request_size(&req);

        let (parts, body) = req.into_parts();
        let req_hyper = Request::from_parts(parts, Full::new(Bytes::from(body)));

        let response = self.client.request(req_hyper).await?;
        let headers_received = Instant::now();

        // The body is always read to the end so the connection can go back to the pool.
        let (parts, body_stream) = response.into_parts();
        let body = body_stream.collect().await?.to_bytes();
        let receive_end = Instant::now();

        let timings = RequestTimings {
            waiting: headers_received.duration_since(start),
            receiving: receive_end.duration_since(headers_received),
            duration: receive_end.duration_since(start),
            request_size,
            response_size: estimate_response_size(&parts.headers, body.len()),
        };

        Ok(HttpExchange {
            status: parts.status.as_u16(),
            headers: parts.headers,
            body,
            timings,
        })
    }
}

/// Request line, headers and body as they would appear on an HTTP/1.1 wire.
fn estimate_request_size(req: &Request<String>) -> usize {
    let line = req.method().as_str().len() + 1 + req.uri().to_string().len() + 11;
    let headers: usize = req
        .headers()
        .iter()
        .map(|(k, v)| k.as_str().len() + 2 + v.len() + 2)
        .sum();
    line + headers + 2 + req.body().len()
}

fn estimate_response_size(headers: &HeaderMap, body_len: usize) -> usize {
    // "HTTP/1.1 200 OK\r\n" is roughly 15 bytes plus the reason phrase.
    let line = 15;
    let headers: usize = headers
        .iter()
        .map(|(k, v)| k.as_str().len() + 2 + v.len() + 2)
        .sum();
    line + headers + 2 + body_len
}
