//! Bridge between VU coroutines and Tokio.
//!
//! A coroutine pushes its requests onto a bounded channel and parks on a
//! `may` channel until the answer arrives. Dispatcher threads pull requests
//! off the channel and spawn each one as a task on the shared runtime, so
//! the requests of a batch run concurrently.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use http::Request;
use tokio::runtime::Runtime;
use tracing::debug;

use super::http_client::HttpClient;
use super::transport::{HttpExchange, Transport};

type Reply = Result<HttpExchange, String>;

struct IoRequest {
    request: Request<String>,
    timeout: Option<Duration>,
    reply: may::sync::mpsc::Sender<Reply>,
}

pub struct IoBridge {
    request_tx: Sender<IoRequest>,
    _runtime: Arc<Runtime>,
    _dispatchers: Vec<JoinHandle<()>>,
}

impl IoBridge {
    pub fn new(
        runtime: Arc<Runtime>,
        client: Arc<HttpClient>,
        dispatchers: usize,
    ) -> std::io::Result<Self> {
        // Bounded so a stalled target applies backpressure instead of growing memory.
        let (request_tx, request_rx): (Sender<IoRequest>, Receiver<IoRequest>) = bounded(10_000);

        let mut handles = Vec::with_capacity(dispatchers.max(1));
        for id in 0..dispatchers.max(1) {
            let rx = request_rx.clone();
            let handle = runtime.handle().clone();
            let client = client.clone();
            let thread = std::thread::Builder::new()
                .name(format!("io-dispatch-{}", id))
                .spawn(move || {
                    while let Ok(IoRequest {
                        request,
                        timeout,
                        reply,
                    }) = rx.recv()
                    {
                        let client = client.clone();
                        handle.spawn(async move {
                            let fut = client.request(request);
                            let result = match timeout {
                                Some(limit) => match tokio::time::timeout(limit, fut).await {
                                    Ok(res) => res.map_err(|e| e.to_string()),
                                    Err(_) => Err("request timeout".to_string()),
                                },
                                None => fut.await.map_err(|e| e.to_string()),
                            };
                            // The VU may have gone away; nothing to do then.
                            let _ = reply.send(result);
                        });
                    }
                    debug!(dispatcher = id, "I/O dispatcher stopped");
                })?;
            handles.push(thread);
        }

        Ok(Self {
            request_tx,
            _runtime: runtime,
            _dispatchers: handles,
        })
    }

    /// Multi-threaded runtime with `io_threads` workers, a pooled client and
    /// one dispatcher per worker.
    pub fn launch(io_threads: usize, pool_size: usize) -> std::io::Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let io_threads = io_threads.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(io_threads)
            .thread_name("volley-io")
            .enable_all()
            .build()?;
        let client = HttpClient::new(pool_size);
        Self::new(Arc::new(runtime), Arc::new(client), io_threads)
    }

    fn submit(&self, req: IoRequest) -> Result<(), String> {
        match self.request_tx.try_send(req) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(req)) => self
                .request_tx
                .send(req)
                .map_err(|_| "I/O bridge closed".to_string()),
            Err(TrySendError::Disconnected(_)) => Err("I/O bridge closed".to_string()),
        }
    }
}

impl Transport for IoBridge {
    fn round_trip(
        &self,
        batch: Vec<Request<String>>,
        timeout: Option<Duration>,
    ) -> Vec<Reply> {
        // Submit everything first, then wait in order.
        let pending: Vec<Result<may::sync::mpsc::Receiver<Reply>, String>> = batch
            .into_iter()
            .map(|request| {
                let (reply, rx) = may::sync::mpsc::channel();
                self.submit(IoRequest {
                    request,
                    timeout,
                    reply,
                })
                .map(|()| rx)
            })
            .collect();

        pending
            .into_iter()
            .map(|slot| {
                let rx = slot?;
                rx.recv()
                    .unwrap_or_else(|_| Err("response channel closed".to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Answers `n` HTTP/1.1 requests with a fixed JSON body, one connection each.
    fn serve(n: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming().take(n) {
                let mut stream = stream.unwrap();
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let body = r#"{"Type":"application/vnd.apple.mpegurl"}"#;
                let res = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                stream.write_all(res.as_bytes()).unwrap();
            }
        });
        format!("http://{}", addr)
    }

    fn bridge() -> IoBridge {
        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap(),
        );
        let _ = rustls::crypto::ring::default_provider().install_default();
        IoBridge::new(runtime, Arc::new(HttpClient::new(4)), 2).unwrap()
    }

    #[test]
    fn test_batch_results_in_request_order() {
        let base = serve(2);
        let bridge = bridge();
        let batch = vec![
            Request::get(format!("{}/a", base)).body(String::new()).unwrap(),
            Request::get("http://127.0.0.1:1/unreachable")
                .body(String::new())
                .unwrap(),
            Request::get(format!("{}/b", base)).body(String::new()).unwrap(),
        ];
        let results = bridge.round_trip(batch, Some(Duration::from_secs(5)));
        assert_eq!(results.len(), 3);
        let first = results[0].as_ref().unwrap();
        assert_eq!(first.status, 200);
        assert!(first.timings.response_size > first.body.len());
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().status, 200);
    }
}
