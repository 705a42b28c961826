// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of formatted batches to the push endpoint.
//!
//! ```text
//!   Batch
//!     │ serialize (JSON)
//!     v
//!   gzip (optional)
//!     │
//!     v
//!   ┌──────────────────────┐
//!   │ check connection     │──dead──> reconnect
//!   └──────────┬───────────┘
//!              v
//!   POST ──> 2xx: done
//!        ──> 4xx: rejected, stop (408/429 are retried)
//!        ──> 5xx / transport error: back off 2^i, retry
//! ```
//!
//! The connection handle is guarded by one async mutex held for the whole
//! attempt, so two deliveries never dial or write on it concurrently. A handle
//! that saw a transport error, or sat idle past the configured timeout, is
//! considered dead and replaced before the next send.

use crate::config::Config;
use crate::credential::CredentialProvider;
use crate::error::{Error, ShippingError};
use crate::formatter::Batch;
use flate2::{write::GzEncoder, Compression};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, warn};

/// Live HTTP client plus the bookkeeping used to judge its health.
struct Connection {
    client: reqwest::Client,
    last_used: Instant,
    broken: bool,
}

impl Connection {
    fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            last_used: Instant::now(),
            broken: false,
        }
    }

    fn is_alive(&self, idle_timeout: Duration) -> bool {
        !self.broken && self.last_used.elapsed() < idle_timeout
    }
}

pub struct Transport {
    config: Arc<Config>,
    credentials: CredentialProvider,
    connection: Mutex<Option<Connection>>,
    connections_opened: AtomicUsize,
    headers: OnceCell<HeaderMap>,
}

impl Transport {
    /// Creates the transport and its first connection handle.
    pub fn new(config: Arc<Config>, credentials: CredentialProvider) -> Result<Self, Error> {
        let client = build_client(&config).map_err(|e| Error::Client(e.to_string()))?;
        Ok(Self {
            config,
            credentials,
            connection: Mutex::new(Some(Connection::new(client))),
            connections_opened: AtomicUsize::new(1),
            headers: OnceCell::new(),
        })
    }

    /// Number of connection handles created so far, the initial one included.
    #[must_use]
    pub fn connections_opened(&self) -> usize {
        self.connections_opened.load(Ordering::Relaxed)
    }

    /// Sends one batch, retrying transient failures with exponential backoff.
    ///
    /// Returns the number of attempts it took. Every failure is logged here;
    /// callers are free to ignore the error.
    pub async fn deliver(&self, batch: &Batch) -> Result<u32, ShippingError> {
        let payload = batch.to_json().map_err(|e| {
            error!("LOKI | Failed to serialize batch, dropping it: {e}");
            ShippingError::Payload(e.to_string())
        })?;
        let (body, compressed) = self.compress(payload);
        let headers = self.get_headers().await.clone();

        let max_attempts = self.config.max_attempts();
        let mut last_status = None;
        let mut last_body = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                sleep(backoff_delay(self.config.retry_backoff_base, attempt)).await;
            }

            let mut connection = self.connection.lock().await;
            let client = match self.check_connection(&mut connection) {
                Ok(client) => client,
                Err(e) => {
                    warn!("LOKI | Failed to connect (attempt {}): {e}", attempt + 1);
                    continue;
                }
            };

            let mut request = client
                .post(self.config.url.clone())
                .timeout(self.config.request_timeout)
                .headers(headers.clone());
            if compressed {
                request = request.header(CONTENT_ENCODING, "gzip");
            }

            let time = Instant::now();
            let response = request.body(body.clone()).send().await;
            let elapsed = time.elapsed();

            match response {
                Ok(response) => {
                    if let Some(conn) = connection.as_mut() {
                        conn.last_used = Instant::now();
                    }
                    let status = response.status();
                    if status.is_success() {
                        debug!(
                            "LOKI | Sent {} entries in {} ms (attempt {})",
                            batch.len(),
                            elapsed.as_millis(),
                            attempt + 1
                        );
                        return Ok(attempt + 1);
                    }

                    let text = match response.text().await {
                        Ok(text) => text,
                        Err(e) => {
                            debug!("LOKI | Failed to read response body: {e}");
                            String::new()
                        }
                    };
                    if !is_retryable(status) {
                        error!("LOKI | Request rejected with status {status}: {text}");
                        return Err(ShippingError::Rejected { status, body: text });
                    }
                    warn!(
                        "LOKI | Request failed with status {status} (attempt {})",
                        attempt + 1
                    );
                    last_status = Some(status);
                    last_body = Some(text);
                }
                Err(e) => {
                    warn!(
                        "LOKI | Transport error after {} ms (attempt {}): {e}",
                        elapsed.as_millis(),
                        attempt + 1
                    );
                    if let Some(conn) = connection.as_mut() {
                        conn.broken = true;
                    }
                }
            }
        }

        error!(
            "LOKI | Failed to send {} entries after {max_attempts} attempts, last status: {:?}, response: {:?}",
            batch.len(),
            last_status,
            last_body
        );
        Err(ShippingError::Exhausted {
            attempts: max_attempts,
            last_status,
            body: last_body,
        })
    }

    /// Drops the connection handle, closing its idle pooled sockets.
    pub async fn close(&self) {
        if self.connection.lock().await.take().is_some() {
            debug!("LOKI | Connection closed");
        }
    }

    /// Returns a usable client, replacing the current handle if it is dead.
    fn check_connection(
        &self,
        slot: &mut Option<Connection>,
    ) -> Result<reqwest::Client, reqwest::Error> {
        if let Some(conn) = slot.as_ref() {
            if conn.is_alive(self.config.connection_idle_timeout) {
                return Ok(conn.client.clone());
            }
            debug!("LOKI | Connection considered dead, reconnecting");
        }
        *slot = None;

        let client = build_client(&self.config)?;
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        *slot = Some(Connection::new(client.clone()));
        Ok(client)
    }

    async fn get_headers(&self) -> &HeaderMap {
        self.headers
            .get_or_init(|| async {
                let mut headers = HeaderMap::new();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                if let Some(token) = self.credentials.get_token().await {
                    match HeaderValue::from_str(&format!("Bearer {token}")) {
                        Ok(mut value) => {
                            value.set_sensitive(true);
                            headers.insert(AUTHORIZATION, value);
                        }
                        Err(e) => {
                            error!("LOKI | Access token is not a valid header value: {e}");
                        }
                    }
                }
                headers
            })
            .await
    }

    /// Gzips the payload when enabled. Falls back to the raw bytes on failure.
    fn compress(&self, data: Vec<u8>) -> (Vec<u8>, bool) {
        if !self.config.use_compression {
            return (data, false);
        }

        match encode(&data) {
            Ok(compressed) => (compressed, true),
            Err(e) => {
                debug!("LOKI | Failed to compress data: {e}");
                (data, false)
            }
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("url", &self.config.url.as_str())
            .field("connections_opened", &self.connections_opened())
            .finish_non_exhaustive()
    }
}

fn build_client(config: &Config) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .pool_idle_timeout(config.connection_idle_timeout);
    if let Some(proxy) = &config.https_proxy {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    builder.build()
}

fn encode(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Delay before attempt `attempt` (zero-based): `base * 2^attempt`.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

/// Client errors are final, except timeouts and rate limiting.
fn is_retryable(status: StatusCode) -> bool {
    if status.is_client_error() {
        return matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
        );
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::BatchFormatter;
    use flate2::read::GzDecoder;
    use mockito::{Matcher, Server};
    use std::io::Read;
    use tracing_test::traced_test;

    const PUSH_PATH: &str = "/loki/api/v1/push";

    fn create_test_config(url: &str) -> Config {
        Config {
            use_compression: false,
            retry_count: 3,
            retry_backoff_base: Duration::from_millis(1),
            request_timeout: Duration::from_secs(2),
            ..Config::new(url).unwrap()
        }
    }

    fn sample_batch() -> Batch {
        BatchFormatter::new("api").format(&["2024/01/15 10:30:00 hello world".to_string()])
    }

    #[test]
    fn test_backoff_strictly_increases() {
        let base = Duration::from_secs(1);
        let delays: Vec<Duration> = (1..6).map(|i| backoff_delay(base, i)).collect();
        assert_eq!(delays[0], Duration::from_secs(2));
        assert_eq!(delays[1], Duration::from_secs(4));
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let delay = backoff_delay(Duration::from_secs(u64::MAX / 2), 40);
        assert_eq!(delay, Duration::MAX);
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_encode_round_trips() {
        let data = br#"{"streams":[]}"#;
        let compressed = encode(data).unwrap();
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_compress_disabled_returns_raw_payload() {
        let config = Arc::new(create_test_config("http://localhost:3100/loki/api/v1/push"));
        let transport = Transport::new(config, CredentialProvider::Anonymous).unwrap();
        let (body, compressed) = transport.compress(b"raw".to_vec());
        assert!(!compressed);
        assert_eq!(body, b"raw");
    }

    #[tokio::test]
    async fn test_headers_with_token() {
        let config = Arc::new(create_test_config("http://localhost:3100/loki/api/v1/push"));
        let transport =
            Transport::new(config, CredentialProvider::from_option(Some("secret"))).unwrap();
        let headers = transport.get_headers().await;
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer secret");
        assert!(headers.get(AUTHORIZATION).unwrap().is_sensitive());
    }

    #[tokio::test]
    async fn test_headers_without_token() {
        let config = Arc::new(create_test_config("http://localhost:3100/loki/api/v1/push"));
        let transport = Transport::new(config, CredentialProvider::Anonymous).unwrap();
        let headers = transport.get_headers().await;
        assert!(!headers.contains_key(AUTHORIZATION));
    }

    #[tokio::test]
    async fn test_deliver_success_first_attempt() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PUSH_PATH)
            .match_header("content-type", "application/json")
            .match_body(Matcher::PartialJsonString(
                r#"{"streams":[{"stream":{"service_name":"api","level":"info"}}]}"#.to_string(),
            ))
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let config = Arc::new(create_test_config(&format!("{}{PUSH_PATH}", server.url())));
        let transport = Transport::new(config, CredentialProvider::Anonymous).unwrap();

        let attempts = transport.deliver(&sample_batch()).await.unwrap();
        assert_eq!(attempts, 1);
        assert_eq!(transport.connections_opened(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_exhausted_retries_log_status_and_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PUSH_PATH)
            .with_status(503)
            .with_body("ingester unavailable")
            .expect(3)
            .create_async()
            .await;

        let config = Arc::new(create_test_config(&format!("{}{PUSH_PATH}", server.url())));
        let transport = Transport::new(config, CredentialProvider::Anonymous).unwrap();

        let result = transport.deliver(&sample_batch()).await;
        match result {
            Err(ShippingError::Exhausted {
                attempts,
                last_status,
                body,
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_status, Some(StatusCode::SERVICE_UNAVAILABLE));
                assert_eq!(body.as_deref(), Some("ingester unavailable"));
            }
            other => panic!("expected exhausted retries, got {other:?}"),
        }
        mock.assert_async().await;
        assert!(logs_contain("ingester unavailable"));
    }

    /// Accepts one connection and answers with a body shorter than its
    /// declared length, then hangs up.
    fn serve_truncated_response() -> std::net::SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            // Consume the whole request so hanging up does not reset the socket.
            while !request_complete(&request) {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            stream
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 100\r\n\r\npartial")
                .unwrap();
            let _ = stream.shutdown(std::net::Shutdown::Write);
            while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
        });
        addr
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some((head, body)) = text.split_once("\r\n\r\n") else {
            return false;
        };
        let length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        body.len() >= length
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unreadable_error_body_is_logged() {
        let addr = serve_truncated_response();
        let config = Arc::new(Config {
            retry_count: 1,
            ..create_test_config(&format!("http://{addr}{PUSH_PATH}"))
        });
        let transport = Transport::new(config, CredentialProvider::Anonymous).unwrap();

        match transport.deliver(&sample_batch()).await {
            Err(ShippingError::Exhausted {
                attempts,
                last_status,
                body,
            }) => {
                assert_eq!(attempts, 1);
                assert_eq!(last_status, Some(StatusCode::SERVICE_UNAVAILABLE));
                assert_eq!(body.as_deref(), Some(""));
            }
            other => panic!("expected exhausted retries, got {other:?}"),
        }
        assert!(logs_contain("Failed to read response body"));
    }

    #[tokio::test]
    async fn test_dead_connection_is_replaced() {
        // Bind and immediately release a port so nothing is listening on it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = Arc::new(create_test_config(&format!("http://{addr}{PUSH_PATH}")));
        let transport = Transport::new(config, CredentialProvider::Anonymous).unwrap();

        let result = transport.deliver(&sample_batch()).await;
        assert!(matches!(
            result,
            Err(ShippingError::Exhausted {
                attempts: 3,
                last_status: None,
                ..
            })
        ));
        // The initial handle broke on attempt 1; attempts 2 and 3 each dialed anew.
        assert_eq!(transport.connections_opened(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_is_considered_dead() {
        let config = Arc::new(Config {
            connection_idle_timeout: Duration::from_secs(30),
            ..create_test_config("http://localhost:3100/loki/api/v1/push")
        });
        let transport = Transport::new(config, CredentialProvider::Anonymous).unwrap();

        {
            let mut slot = transport.connection.lock().await;
            transport.check_connection(&mut slot).unwrap();
        }
        assert_eq!(transport.connections_opened(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        {
            let mut slot = transport.connection.lock().await;
            transport.check_connection(&mut slot).unwrap();
        }
        assert_eq!(transport.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_close_drops_connection() {
        let config = Arc::new(create_test_config("http://localhost:3100/loki/api/v1/push"));
        let transport = Transport::new(config, CredentialProvider::Anonymous).unwrap();
        transport.close().await;
        assert!(transport.connection.lock().await.is_none());
    }
}
