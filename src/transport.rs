use std::sync::Mutex;
use std::time::Duration;

use log::warn;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use rustls::crypto::{CryptoProvider, ring};

use crate::document::Document;
use crate::error::TransportError;

/// Client-side bound for every request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(45);

/// ============================================================
/// Transport
/// ============================================================
///
/// Delivers a document to the central server and hands back the raw
/// response body.
///
/// CONTRACT:
/// - The document body is consumed (single traversal).
/// - Any status outside 200..=399 is an error, even when the request
///   itself went through.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, url: &str, document: &mut Document) -> Result<Vec<u8>, TransportError>;

    /// Drops pooled keep-alive connections. Called between cycles.
    fn close_idle(&self) {}
}

/// ============================================================
/// HttpTransport
/// ============================================================
///
/// JSON POST over a pooled `reqwest` client.
///
/// Connections are kept alive for the duration of a cycle; the
/// application calls [`Transport::close_idle`] after each cycle so
/// nothing stays open while the agent sleeps.
pub struct HttpTransport {
    user_agent: String,
    client: Mutex<reqwest::Client>,
}

impl HttpTransport {
    /// `version` ends up in the User-Agent header.
    pub fn new(version: &str) -> Result<Self, TransportError> {
        install_crypto_provider();
        let user_agent = format!("hostcollect/{version}");
        let client = build_client(&user_agent)?;
        Ok(Self {
            user_agent,
            client: Mutex::new(client),
        })
    }

    fn client(&self) -> reqwest::Client {
        // reqwest::Client is a handle; cloning shares the pool
        match self.client.lock() {
            Ok(client) => client.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// rustls >= 0.23 needs a process-wide CryptoProvider before the first
/// TLS client is built. Installing twice is harmless; the first one stays.
fn install_crypto_provider() {
    if CryptoProvider::get_default().is_none() {
        let _ = CryptoProvider::install_default(ring::default_provider());
    }
}

fn build_client(user_agent: &str) -> Result<reqwest::Client, TransportError> {
    Ok(reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(user_agent)
        .pool_max_idle_per_host(1)
        .build()?)
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn post(&self, url: &str, document: &mut Document) -> Result<Vec<u8>, TransportError> {
        let response = self
            .client()
            .post(url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(document.drain_body())
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?.to_vec();

        if !is_success(status.as_u16()) {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    fn close_idle(&self) {
        // reqwest has no explicit idle teardown; a fresh client drops
        // the old pool once in-flight clones are gone.
        match build_client(&self.user_agent) {
            Ok(fresh) => match self.client.lock() {
                Ok(mut client) => *client = fresh,
                Err(poisoned) => *poisoned.into_inner() = fresh,
            },
            Err(e) => warn!("transport: could not rebuild client: {e}"),
        }
    }
}

/// 2xx and 3xx count as delivered.
pub fn is_success(status: u16) -> bool {
    (200..400).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serves exactly one request with `status` and `body`, returning the
    /// raw request it received.
    async fn one_shot_server(status: &str, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/push/sys.mem", listener.local_addr().unwrap());
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).into_owned()
        });

        (url, handle)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= header_end + 4 + content_length
    }

    #[test]
    fn success_range() {
        assert!(is_success(200));
        assert!(is_success(204));
        assert!(is_success(302));
        assert!(is_success(399));
        assert!(!is_success(199));
        assert!(!is_success(400));
        assert!(!is_success(500));
    }

    #[tokio::test]
    async fn posts_json_body_with_headers() {
        let (url, server) = one_shot_server("200 OK", "{\"ok\":true}").await;
        let transport = HttpTransport::new("1.2.3").unwrap();
        let mut document = Document::new(br#"{"a": "b"}"#).unwrap();

        let response = transport.post(&url, &mut document).await.unwrap();
        assert_eq!(response, b"{\"ok\":true}");

        let request = server.await.unwrap();
        let lower = request.to_ascii_lowercase();
        assert!(request.starts_with("POST /push/sys.mem HTTP/1.1\r\n"));
        assert!(lower.contains("content-type: application/json"));
        assert!(lower.contains("user-agent: hostcollect/1.2.3"));
        assert!(request.ends_with("{\"a\":\"b\"}\n"));

        // body was consumed
        assert!(matches!(
            document.set_string("x", "y"),
            Err(crate::error::DocumentError::State)
        ));
    }

    #[tokio::test]
    async fn error_status_is_transport_error() {
        let (url, server) = one_shot_server("500 Internal Server Error", "broken").await;
        let transport = HttpTransport::new("1.2.3").unwrap();
        let mut document = Document::new(b"{}").unwrap();

        let err = transport.post(&url, &mut document).await.unwrap_err();
        match err {
            TransportError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, b"broken");
            }
            other => panic!("unexpected error: {other}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn redirect_status_counts_as_success() {
        // no Location header, so reqwest hands the 304 back as-is
        let (url, server) = one_shot_server("304 Not Modified", "").await;
        let transport = HttpTransport::new("1.2.3").unwrap();
        let mut document = Document::new(b"{}").unwrap();

        assert!(transport.post(&url, &mut document).await.is_ok());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connection_refused_is_http_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);

        let transport = HttpTransport::new("1.2.3").unwrap();
        let mut document = Document::new(b"{}").unwrap();
        let err = transport.post(&url, &mut document).await.unwrap_err();
        assert!(matches!(err, TransportError::Http(_)));
    }

    #[tokio::test]
    async fn close_idle_keeps_transport_usable() {
        let (url, server) = one_shot_server("201 Created", "").await;
        let transport = HttpTransport::new("1.2.3").unwrap();
        transport.close_idle();
        let mut document = Document::new(b"{}").unwrap();
        assert!(transport.post(&url, &mut document).await.is_ok());
        server.await.unwrap();
    }
}
