use futures::StreamExt;
use reqwest::redirect::Policy;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const DEFAULT_MAX_RETRIES: u32 = 3;
const USER_AGENT: &str = concat!("ratewatch/", env!("CARGO_PKG_VERSION"));

/// Errors that can occur while fetching the raw feed text.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    #[error("Invalid UTF-8 in response")]
    InvalidUtf8,
    /// The server answered but there was no document in the body
    #[error("Empty response body")]
    Empty,
}

impl FetchError {
    /// Returns true if this error is transient and the fetch should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_)
            | FetchError::Timeout
            | FetchError::IncompleteResponse { .. } => true,
            FetchError::HttpStatus(status) => *status >= 500 || *status == 429,
            FetchError::ResponseTooLarge | FetchError::InvalidUtf8 | FetchError::Empty => false,
        }
    }
}

/// Anything that can produce the current raw feed text.
///
/// The HTTP implementation is [`HttpFeedSource`]; tests and offline modes
/// supply their own.
pub trait FeedSource: Send + Sync + 'static {
    fn fetch(&self) -> impl Future<Output = Result<String, FetchError>> + Send;
}

/// Fetches the feed over HTTP(S).
///
/// Server errors (5xx) and rate limiting (429) are retried with exponential
/// backoff up to `max_retries` times; 4xx responses fail immediately.
#[derive(Debug, Clone)]
pub struct HttpFeedSource {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    max_retries: u32,
    base_delay: Duration,
}

impl HttpFeedSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(create_redirect_policy())
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            timeout,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(1),
        })
    }

    /// Overrides the retry budget and the first backoff delay (doubled per attempt).
    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_once(&self) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }
        read_limited_bytes(response, MAX_FEED_SIZE).await
    }

    async fn fetch_text(&self) -> Result<String, FetchError> {
        let mut retry_count = 0;

        let bytes = loop {
            // The deadline covers the body as well as the headers
            let attempt = tokio::time::timeout(self.timeout, self.fetch_once())
                .await
                .unwrap_or(Err(FetchError::Timeout));

            match attempt {
                Ok(bytes) => break bytes,
                Err(e) if e.is_retryable() && retry_count < self.max_retries => {
                    let delay = self.base_delay * 2u32.pow(retry_count);
                    tracing::warn!(
                        url = %self.url,
                        error = %e,
                        retry = retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "Feed fetch failed, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let text = String::from_utf8(bytes).map_err(|_| FetchError::InvalidUtf8)?;
        let document = trim_to_document(&text);
        if document.is_empty() {
            return Err(FetchError::Empty);
        }

        tracing::debug!(url = %self.url, bytes = document.len(), "Fetched rate feed");
        Ok(document.to_string())
    }
}

impl FeedSource for HttpFeedSource {
    fn fetch(&self) -> impl Future<Output = Result<String, FetchError>> + Send {
        self.fetch_text()
    }
}

/// Cuts any preamble before the XML declaration (or first tag) and anything
/// after the closing `</rss>`.
pub fn trim_to_document(raw: &str) -> &str {
    let start = raw.find("<?xml").or_else(|| raw.find('<'));
    let Some(start) = start else {
        return raw.trim();
    };
    let body = &raw[start..];
    match body.rfind("</rss>") {
        Some(end) => &body[..end + "</rss>".len()],
        None => body.trim_end(),
    }
}

/// Limits redirects to 3 hops and rejects loops.
fn create_redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        for prev in attempt.previous() {
            if prev.as_str() == url.as_str() {
                return attempt.error("Redirect loop detected");
            }
        }

        tracing::debug!(
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );
        attempt.follow()
    })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{any, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item><title>GBP/AED</title><description>1 GBP = 4.9471 AED</description></item>
</channel></rss>"#;

    fn source(server: &MockServer) -> HttpFeedSource {
        HttpFeedSource::new(format!("{}/gbp/rss.xml", server.uri()), Duration::from_secs(5))
            .unwrap()
            .with_retries(3, Duration::from_millis(5))
    }

    #[test]
    fn test_trim_to_document() {
        let raw = "junk before <?xml version=\"1.0\"?><rss></rss> trailing junk";
        assert_eq!(trim_to_document(raw), "<?xml version=\"1.0\"?><rss></rss>");
        assert_eq!(trim_to_document("  <rss><channel/></rss>\n"), "<rss><channel/></rss>");
        assert_eq!(trim_to_document("no markup"), "no markup");
        assert_eq!(trim_to_document("   "), "");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::HttpStatus(503).is_retryable());
        assert!(FetchError::HttpStatus(429).is_retryable());
        assert!(!FetchError::HttpStatus(404).is_retryable());
        assert!(!FetchError::Empty.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!("<!-- served -->\n{}\n", VALID_RSS))
                    .insert_header("Content-Type", "application/xml"),
            )
            .mount(&mock_server)
            .await;

        let source = source(&mock_server);
        assert_eq!(source.url(), format!("{}/gbp/rss.xml", mock_server.uri()));
        let text = source.fetch().await.unwrap();
        assert!(text.starts_with("<?xml"));
        assert!(text.ends_with("</rss>"));
    }

    #[tokio::test]
    async fn test_fetch_404_fails_without_retry() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        match source(&mock_server).fetch().await {
            Err(FetchError::HttpStatus(404)) => {}
            other => panic!("Expected HttpStatus(404), got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_500_retries_then_fails() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(4) // Initial request + 3 retries
            .mount(&mock_server)
            .await;

        match source(&mock_server).fetch().await {
            Err(FetchError::HttpStatus(500)) => {}
            other => panic!("Expected HttpStatus(500), got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_503_retry_then_success() {
        let mock_server = MockServer::start().await;

        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;

        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;

        let text = source(&mock_server).fetch().await.unwrap();
        assert!(text.contains("GBP/AED"));
    }

    #[tokio::test]
    async fn test_fetch_times_out_when_body_stalls() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n<rss>")
                .await
                .unwrap();
            // Headers and a few bytes, then nothing
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let source = HttpFeedSource::new(format!("http://{}/rss.xml", addr), Duration::from_millis(300))
            .unwrap()
            .with_retries(0, Duration::from_millis(5));

        let result = tokio::time::timeout(Duration::from_secs(5), source.fetch())
            .await
            .expect("fetch should give up on its own");
        match result {
            Err(FetchError::Timeout) => {}
            Err(FetchError::Network(e)) if e.is_timeout() => {}
            other => panic!("Expected a timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_empty_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("   \n"))
            .mount(&mock_server)
            .await;

        assert!(matches!(
            source(&mock_server).fetch().await,
            Err(FetchError::Empty)
        ));
    }
}
