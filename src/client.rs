//! HTTP transmitter posting the finished metrics document.
//!
//! One POST per cycle, no retries: a failed document is dropped and the next
//! cycle builds a fresh one.

use std::fmt;
use std::time::Duration;

use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, info, warn};

use crate::buffer::DocumentView;
use crate::endpoint::Endpoint;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Errors that can occur while handing a document to the HTTP client.
#[derive(Debug)]
pub enum TransmitError {
    /// The HTTP client or the target URL could not be set up
    ClientInitFailed(String),

    /// A request header could not be built
    HeaderSetFailed(String),

    /// The document cannot be used as a request body
    BodySetFailed(String),

    /// The request did not complete at the transport level
    RequestFailed(reqwest::Error),
}

impl fmt::Display for TransmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransmitError::ClientInitFailed(e) => write!(f, "Failed to initialize HTTP client: {}", e),
            TransmitError::HeaderSetFailed(e) => write!(f, "Failed to set HTTP header: {}", e),
            TransmitError::BodySetFailed(e) => write!(f, "Failed to set HTTP post field: {}", e),
            TransmitError::RequestFailed(e) if e.is_timeout() => {
                write!(f, "HTTP request timed out: {}", e)
            }
            TransmitError::RequestFailed(e) => write!(f, "Failed to perform HTTP request: {}", e),
        }
    }
}

impl std::error::Error for TransmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransmitError::RequestFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// What a successful [`Transmitter::send`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The document was empty, no request was made
    Skipped,

    /// The request completed; the status is informational only
    Delivered(StatusCode),
}

/// Posts metrics documents to the endpoint.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use metrics_sender::buffer::MetricBuffer;
/// use metrics_sender::client::Transmitter;
/// use metrics_sender::config::{Config, DocumentLayout};
/// use metrics_sender::endpoint::Endpoint;
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::default();
///     let endpoint = Endpoint::from_config(&config);
///     let transmitter = Transmitter::new(&endpoint, Duration::from_secs(5)).unwrap();
///
///     let mut buffer = MetricBuffer::new(256, DocumentLayout::Flat);
///     buffer.reset().unwrap();
///     let mut doc = buffer.open_document().unwrap();
///     doc.append("uptime", 42).unwrap();
///     doc.close();
///
///     match transmitter.send(buffer.finalize()).await {
///         Ok(outcome) => println!("Sent: {:?}", outcome),
///         Err(e) => eprintln!("Failed to send: {}", e),
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Transmitter {
    /// The underlying HTTP client, reused across cycles
    client: Client,

    url: Url,

    timeout: Duration,
}

impl Transmitter {
    /// Create a transmitter for the endpoint's target URL.
    ///
    /// # Errors
    ///
    /// Returns `TransmitError::ClientInitFailed` if the URL is invalid or the
    /// HTTP client cannot be built.
    pub fn new(endpoint: &Endpoint, timeout: Duration) -> Result<Self, TransmitError> {
        let target = endpoint.target_url();
        let url = Url::parse(&target)
            .map_err(|e| TransmitError::ClientInitFailed(format!("invalid URL '{}': {}", target, e)))?;

        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| TransmitError::ClientInitFailed(e.to_string()))?;

        Ok(Self {
            client,
            url,
            timeout,
        })
    }

    /// POST the document with `Content-Type: application/json`.
    ///
    /// Any completed request is `Ok`, whatever its status. An empty document is
    /// `Ok(SendOutcome::Skipped)` without a request.
    pub async fn send(&self, document: DocumentView<'_>) -> Result<SendOutcome, TransmitError> {
        if document.is_empty() {
            warn!("No metrics to send");
            return Ok(SendOutcome::Skipped);
        }

        let content_type = HeaderValue::from_str(JSON_CONTENT_TYPE)
            .map_err(|e| TransmitError::HeaderSetFailed(e.to_string()))?;

        if !document.is_closed() {
            return Err(TransmitError::BodySetFailed(
                "document has not been closed".to_string(),
            ));
        }

        debug!(url = %self.url, bytes = document.len(), "Sending metrics");

        let response = self
            .client
            .post(self.url.clone())
            .timeout(self.timeout)
            .header(CONTENT_TYPE, content_type)
            .body(document.as_str().to_owned())
            .send()
            .await
            .map_err(TransmitError::RequestFailed)?;

        let status = response.status();
        if status.is_success() {
            info!(status = %status, bytes = document.len(), "Metrics sent");
        } else {
            warn!(status = %status, "Metrics endpoint answered with a non-success status");
        }

        Ok(SendOutcome::Delivered(status))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
