//! Blocking HTTP over a shared async client
//!
//! Sources are driven synchronously by the page fetcher, so every request
//! runs to completion on [`SHARED_RUNTIME`].

use std::sync::LazyLock;
use std::time::Duration;

use wareline_core::SourceError;

/// Connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Whole-request timeout; a timed out request surfaces without a status and is retried
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

static SHARED_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .pool_max_idle_per_host(8)
        .build()
        .expect("failed to build HTTP client")
});

/// Get shared HTTP client.
pub fn http_client() -> &'static reqwest::Client {
    &SHARED_CLIENT
}

/// Shared tokio runtime for HTTP operations.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

/// Map a reqwest failure onto the source taxonomy. The URL is stripped so
/// query strings and tokens stay out of logs.
pub fn from_reqwest(e: reqwest::Error) -> SourceError {
    SourceError::Http {
        status: e.status().map(|s| s.as_u16()),
        message: e.without_url().to_string(),
    }
}

/// Send a prepared request and return the body of a 2xx response.
pub fn send_text(request: reqwest::RequestBuilder) -> Result<String, SourceError> {
    SHARED_RUNTIME.handle().block_on(async {
        let resp = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(from_reqwest)?;
        resp.text().await.map_err(from_reqwest)
    })
}

/// Parse a response body as JSON, reporting failures as decode errors.
pub fn parse_json(body: &str, what: &str) -> Result<serde_json::Value, SourceError> {
    serde_json::from_str(body).map_err(|e| SourceError::Decode {
        message: format!("invalid {what} JSON: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_json_reports_decode_error() {
        let err = parse_json("{not json", "playlist").unwrap_err();
        assert!(matches!(err, SourceError::Decode { .. }));
        assert!(err.to_string().contains("playlist"));
        assert!(!err.is_retryable());
    }
}
