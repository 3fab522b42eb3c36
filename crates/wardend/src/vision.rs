//! HTTP adapter for the vision-analysis service.
//!
//! `POST {base}/v1/analyze` with the raw image bytes; the service answers
//! `{"embedding": [f32...], "confidence": f32}`. Response bodies on failure
//! are never logged or surfaced: they may carry vendor internals.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use warden_core::{RawAnalysis, VisionAnalyzer, VisionError};

pub struct HttpVisionAnalyzer {
    client: Client,
    endpoint: String,
}

impl HttpVisionAnalyzer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: analyze_endpoint(base_url),
        })
    }
}

fn analyze_endpoint(base_url: &str) -> String {
    format!("{}/v1/analyze", base_url.trim_end_matches('/'))
}

/// Server-side and throttling statuses are transient; anything else means
/// the service understood the request and refused it.
fn classify_status(status: StatusCode) -> VisionError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        VisionError::Unavailable(format!("status {}", status.as_u16()))
    } else {
        VisionError::Malformed(format!("request rejected with status {}", status.as_u16()))
    }
}

#[async_trait]
impl VisionAnalyzer for HttpVisionAnalyzer {
    async fn analyze(&self, image: &[u8]) -> Result<RawAnalysis, VisionError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .map_err(|e| VisionError::Unavailable(transport_kind(&e).to_string()))?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "vision service returned error status");
            return Err(classify_status(status));
        }

        response
            .json::<RawAnalysis>()
            .await
            .map_err(|e| body_failure(transport_kind(&e)))
    }
}

/// The body read can still hit the transport; only a body that arrived and
/// did not parse is malformed.
fn body_failure(kind: &'static str) -> VisionError {
    match kind {
        TIMED_OUT | CONNECTION_FAILED => VisionError::Unavailable(kind.to_string()),
        _ => VisionError::Malformed(kind.to_string()),
    }
}

const TIMED_OUT: &str = "timed out";
const CONNECTION_FAILED: &str = "connection failed";

fn transport_kind(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        TIMED_OUT
    } else if e.is_connect() {
        CONNECTION_FAILED
    } else if e.is_decode() {
        "undecodable body"
    } else {
        "request failed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_cleanly() {
        assert_eq!(analyze_endpoint("http://vision:8001/"), "http://vision:8001/v1/analyze");
        assert_eq!(analyze_endpoint("http://vision:8001"), "http://vision:8001/v1/analyze");
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            VisionError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            VisionError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY),
            VisionError::Malformed(_)
        ));
    }

    #[test]
    fn test_body_read_failures() {
        assert!(matches!(body_failure(TIMED_OUT), VisionError::Unavailable(_)));
        assert!(matches!(body_failure(CONNECTION_FAILED), VisionError::Unavailable(_)));
        assert!(matches!(
            body_failure("undecodable body"),
            VisionError::Malformed(_)
        ));
    }

    #[tokio::test]
    async fn test_body_timeout_is_unavailable() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Headers arrive promptly, the promised body never does.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            sock.write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 64\r\n\r\n{\"embed",
            )
            .await
            .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let analyzer =
            HttpVisionAnalyzer::new(&format!("http://{addr}"), Duration::from_millis(300)).unwrap();
        let err = analyzer.analyze(b"image").await.unwrap_err();
        assert!(matches!(err, VisionError::Unavailable(_)), "got {err:?}");
        server.abort();
    }

    #[test]
    fn test_response_shape() {
        let raw: RawAnalysis =
            serde_json::from_str(r#"{"embedding":[0.5,0.5],"confidence":0.97}"#).unwrap();
        assert_eq!(raw.embedding, vec![0.5, 0.5]);
        assert_eq!(raw.confidence, 0.97);
    }
}
