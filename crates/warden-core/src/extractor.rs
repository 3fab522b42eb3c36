//! Feature extraction over the external vision-analysis service.
//!
//! The service is untrusted and possibly slow: every call is bounded by a
//! timeout and a cancellation token, and every response is validated into a
//! fixed-shape [`Features`] value before it reaches the rest of the engine.

use crate::cancel::CancelToken;
use crate::types::Embedding;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// --- Named constants ---
pub const DEFAULT_EMBEDDING_DIM: usize = 512;
pub const DEFAULT_ALGORITHM: &str = "vision-analysis/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw response from the vision-analysis collaborator.
#[derive(Clone, Deserialize)]
pub struct RawAnalysis {
    pub embedding: Vec<f32>,
    pub confidence: f32,
}

// Manual `Debug` so the raw embedding never reaches logs; only its length is shown.
impl std::fmt::Debug for RawAnalysis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawAnalysis")
            .field("embedding_len", &self.embedding.len())
            .field("confidence", &self.confidence)
            .finish()
    }
}

#[derive(Error, Debug)]
pub enum VisionError {
    /// Transport failure or non-success status.
    #[error("vision service unavailable: {0}")]
    Unavailable(String),
    /// The service answered, but not with the expected shape.
    #[error("malformed vision response: {0}")]
    Malformed(String),
}

/// The vision-analysis collaborator: pixels in, raw feature vector out.
#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    async fn analyze(&self, image: &[u8]) -> Result<RawAnalysis, VisionError>;
}

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("input is not a supported image: {0}")]
    InvalidImage(String),
    #[error("invalid response from vision service: {0}")]
    InvalidResponse(String),
    #[error("vision service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("extraction cancelled")]
    Cancelled,
}

/// Validated extractor output.
#[derive(Debug, Clone)]
pub struct Features {
    /// L2-normalised embedding.
    pub embedding: Embedding,
    /// Extractor confidence in [0, 1].
    pub quality: f32,
}

pub struct FeatureExtractor {
    analyzer: Arc<dyn VisionAnalyzer>,
    dimension: usize,
    timeout: Duration,
    algorithm: String,
}

impl FeatureExtractor {
    pub fn new(analyzer: Arc<dyn VisionAnalyzer>, dimension: usize) -> Self {
        Self {
            analyzer,
            dimension,
            timeout: DEFAULT_TIMEOUT,
            algorithm: DEFAULT_ALGORITHM.to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_algorithm(mut self, algorithm: &str) -> Self {
        self.algorithm = algorithm.to_string();
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Convert an image to validated features. Callers must already hold a
    /// granted consent decision.
    pub async fn extract(
        &self,
        image: &[u8],
        cancel: &CancelToken,
    ) -> Result<Features, ExtractionError> {
        validate_image(image)?;

        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }

        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("extraction cancelled");
                return Err(ExtractionError::Cancelled);
            }
            res = tokio::time::timeout(self.timeout, self.analyzer.analyze(image)) => match res {
                Err(_) => {
                    tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "vision service timed out");
                    return Err(ExtractionError::ServiceUnavailable("timed out".into()));
                }
                Ok(Err(VisionError::Unavailable(msg))) => {
                    return Err(ExtractionError::ServiceUnavailable(msg));
                }
                Ok(Err(VisionError::Malformed(msg))) => {
                    return Err(ExtractionError::InvalidResponse(msg));
                }
                Ok(Ok(raw)) => raw,
            },
        };

        self.validate(raw)
    }

    fn validate(&self, raw: RawAnalysis) -> Result<Features, ExtractionError> {
        if raw.embedding.is_empty() {
            return Err(ExtractionError::InvalidResponse("empty embedding".into()));
        }
        if raw.embedding.len() != self.dimension {
            return Err(ExtractionError::InvalidResponse(format!(
                "expected {}-dim embedding, got {}",
                self.dimension,
                raw.embedding.len()
            )));
        }
        if raw.embedding.iter().any(|v| !v.is_finite()) {
            return Err(ExtractionError::InvalidResponse(
                "embedding contains non-finite values".into(),
            ));
        }
        if !raw.confidence.is_finite() || !(0.0..=1.0).contains(&raw.confidence) {
            return Err(ExtractionError::InvalidResponse(format!(
                "confidence {} outside [0, 1]",
                raw.confidence
            )));
        }

        let embedding = Embedding::new(raw.embedding, Some(self.algorithm.clone())).normalized();
        Ok(Features {
            embedding,
            quality: raw.confidence,
        })
    }
}

/// Reject payloads that are empty or not a recognised image container.
fn validate_image(image: &[u8]) -> Result<(), ExtractionError> {
    if image.is_empty() {
        return Err(ExtractionError::InvalidImage("empty payload".into()));
    }
    image::guess_format(image)
        .map(|_| ())
        .map_err(|e| ExtractionError::InvalidImage(e.to_string()))
}
