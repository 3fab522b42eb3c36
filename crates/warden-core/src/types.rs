use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default cosine similarity threshold for a watchlist match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.85;

/// Face embedding vector (512-dimensional for ArcFace-class extractors).
///
/// Deliberately not `Serialize`: plaintext embeddings never leave the process
/// except as ciphertext produced by the template vault.
#[derive(Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Extractor identifier/version that produced this embedding.
    pub algorithm: Option<String>,
}

impl fmt::Debug for Embedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Embedding")
            .field("dimension", &self.values.len())
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl Embedding {
    pub fn new(values: Vec<f32>, algorithm: Option<String>) -> Self {
        Self { values, algorithm }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity clamped to [0, 1].
    ///
    /// A zero-norm vector on either side, or a dimension mismatch, yields 0.
    /// Always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        // sqrt(x * x) == x exactly, which keeps self-similarity at 1.0.
        let denom = (norm_a * norm_b).sqrt();
        let sim = if denom > 0.0 && denom.is_finite() { dot / denom } else { 0.0 };
        if sim.is_nan() {
            return 0.0;
        }
        sim.clamp(0.0, 1.0)
    }

    /// Serialize to little-endian f32 bytes (the plaintext fed to the vault cipher).
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Parse little-endian f32 bytes. Returns `None` on a ragged length.
    pub fn from_le_bytes(bytes: &[u8], algorithm: Option<String>) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values, algorithm })
    }

    /// Return a unit-length copy. Zero vectors are returned unchanged.
    pub fn normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut self.values {
                *v /= norm;
            }
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchDecision {
    Match,
    NoMatch,
}

/// Outcome of comparing a candidate against one watchlist entry.
///
/// Ephemeral: only a non-biometric summary of it reaches the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub watchlist_entry_id: String,
    pub similarity_score: f32,
    pub decision: MatchDecision,
    pub threshold_used: f32,
}

/// A watchlist entry's similarity against a candidate, before thresholding.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry_id: String,
    pub added_at: DateTime<Utc>,
    pub similarity: f32,
}

/// Strategy for scoring a candidate against reference embeddings.
pub trait Matcher {
    fn score(&self, candidate: &Embedding, reference: &Embedding) -> f32;

    /// Keep entries with `similarity >= threshold`, ordered by similarity
    /// descending, then earliest `added_at`, then entry id.
    fn rank(&self, mut scored: Vec<ScoredEntry>, threshold: f32) -> Vec<MatchResult> {
        scored.retain(|s| s.similarity >= threshold);
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.added_at.cmp(&b.added_at))
                .then_with(|| a.entry_id.cmp(&b.entry_id))
        });
        scored
            .into_iter()
            .map(|s| MatchResult {
                watchlist_entry_id: s.entry_id,
                similarity_score: s.similarity,
                decision: MatchDecision::Match,
                threshold_used: threshold,
            })
            .collect()
    }
}

/// Cosine similarity matcher.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn score(&self, candidate: &Embedding, reference: &Embedding) -> f32 {
        candidate.similarity(reference)
    }
}
