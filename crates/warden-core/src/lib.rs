//! warden-core: Biometric data model, consent decisions and similarity.
//!
//! Plaintext embeddings live only in [`Embedding`] values, which are neither
//! serializable nor printable; everything persisted goes through the vault.

pub mod audit;
pub mod cancel;
pub mod consent;
pub mod extractor;
pub mod records;
pub mod types;

pub use audit::{AuditEntry, AuditOperation, AuditOutcome, ConsentStatus};
pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use consent::{
    decide, Decision, LegitimateInterestPolicy, NoLegitimateInterest, PolicyError, StorePolicy,
    StorePolicyTable,
};
pub use extractor::{
    ExtractionError, FeatureExtractor, Features, RawAnalysis, VisionAnalyzer, VisionError,
};
pub use records::{
    BiometricTemplate, ConsentRecord, LegalBasis, Purpose, RiskLevel, TemplateSummary,
    WatchlistCategory, WatchlistDraft, WatchlistEntry,
};
pub use types::{
    CosineMatcher, Embedding, MatchDecision, MatchResult, Matcher, ScoredEntry,
    DEFAULT_MATCH_THRESHOLD,
};
