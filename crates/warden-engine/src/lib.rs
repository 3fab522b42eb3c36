//! warden-engine: Consent-gated recognition workflows.
//!
//! Components are constructed once and shared by handle: [`ConsentGate`],
//! [`ComplianceLedger`] and the vault are injected into [`MatchEngine`],
//! [`RetentionSweeper`] and [`DataSubjectService`]. [`RecognitionService`]
//! wires them together and exposes the operations callers use.

pub mod gate;
pub mod ledger;
pub mod matching;
pub mod service;
pub mod subject;
pub mod sweeper;

pub use gate::ConsentGate;
pub use ledger::{ComplianceLedger, LedgerError};
pub use matching::{MatchEngine, MatchError, MatchScan};
pub use service::{
    EnrollOutcome, IdentifyOutcome, OperationContext, RecognitionService, ServiceError,
    WatchlistOutcome, WatchlistStats, PROCESSING_UNAVAILABLE,
};
pub use subject::{DataSubjectService, ErasureReport, SubjectError, SubjectReport};
pub use sweeper::{
    classify, RetentionSweeper, SweepError, SweepOutcome, SweepReport, TemplateState,
    SWEEPER_ACTOR,
};

use std::collections::HashMap;
use warden_core::DEFAULT_MATCH_THRESHOLD;

pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_EXPIRING_SOON_HOURS: i64 = 72;

/// Resolved engine knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_threshold: f32,
    pub retention_days: u32,
    /// Per-store retention overrides.
    pub retention_overrides: HashMap<String, u32>,
    /// Window before `expires_at` in which a template counts as expiring soon.
    pub expiring_soon: chrono::Duration,
    /// Keep unmatched identify captures as unidentified templates.
    pub retain_identify_captures: bool,
}

impl EngineConfig {
    pub fn retention_days_for(&self, store_id: &str) -> u32 {
        self.retention_overrides
            .get(store_id)
            .copied()
            .unwrap_or(self.retention_days)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_threshold: DEFAULT_MATCH_THRESHOLD,
            retention_days: DEFAULT_RETENTION_DAYS,
            retention_overrides: HashMap::new(),
            expiring_soon: chrono::Duration::hours(DEFAULT_EXPIRING_SOON_HOURS),
            retain_identify_captures: false,
        }
    }
}
