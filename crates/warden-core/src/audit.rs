//! Audit entry types for the compliance ledger.

use crate::records::{text_enum, LegalBasis};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Extract,
    Match,
    WatchlistSearch,
    WatchlistUpdate,
    ConsentCheck,
    Erase,
    Export,
}

text_enum!(AuditOperation, "audit operation", {
    Extract => "extract",
    Match => "match",
    WatchlistSearch => "watchlist_search",
    WatchlistUpdate => "watchlist_update",
    ConsentCheck => "consent_check",
    Erase => "erase",
    Export => "export",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentStatus {
    Granted,
    Denied,
    NotRequired,
    Error,
}

text_enum!(ConsentStatus, "consent status", {
    Granted => "granted",
    Denied => "denied",
    NotRequired => "not_required",
    Error => "error",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Denied,
    Error,
    Cancelled,
}

text_enum!(AuditOutcome, "audit outcome", {
    Success => "success",
    Denied => "denied",
    Error => "error",
    Cancelled => "cancelled",
});

/// Append-only ledger record. `details` must never carry biometric data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub operation: AuditOperation,
    pub actor_id: String,
    pub store_id: String,
    pub subject_id: Option<String>,
    pub consent_status: ConsentStatus,
    pub legal_basis: Option<LegalBasis>,
    pub outcome: AuditOutcome,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
    /// Hash of the preceding ledger entry; assigned on append.
    pub prev_hash: Option<String>,
    /// SHA-256 over `prev_hash` and the entry body; assigned on append.
    pub entry_hash: Option<String>,
}

impl AuditEntry {
    /// Start an entry with `not_required` consent status and `success` outcome.
    pub fn new(operation: AuditOperation, actor_id: &str, store_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            actor_id: actor_id.to_string(),
            store_id: store_id.to_string(),
            subject_id: None,
            consent_status: ConsentStatus::NotRequired,
            legal_basis: None,
            outcome: AuditOutcome::Success,
            timestamp: Utc::now(),
            details: serde_json::Value::Null,
            prev_hash: None,
            entry_hash: None,
        }
    }

    pub fn subject(mut self, subject_id: Option<&str>) -> Self {
        self.subject_id = subject_id.map(str::to_string);
        self
    }

    pub fn consent(mut self, status: ConsentStatus, legal_basis: Option<LegalBasis>) -> Self {
        self.consent_status = status;
        self.legal_basis = legal_basis;
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The bytes covered by `entry_hash`: every field except the two hash fields.
    pub fn canonical_body(&self) -> Vec<u8> {
        serde_json::json!({
            "id": self.id,
            "operation": self.operation,
            "actor_id": self.actor_id,
            "store_id": self.store_id,
            "subject_id": self.subject_id,
            "consent_status": self.consent_status,
            "legal_basis": self.legal_basis,
            "outcome": self.outcome,
            "timestamp": self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            "details": self.details,
        })
        .to_string()
        .into_bytes()
    }
}
