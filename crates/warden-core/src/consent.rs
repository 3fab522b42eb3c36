//! Consent decisions and the legitimate-interest fallback policy.

use crate::audit::ConsentStatus;
use crate::records::{ConsentRecord, LegalBasis, Purpose};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Outcome of a consent check. Denial is a normal value, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub granted: bool,
    pub legal_basis: Option<LegalBasis>,
    pub reason: String,
    /// Set when the most recent record for the subject has been withdrawn,
    /// even if a fallback basis still grants processing.
    pub withdrawn_at: Option<DateTime<Utc>>,
}

impl Decision {
    pub fn consent_status(&self) -> ConsentStatus {
        if self.granted {
            ConsentStatus::Granted
        } else {
            ConsentStatus::Denied
        }
    }

    pub fn is_withdrawn(&self) -> bool {
        self.withdrawn_at.is_some()
    }
}

/// Decide from the most recent consent record and the store's fallback policy.
pub fn decide(latest: Option<&ConsentRecord>, legitimate_interest: bool) -> Decision {
    let withdrawn_at = latest.and_then(|r| r.withdrawn_at);

    if let Some(record) = latest.filter(|r| r.is_active()) {
        return Decision {
            granted: true,
            legal_basis: Some(record.legal_basis),
            reason: format!("{} on file since {}", record.legal_basis, record.consent_date.date_naive()),
            withdrawn_at: None,
        };
    }

    if legitimate_interest {
        return Decision {
            granted: true,
            legal_basis: Some(LegalBasis::LegitimateInterest),
            reason: "legitimate interest: security processing enabled for store".to_string(),
            withdrawn_at,
        };
    }

    let reason = match withdrawn_at {
        Some(at) => format!("consent withdrawn on {}", at.date_naive()),
        None => "no consent on file".to_string(),
    };
    Decision {
        granted: false,
        legal_basis: None,
        reason,
        withdrawn_at,
    }
}

/// Pluggable predicate for legitimate-interest applicability.
///
/// The legal criteria are policy, so the engine only asks this question.
pub trait LegitimateInterestPolicy: Send + Sync {
    fn applies(&self, store_id: &str, purpose: Purpose) -> bool;
}

/// Policy that never grants on legitimate interest.
pub struct NoLegitimateInterest;

impl LegitimateInterestPolicy for NoLegitimateInterest {
    fn applies(&self, _store_id: &str, _purpose: Purpose) -> bool {
        false
    }
}

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("failed to read policy file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid policy TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Per-store policy, one `[[store]]` table in the policy file.
#[derive(Debug, Clone, Deserialize)]
pub struct StorePolicy {
    pub id: String,
    /// Legitimate-interest flag for security-purpose processing.
    #[serde(default)]
    pub security_processing: bool,
    pub retention_days: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    store: Vec<StorePolicy>,
}

/// Store-configurable policy table loaded from TOML.
#[derive(Debug, Clone, Default)]
pub struct StorePolicyTable {
    stores: HashMap<String, StorePolicy>,
}

impl StorePolicyTable {
    pub fn from_toml(src: &str) -> Result<Self, PolicyError> {
        let file: PolicyFile = toml::from_str(src)?;
        Ok(Self::from_policies(file.store))
    }

    pub fn load(path: &std::path::Path) -> Result<Self, PolicyError> {
        let src = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&src)
    }

    pub fn from_policies(policies: impl IntoIterator<Item = StorePolicy>) -> Self {
        Self {
            stores: policies.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    pub fn get(&self, store_id: &str) -> Option<&StorePolicy> {
        self.stores.get(store_id)
    }

    /// Per-store retention override, if configured.
    pub fn retention_days(&self, store_id: &str) -> Option<u32> {
        self.stores.get(store_id).and_then(|p| p.retention_days)
    }

    /// Every configured retention override, keyed by store id.
    pub fn retention_overrides(&self) -> HashMap<String, u32> {
        self.stores
            .values()
            .filter_map(|p| p.retention_days.map(|days| (p.id.clone(), days)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

impl LegitimateInterestPolicy for StorePolicyTable {
    fn applies(&self, store_id: &str, purpose: Purpose) -> bool {
        match purpose {
            Purpose::BiometricRecognition => self
                .stores
                .get(store_id)
                .map(|p| p.security_processing)
                .unwrap_or(false),
        }
    }
}
