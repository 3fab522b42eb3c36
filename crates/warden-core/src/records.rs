//! Persistent records: templates, watchlist entries, consent records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Snake-case string mapping shared by the enums persisted as TEXT columns.
macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::records::ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err($crate::records::ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}
pub(crate) use text_enum;

/// Regulatory justification for biometric processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegalBasis {
    Consent,
    LegitimateInterest,
    LegalObligation,
}

text_enum!(LegalBasis, "legal basis", {
    Consent => "consent",
    LegitimateInterest => "legitimate_interest",
    LegalObligation => "legal_obligation",
});

/// Processing purpose a consent record covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    BiometricRecognition,
}

text_enum!(Purpose, "purpose", {
    BiometricRecognition => "biometric_recognition",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchlistCategory {
    SecurityThreat,
    BannedIndividual,
    PersonOfInterest,
}

text_enum!(WatchlistCategory, "watchlist category", {
    SecurityThreat => "security_threat",
    BannedIndividual => "banned_individual",
    PersonOfInterest => "person_of_interest",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

text_enum!(RiskLevel, "risk level", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

/// A single encrypted embedding.
///
/// `ciphertext` is only ever opened by the template vault; `Debug` omits it.
#[derive(Clone)]
pub struct BiometricTemplate {
    pub id: String,
    /// `None` means an unidentified capture.
    pub subject_id: Option<String>,
    pub store_id: String,
    pub ciphertext: Vec<u8>,
    pub key_id: String,
    /// Extractor identifier/version.
    pub algorithm: String,
    /// Extractor-reported confidence in [0, 1].
    pub quality_score: f32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub legal_basis: LegalBasis,
    /// Set once at creation.
    pub consent_verified: bool,
}

impl fmt::Debug for BiometricTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BiometricTemplate")
            .field("id", &self.id)
            .field("subject_id", &self.subject_id)
            .field("store_id", &self.store_id)
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl BiometricTemplate {
    /// Metadata view, safe for reports and responses.
    pub fn summary(&self) -> TemplateSummary {
        TemplateSummary {
            id: self.id.clone(),
            subject_id: self.subject_id.clone(),
            store_id: self.store_id.clone(),
            key_id: self.key_id.clone(),
            algorithm: self.algorithm.clone(),
            quality_score: self.quality_score,
            created_at: self.created_at,
            expires_at: self.expires_at,
            legal_basis: self.legal_basis,
            consent_verified: self.consent_verified,
        }
    }
}

/// Template metadata without the encrypted payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSummary {
    pub id: String,
    pub subject_id: Option<String>,
    pub store_id: String,
    pub key_id: String,
    pub algorithm: String,
    pub quality_score: f32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub legal_basis: LegalBasis,
    pub consent_verified: bool,
}

/// A named reference used for matching. Owns exactly one template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub id: String,
    pub store_id: String,
    pub subject_id: Option<String>,
    pub display_name: String,
    pub category: WatchlistCategory,
    pub risk_level: RiskLevel,
    pub template_id: String,
    pub added_by: String,
    pub added_at: DateTime<Utc>,
    /// Inactive entries are excluded from matching but never deleted.
    pub is_active: bool,
    /// Reference to the authorizing policy or order.
    pub legal_authorization: Option<String>,
}

/// Caller-supplied fields for a new watchlist entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistDraft {
    pub subject_id: Option<String>,
    pub display_name: String,
    pub category: WatchlistCategory,
    pub risk_level: RiskLevel,
    pub legal_authorization: Option<String>,
}

/// Legal-basis ledger row per (subject-or-visitor-class, store, purpose).
///
/// `withdrawn_at` is never unset; re-consent creates a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub id: String,
    /// `None` for the anonymous visitor class.
    pub subject_id: Option<String>,
    pub store_id: String,
    pub purpose: Purpose,
    pub consent_given: bool,
    pub legal_basis: LegalBasis,
    pub consent_date: DateTime<Utc>,
    pub withdrawn_at: Option<DateTime<Utc>>,
}

impl ConsentRecord {
    pub fn new(
        subject_id: Option<&str>,
        store_id: &str,
        purpose: Purpose,
        consent_given: bool,
        legal_basis: LegalBasis,
        consent_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject_id: subject_id.map(str::to_string),
            store_id: store_id.to_string(),
            purpose,
            consent_given,
            legal_basis,
            consent_date,
            withdrawn_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.consent_given && self.withdrawn_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_text_enum_roundtrip() {
        for basis in [
            LegalBasis::Consent,
            LegalBasis::LegitimateInterest,
            LegalBasis::LegalObligation,
        ] {
            assert_eq!(LegalBasis::from_str(basis.as_str()).unwrap(), basis);
        }
        assert_eq!(
            WatchlistCategory::from_str("banned_individual").unwrap(),
            WatchlistCategory::BannedIndividual
        );
    }

    #[test]
    fn test_text_enum_unknown() {
        let err = RiskLevel::from_str("extreme").unwrap_err();
        assert_eq!(err.kind, "risk level");
        assert_eq!(err.to_string(), "unknown risk level: \"extreme\"");
    }

    #[test]
    fn test_serde_matches_text_form() {
        let json = serde_json::to_string(&LegalBasis::LegitimateInterest).unwrap();
        assert_eq!(json, "\"legitimate_interest\"");
    }

    #[test]
    fn test_template_debug_omits_ciphertext() {
        let t = BiometricTemplate {
            id: "t1".into(),
            subject_id: None,
            store_id: "s1".into(),
            ciphertext: vec![0xde, 0xad, 0xbe, 0xef],
            key_id: "k1".into(),
            algorithm: "w600k_r50".into(),
            quality_score: 0.9,
            created_at: Utc::now(),
            expires_at: Utc::now(),
            legal_basis: LegalBasis::Consent,
            consent_verified: true,
        };
        let dbg = format!("{t:?}");
        assert!(!dbg.contains("ciphertext"));
        assert_eq!(t.summary().key_id, "k1");
    }

    #[test]
    fn test_consent_record_active() {
        let mut r = ConsentRecord::new(
            Some("sub"),
            "store",
            Purpose::BiometricRecognition,
            true,
            LegalBasis::Consent,
            Utc::now(),
        );
        assert!(r.is_active());
        r.withdrawn_at = Some(Utc::now());
        assert!(!r.is_active());
    }
}
