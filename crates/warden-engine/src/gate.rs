//! ConsentGate: looks up the latest consent record and applies the store's
//! legitimate-interest fallback.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use warden_core::{decide, ConsentRecord, Decision, LegalBasis, LegitimateInterestPolicy, Purpose};
use warden_store::{Store, StoreError};

#[derive(Clone)]
pub struct ConsentGate {
    store: Store,
    policy: Arc<dyn LegitimateInterestPolicy>,
}

impl ConsentGate {
    pub fn new(store: Store, policy: Arc<dyn LegitimateInterestPolicy>) -> Self {
        Self { store, policy }
    }

    /// Decide whether processing may proceed. Denial is `Ok`; only store
    /// faults are errors.
    pub async fn check(
        &self,
        store_id: &str,
        subject_id: Option<&str>,
        purpose: Purpose,
    ) -> Result<Decision, StoreError> {
        let latest = self.store.latest_consent(subject_id, store_id, purpose).await?;
        let decision = decide(latest.as_ref(), self.policy.applies(store_id, purpose));
        tracing::debug!(
            store_id,
            subject_id = subject_id.unwrap_or("<visitor>"),
            granted = decision.granted,
            "consent checked"
        );
        Ok(decision)
    }

    /// Append a new consent record. Never modifies an existing one.
    pub async fn record_consent(
        &self,
        subject_id: Option<&str>,
        store_id: &str,
        purpose: Purpose,
        legal_basis: LegalBasis,
        at: DateTime<Utc>,
    ) -> Result<ConsentRecord, StoreError> {
        let record = ConsentRecord::new(subject_id, store_id, purpose, true, legal_basis, at);
        self.store.insert_consent(record.clone()).await?;
        tracing::info!(store_id, consent_id = %record.id, "consent recorded");
        Ok(record)
    }

    /// Stamp `withdrawn_at` on active records. Returns how many changed.
    pub async fn withdraw_consent(
        &self,
        subject_id: Option<&str>,
        store_id: &str,
        purpose: Purpose,
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let n = self.store.withdraw_consent(subject_id, store_id, purpose, at).await?;
        if n > 0 {
            tracing::info!(store_id, records = n, "consent withdrawn");
        }
        Ok(n)
    }
}
