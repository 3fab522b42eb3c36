//! ComplianceLedger: the append-only, hash-chained audit trail.

use thiserror::Error;
use warden_core::AuditEntry;
use warden_store::{ChainReport, Store, StoreError};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger append failed: {0}")]
    Append(#[source] StoreError),
    #[error("ledger read failed: {0}")]
    Read(#[source] StoreError),
}

/// Append access for every component; read access only for the
/// data-subject export and chain verification.
#[derive(Clone)]
pub struct ComplianceLedger {
    store: Store,
}

impl ComplianceLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Append an entry. The caller must not report its operation as done
    /// until this returns `Ok`.
    pub async fn record(&self, entry: AuditEntry) -> Result<AuditEntry, LedgerError> {
        let operation = entry.operation;
        let outcome = entry.outcome;
        let stored = self.store.append_audit(entry).await.map_err(|e| {
            tracing::error!(%operation, %outcome, error = %e, "ledger append failed");
            LedgerError::Append(e)
        })?;
        tracing::debug!(entry_id = %stored.id, %operation, %outcome, "ledger entry recorded");
        Ok(stored)
    }

    /// Recompute the hash chain over every entry.
    pub async fn verify_chain(&self) -> Result<ChainReport, LedgerError> {
        self.store.verify_audit_chain().await.map_err(LedgerError::Read)
    }

    pub(crate) async fn entries_for_subject(
        &self,
        subject_id: &str,
        store_id: &str,
    ) -> Result<Vec<AuditEntry>, LedgerError> {
        self.store
            .audit_for_subject(subject_id, store_id)
            .await
            .map_err(LedgerError::Read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::{AuditOperation, AuditOutcome};

    #[tokio::test]
    async fn test_record_and_verify() {
        let store = Store::open_in_memory().await.unwrap();
        let ledger = ComplianceLedger::new(store);

        for op in [AuditOperation::ConsentCheck, AuditOperation::Extract, AuditOperation::Match] {
            ledger
                .record(AuditEntry::new(op, "op", "store-1").subject(Some("s1")))
                .await
                .unwrap();
        }
        ledger
            .record(
                AuditEntry::new(AuditOperation::Extract, "op", "store-1")
                    .outcome(AuditOutcome::Cancelled),
            )
            .await
            .unwrap();

        let report = ledger.verify_chain().await.unwrap();
        assert_eq!(report.entries, 4);
        assert!(report.is_intact());
        assert_eq!(ledger.entries_for_subject("s1", "store-1").await.unwrap().len(), 3);
    }
}
