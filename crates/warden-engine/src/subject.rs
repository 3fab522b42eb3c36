//! DataSubjectService: right-to-access export and right-to-erasure.

use crate::gate::ConsentGate;
use crate::ledger::{ComplianceLedger, LedgerError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use warden_core::{
    AuditEntry, AuditOperation, AuditOutcome, ConsentRecord, Purpose, TemplateSummary,
    WatchlistEntry,
};
use warden_store::{Store, StoreError};
use warden_vault::{TemplateVault, VaultError};

#[derive(Error, Debug)]
pub enum SubjectError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureReport {
    pub templates_deleted: usize,
    pub watchlist_entries_deactivated: usize,
    /// True when this request stamped `withdrawn_at` on at least one record.
    pub consent_withdrawn: bool,
}

/// Everything held about one subject at one store. Built without decrypting
/// any template.
#[derive(Debug, Clone, Serialize)]
pub struct SubjectReport {
    pub subject_id: String,
    pub store_id: String,
    pub generated_at: DateTime<Utc>,
    pub templates: Vec<TemplateSummary>,
    pub consent_history: Vec<ConsentRecord>,
    pub watchlist: Vec<WatchlistEntry>,
    pub audit_trail: Vec<AuditEntry>,
}

#[derive(Clone)]
pub struct DataSubjectService {
    store: Store,
    vault: Arc<TemplateVault>,
    gate: ConsentGate,
    ledger: ComplianceLedger,
}

impl DataSubjectService {
    pub fn new(
        store: Store,
        vault: Arc<TemplateVault>,
        gate: ConsentGate,
        ledger: ComplianceLedger,
    ) -> Self {
        Self {
            store,
            vault,
            gate,
            ledger,
        }
    }

    /// Delete every template for the subject, deactivate their watchlist
    /// entries, withdraw consent, and record one ledger summary.
    ///
    /// Safe to repeat: a second call deletes nothing and still succeeds. A
    /// failure at any step is recorded as an `error` erase entry carrying the
    /// partial counts.
    pub async fn erase(
        &self,
        subject_id: &str,
        store_id: &str,
        actor_id: &str,
    ) -> Result<ErasureReport, SubjectError> {
        let mut report = ErasureReport::default();
        if let Err(e) = self.erase_all(subject_id, store_id, actor_id, &mut report).await {
            tracing::error!(store_id, error = %e, "erasure incomplete");
            self.record_failure(subject_id, store_id, actor_id, &report).await;
            return Err(e);
        }

        tracing::info!(
            store_id,
            templates_deleted = report.templates_deleted,
            watchlist_deactivated = report.watchlist_entries_deactivated,
            "subject erased"
        );
        Ok(report)
    }

    async fn erase_all(
        &self,
        subject_id: &str,
        store_id: &str,
        actor_id: &str,
        report: &mut ErasureReport,
    ) -> Result<(), SubjectError> {
        for template in self.store.templates_for_subject(subject_id, store_id).await? {
            report.watchlist_entries_deactivated +=
                self.store.deactivate_watchlist_for_template(&template.id).await?;
            if self.vault.delete(&template.id).await? {
                report.templates_deleted += 1;
            }
        }
        report.watchlist_entries_deactivated += self
            .store
            .deactivate_watchlist_for_subject(subject_id, store_id)
            .await?;

        let withdrawn = self
            .gate
            .withdraw_consent(
                Some(subject_id),
                store_id,
                Purpose::BiometricRecognition,
                Utc::now(),
            )
            .await?;
        report.consent_withdrawn = withdrawn > 0;

        self.ledger
            .record(
                AuditEntry::new(AuditOperation::Erase, actor_id, store_id)
                    .subject(Some(subject_id))
                    .details(serde_json::json!({
                        "request": "right_to_erasure",
                        "templates_deleted": report.templates_deleted,
                        "watchlist_entries_deactivated": report.watchlist_entries_deactivated,
                        "consent_withdrawn": report.consent_withdrawn,
                    })),
            )
            .await?;
        Ok(())
    }

    /// Assemble the subject's metadata, consent history, watchlist membership
    /// and audit trail, then record the export itself.
    pub async fn access_report(
        &self,
        subject_id: &str,
        store_id: &str,
        actor_id: &str,
    ) -> Result<SubjectReport, SubjectError> {
        let templates = self
            .store
            .templates_for_subject(subject_id, store_id)
            .await?
            .iter()
            .map(|t| t.summary())
            .collect::<Vec<_>>();
        let consent_history = self.store.consent_history(subject_id, store_id).await?;
        let watchlist = self.store.watchlist_for_subject(subject_id, store_id).await?;
        let audit_trail = self.ledger.entries_for_subject(subject_id, store_id).await?;

        let report = SubjectReport {
            subject_id: subject_id.to_string(),
            store_id: store_id.to_string(),
            generated_at: Utc::now(),
            templates,
            consent_history,
            watchlist,
            audit_trail,
        };

        self.ledger
            .record(
                AuditEntry::new(AuditOperation::Export, actor_id, store_id)
                    .subject(Some(subject_id))
                    .details(serde_json::json!({
                        "request": "subject_access",
                        "templates": report.templates.len(),
                        "consent_records": report.consent_history.len(),
                        "watchlist_entries": report.watchlist.len(),
                        "audit_entries": report.audit_trail.len(),
                    })),
            )
            .await?;
        Ok(report)
    }

    async fn record_failure(&self, subject_id: &str, store_id: &str, actor_id: &str, partial: &ErasureReport) {
        let entry = AuditEntry::new(AuditOperation::Erase, actor_id, store_id)
            .subject(Some(subject_id))
            .outcome(AuditOutcome::Error)
            .details(serde_json::json!({
                "request": "right_to_erasure",
                "templates_deleted": partial.templates_deleted,
                "watchlist_entries_deactivated": partial.watchlist_entries_deactivated,
                "consent_withdrawn": partial.consent_withdrawn,
            }));
        if let Err(e) = self.ledger.record(entry).await {
            tracing::error!(store_id, error = %e, "failed erasure not recorded in ledger");
        }
    }
}
