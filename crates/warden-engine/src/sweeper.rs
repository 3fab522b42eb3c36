//! RetentionSweeper: deletes expired templates and templates whose owner
//! withdrew consent.

use crate::gate::ConsentGate;
use crate::ledger::ComplianceLedger;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use warden_core::{
    AuditEntry, AuditOperation, AuditOutcome, BiometricTemplate, CancelToken, ConsentStatus,
    Purpose,
};
use warden_store::{Store, StoreError};
use warden_vault::TemplateVault;

/// Actor recorded on ledger entries written by the sweeper.
pub const SWEEPER_ACTOR: &str = "retention-sweeper";

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("failed to list sweep candidates: {0}")]
    Store(#[from] StoreError),
}

/// Retention state of one template at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateState {
    Active,
    ExpiringSoon,
    Expired,
    WithdrawalPending,
}

/// Withdrawal wins over expiry so the ledger records why the owner's data went.
pub fn classify(
    template: &BiometricTemplate,
    now: DateTime<Utc>,
    expiring_soon: Duration,
    withdrawn: bool,
) -> TemplateState {
    if withdrawn {
        TemplateState::WithdrawalPending
    } else if template.expires_at <= now {
        TemplateState::Expired
    } else if template.expires_at - now <= expiring_soon {
        TemplateState::ExpiringSoon
    } else {
        TemplateState::Active
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_deleted: usize,
    pub withdrawn_deleted: usize,
    pub expiring_soon: usize,
    pub watchlist_deactivated: usize,
    /// Templates that could not be processed; retried on the next sweep.
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SweepOutcome {
    Completed(SweepReport),
    /// Another sweep was already in flight.
    Skipped,
}

pub struct RetentionSweeper {
    store: Store,
    vault: Arc<TemplateVault>,
    gate: ConsentGate,
    ledger: ComplianceLedger,
    expiring_soon: Duration,
    running: AtomicBool,
}

/// Clears the in-flight flag when a sweep ends, including on early return.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RetentionSweeper {
    pub fn new(
        store: Store,
        vault: Arc<TemplateVault>,
        gate: ConsentGate,
        ledger: ComplianceLedger,
        expiring_soon: Duration,
    ) -> Self {
        Self {
            store,
            vault,
            gate,
            ledger,
            expiring_soon,
            running: AtomicBool::new(false),
        }
    }

    /// One pass over withdrawn owners and expiring templates.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepOutcome, SweepError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::info!("sweep already in flight; skipping");
            return Ok(SweepOutcome::Skipped);
        }
        let _running = RunningGuard(&self.running);

        let mut report = SweepReport::default();
        let mut handled = HashSet::new();

        for (subject_id, store_id) in self.store.withdrawn_subjects(Purpose::BiometricRecognition).await? {
            let decision = match self
                .gate
                .check(&store_id, Some(&subject_id), Purpose::BiometricRecognition)
                .await
            {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(%store_id, error = %e, "consent lookup failed during sweep");
                    report.failed += 1;
                    continue;
                }
            };
            if !decision.is_withdrawn() {
                continue;
            }
            let templates = match self.store.templates_for_subject(&subject_id, &store_id).await {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(%store_id, error = %e, "template lookup failed during sweep");
                    report.failed += 1;
                    continue;
                }
            };
            for template in templates {
                handled.insert(template.id.clone());
                self.remove(&template, TemplateState::WithdrawalPending, &mut report)
                    .await;
            }
        }

        for template in self.store.templates_expiring_before(now + self.expiring_soon).await? {
            if handled.contains(&template.id) {
                continue;
            }
            match classify(&template, now, self.expiring_soon, false) {
                TemplateState::Expired => {
                    self.remove(&template, TemplateState::Expired, &mut report).await;
                }
                TemplateState::ExpiringSoon => {
                    report.expiring_soon += 1;
                    tracing::debug!(template_id = %template.id, expires_at = %template.expires_at, "template expiring soon");
                }
                TemplateState::Active | TemplateState::WithdrawalPending => {}
            }
        }

        tracing::info!(
            expired = report.expired_deleted,
            withdrawn = report.withdrawn_deleted,
            expiring_soon = report.expiring_soon,
            failed = report.failed,
            "retention sweep complete"
        );
        Ok(SweepOutcome::Completed(report))
    }

    /// Sweep on a fixed interval until `shutdown` fires.
    pub async fn run(&self, every: std::time::Duration, shutdown: CancelToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval_secs = every.as_secs(), "retention sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("retention sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sweep_once(Utc::now()).await {
                tracing::warn!(error = %e, "retention sweep failed; retrying next interval");
            }
        }
    }

    /// Watchlist entries go inactive first; the row delete and its erase
    /// entry then commit together. Any failure leaves the template in place
    /// for the next sweep and is recorded as an `error` erase entry.
    async fn remove(&self, template: &BiometricTemplate, state: TemplateState, report: &mut SweepReport) {
        let (consent_status, reason) = match state {
            TemplateState::WithdrawalPending => (ConsentStatus::Denied, "consent_withdrawn"),
            _ => (ConsentStatus::NotRequired, "retention_expired"),
        };

        let deactivated = match self.store.deactivate_watchlist_for_template(&template.id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(template_id = %template.id, error = %e, "watchlist cascade failed; will retry");
                report.failed += 1;
                self.record_failure(template, consent_status, reason).await;
                return;
            }
        };
        report.watchlist_deactivated += deactivated;

        let erased = self
            .vault
            .delete_with_audit(&template.id, |t| {
                erase_entry(t, consent_status).details(serde_json::json!({
                    "template_id": t.id,
                    "reason": reason,
                    "expires_at": t.expires_at,
                    "watchlist_entries_deactivated": deactivated,
                }))
            })
            .await;

        match erased {
            Ok(Some(entry)) => {
                tracing::debug!(template_id = %template.id, entry_id = %entry.id, reason, "template erased");
                match state {
                    TemplateState::WithdrawalPending => report.withdrawn_deleted += 1,
                    _ => report.expired_deleted += 1,
                }
            }
            // Erased concurrently; nothing left to do.
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(template_id = %template.id, error = %e, "template erasure failed; will retry");
                report.failed += 1;
                self.record_failure(template, consent_status, reason).await;
            }
        }
    }

    async fn record_failure(&self, template: &BiometricTemplate, consent_status: ConsentStatus, reason: &str) {
        let entry = erase_entry(template, consent_status)
            .outcome(AuditOutcome::Error)
            .details(serde_json::json!({
                "template_id": template.id,
                "reason": reason,
                "retry": true,
            }));
        if let Err(e) = self.ledger.record(entry).await {
            tracing::error!(template_id = %template.id, error = %e, "failed erase not recorded in ledger");
        }
    }
}

fn erase_entry(template: &BiometricTemplate, consent_status: ConsentStatus) -> AuditEntry {
    AuditEntry::new(AuditOperation::Erase, SWEEPER_ACTOR, &template.store_id)
        .subject(template.subject_id.as_deref())
        .consent(consent_status, Some(template.legal_basis))
}
