//! RecognitionService: the operations exposed to the rest of the system.
//!
//! Every operation passes the consent gate before any extraction, and every
//! gate decision, success, failure and cancellation lands in the ledger.
//! Business outcomes (denial, no match) are `Ok` values; `Err` is reserved
//! for faults and cancellation.

use crate::gate::ConsentGate;
use crate::ledger::{ComplianceLedger, LedgerError};
use crate::matching::{MatchEngine, MatchError, MatchScan};
use crate::subject::{DataSubjectService, ErasureReport, SubjectError, SubjectReport};
use crate::sweeper::{RetentionSweeper, SweepError, SweepOutcome};
use crate::EngineConfig;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use warden_core::{
    AuditEntry, AuditOperation, AuditOutcome, BiometricTemplate, CancelToken, ConsentRecord,
    ConsentStatus, Decision, ExtractionError, FeatureExtractor, Features, LegalBasis,
    LegitimateInterestPolicy, MatchResult, Purpose, TemplateSummary, WatchlistDraft,
    WatchlistEntry,
};
use warden_store::{ChainReport, Store, StoreError};
use warden_vault::{KeyManager, NewTemplate, TemplateVault, VaultError};

/// User-visible text for every infrastructure fault.
pub const PROCESSING_UNAVAILABLE: &str = "processing unavailable";

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("consent denied: {0}")]
    ConsentDenied(String),
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("invalid vision response: {0}")]
    InvalidResponse(String),
    #[error("vision service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("template {template_id} could not be decrypted")]
    Decryption { template_id: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("vault error: {0}")]
    Vault(VaultError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ServiceError {
    /// Text safe to hand to the caller. Never carries vendor or store error text.
    pub fn public_message(&self) -> String {
        match self {
            ServiceError::ConsentDenied(reason) => reason.clone(),
            ServiceError::InvalidImage(_) => "invalid image".to_string(),
            ServiceError::InvalidResponse(_) => "image could not be analysed".to_string(),
            ServiceError::Cancelled => "request cancelled".to_string(),
            ServiceError::NotFound(what) => format!("not found: {what}"),
            ServiceError::InvalidRequest(msg) => msg.clone(),
            ServiceError::ServiceUnavailable(_)
            | ServiceError::Decryption { .. }
            | ServiceError::Store(_)
            | ServiceError::Vault(_)
            | ServiceError::Ledger(_) => PROCESSING_UNAVAILABLE.to_string(),
        }
    }

    /// Only transient vision-service faults are worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::ServiceUnavailable(_))
    }

    fn is_infrastructure(&self) -> bool {
        self.public_message() == PROCESSING_UNAVAILABLE
    }
}

impl From<ExtractionError> for ServiceError {
    fn from(e: ExtractionError) -> Self {
        match e {
            ExtractionError::InvalidImage(m) => ServiceError::InvalidImage(m),
            ExtractionError::InvalidResponse(m) => ServiceError::InvalidResponse(m),
            ExtractionError::ServiceUnavailable(m) => ServiceError::ServiceUnavailable(m),
            ExtractionError::Cancelled => ServiceError::Cancelled,
        }
    }
}

impl From<VaultError> for ServiceError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::Decryption { template_id } => ServiceError::Decryption { template_id },
            VaultError::NotFound(id) => ServiceError::NotFound(id),
            VaultError::RetentionShortened { template_id } => ServiceError::InvalidRequest(format!(
                "retention for template {template_id} can only be extended"
            )),
            VaultError::Store(e) => ServiceError::Store(e),
            other => ServiceError::Vault(other),
        }
    }
}

impl From<MatchError> for ServiceError {
    fn from(e: MatchError) -> Self {
        match e {
            MatchError::Candidate(v) => v.into(),
            MatchError::Cancelled => ServiceError::Cancelled,
            MatchError::Store(s) => ServiceError::Store(s),
        }
    }
}

impl From<SubjectError> for ServiceError {
    fn from(e: SubjectError) -> Self {
        match e {
            SubjectError::Store(s) => ServiceError::Store(s),
            SubjectError::Vault(v) => v.into(),
            SubjectError::Ledger(l) => ServiceError::Ledger(l),
        }
    }
}

impl From<SweepError> for ServiceError {
    fn from(e: SweepError) -> Self {
        match e {
            SweepError::Store(s) => ServiceError::Store(s),
        }
    }
}

/// Who is asking, for which store, about whom.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub store_id: String,
    pub subject_id: Option<String>,
    pub actor_id: String,
}

impl OperationContext {
    pub fn new(store_id: &str, actor_id: &str) -> Self {
        Self {
            store_id: store_id.to_string(),
            subject_id: None,
            actor_id: actor_id.to_string(),
        }
    }

    pub fn subject(mut self, subject_id: Option<&str>) -> Self {
        self.subject_id = subject_id.map(str::to_string);
        self
    }

    fn audit(&self, operation: AuditOperation) -> AuditEntry {
        AuditEntry::new(operation, &self.actor_id, &self.store_id).subject(self.subject_id.as_deref())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnrollOutcome {
    Enrolled { template: TemplateSummary },
    Denied { reason: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IdentifyOutcome {
    Completed {
        matches: Vec<MatchResult>,
        skipped: usize,
        threshold: f32,
        /// Set when an unmatched capture was kept as an unidentified template.
        retained_template_id: Option<String>,
    },
    Denied { reason: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WatchlistOutcome {
    Added { entry: WatchlistEntry },
    Denied { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchlistStats {
    pub store_id: String,
    pub active: u64,
    pub inactive: u64,
    pub by_category: BTreeMap<String, u64>,
}

pub struct RecognitionService {
    store: Store,
    gate: ConsentGate,
    extractor: FeatureExtractor,
    vault: Arc<TemplateVault>,
    matcher: MatchEngine,
    ledger: ComplianceLedger,
    sweeper: Arc<RetentionSweeper>,
    subjects: DataSubjectService,
    config: EngineConfig,
}

impl RecognitionService {
    /// Wire every component over one store handle.
    pub fn new(
        store: Store,
        keys: Arc<dyn KeyManager>,
        policy: Arc<dyn LegitimateInterestPolicy>,
        extractor: FeatureExtractor,
        config: EngineConfig,
    ) -> Self {
        let vault = Arc::new(TemplateVault::new(store.clone(), keys));
        let gate = ConsentGate::new(store.clone(), policy);
        let ledger = ComplianceLedger::new(store.clone());
        let matcher = MatchEngine::new(store.clone(), vault.clone());
        let sweeper = Arc::new(RetentionSweeper::new(
            store.clone(),
            vault.clone(),
            gate.clone(),
            ledger.clone(),
            config.expiring_soon,
        ));
        let subjects =
            DataSubjectService::new(store.clone(), vault.clone(), gate.clone(), ledger.clone());
        Self {
            store,
            gate,
            extractor,
            vault,
            matcher,
            ledger,
            sweeper,
            subjects,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn vault(&self) -> &Arc<TemplateVault> {
        &self.vault
    }

    pub fn sweeper(&self) -> Arc<RetentionSweeper> {
        self.sweeper.clone()
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    // --- Consent ---

    pub async fn check_consent(&self, ctx: &OperationContext) -> Result<Decision, ServiceError> {
        let decision = self.decide(ctx).await?;
        self.ledger
            .record(
                ctx.audit(AuditOperation::ConsentCheck)
                    .consent(decision.consent_status(), decision.legal_basis)
                    .outcome(outcome_for(&decision))
                    .details(serde_json::json!({ "reason": decision.reason })),
            )
            .await?;
        Ok(decision)
    }

    pub async fn record_consent(
        &self,
        ctx: &OperationContext,
        legal_basis: LegalBasis,
    ) -> Result<ConsentRecord, ServiceError> {
        let record = self
            .gate
            .record_consent(
                ctx.subject_id.as_deref(),
                &ctx.store_id,
                Purpose::BiometricRecognition,
                legal_basis,
                Utc::now(),
            )
            .await
            .map_err(|e| self.fault("record_consent", e.into()))?;
        self.ledger
            .record(
                ctx.audit(AuditOperation::ConsentCheck)
                    .consent(ConsentStatus::Granted, Some(legal_basis))
                    .details(serde_json::json!({ "action": "grant", "consent_id": record.id })),
            )
            .await?;
        Ok(record)
    }

    /// Returns how many records were withdrawn. The sweeper removes the
    /// subject's templates on its next pass.
    pub async fn withdraw_consent(&self, ctx: &OperationContext) -> Result<usize, ServiceError> {
        let n = self
            .gate
            .withdraw_consent(
                ctx.subject_id.as_deref(),
                &ctx.store_id,
                Purpose::BiometricRecognition,
                Utc::now(),
            )
            .await
            .map_err(|e| self.fault("withdraw_consent", e.into()))?;
        self.ledger
            .record(
                ctx.audit(AuditOperation::ConsentCheck)
                    .consent(ConsentStatus::Denied, None)
                    .details(serde_json::json!({ "action": "withdraw", "records": n })),
            )
            .await?;
        Ok(n)
    }

    // --- Enrollment and identification ---

    /// Gate, extract, seal and persist one template. The template and its
    /// ledger entry are written in one transaction; a cancelled or failed
    /// request leaves no template behind.
    pub async fn enroll(
        &self,
        image: &[u8],
        ctx: &OperationContext,
        legal_basis: Option<LegalBasis>,
        cancel: &CancelToken,
    ) -> Result<EnrollOutcome, ServiceError> {
        let decision = self.decide(ctx).await?;
        if let Some(reason) = self.denial(&decision, legal_basis) {
            self.record_denial(ctx, AuditOperation::Extract, &decision, &reason).await?;
            return Ok(EnrollOutcome::Denied { reason });
        }

        let features = self.extract(image, ctx, AuditOperation::Extract, &decision, cancel).await?;
        if cancel.is_cancelled() {
            return Err(self.cancelled(ctx, AuditOperation::Extract, &decision).await);
        }

        let meta = self.template_meta(ctx, &decision, features.quality);
        let stored = self
            .vault
            .store_with_audit(meta, &features.embedding, |t| {
                ctx.audit(AuditOperation::Extract)
                    .consent(decision.consent_status(), decision.legal_basis)
                    .details(serde_json::json!({
                        "template_id": t.id,
                        "algorithm": t.algorithm,
                        "quality": t.quality_score,
                        "expires_at": t.expires_at,
                    }))
            })
            .await;
        // The template and its entry rolled back together; the error entry
        // is a separate append.
        let template = match stored {
            Ok((template, _)) => template,
            Err(e) => return Err(self.failed(ctx, AuditOperation::Extract, &decision, e.into()).await),
        };

        Ok(EnrollOutcome::Enrolled {
            template: template.summary(),
        })
    }

    /// Extract a capture and search the store's watchlist with it.
    pub async fn identify(
        &self,
        image: &[u8],
        ctx: &OperationContext,
        threshold: Option<f32>,
        cancel: &CancelToken,
    ) -> Result<IdentifyOutcome, ServiceError> {
        let threshold = self.threshold(threshold)?;
        let op = AuditOperation::WatchlistSearch;

        let decision = self.decide(ctx).await?;
        if !decision.granted {
            self.record_denial(ctx, op, &decision, &decision.reason).await?;
            return Ok(IdentifyOutcome::Denied {
                reason: decision.reason,
            });
        }

        let features = self.extract(image, ctx, op, &decision, cancel).await?;
        let meta = self.template_meta(ctx, &decision, features.quality);
        let candidate = match self.vault.seal(meta, &features.embedding).await {
            Ok(candidate) => candidate,
            Err(e) => return Err(self.failed(ctx, op, &decision, e.into()).await),
        };

        let scan = match self
            .matcher
            .match_against_watchlist(&candidate, &ctx.store_id, threshold, cancel)
            .await
        {
            Ok(scan) => scan,
            Err(MatchError::Cancelled) => return Err(self.cancelled(ctx, op, &decision).await),
            Err(e) => return Err(self.failed(ctx, op, &decision, e.into()).await),
        };

        let retained_template_id = if scan.results.is_empty() && self.config.retain_identify_captures {
            self.retain_capture(ctx, &decision, &candidate).await
        } else {
            None
        };

        self.ledger
            .record(
                ctx.audit(op)
                    .consent(decision.consent_status(), decision.legal_basis)
                    .details(serde_json::json!({
                        "matches": match_summary(&scan.results),
                        "scanned": scan.scanned,
                        "skipped": scan.skipped,
                        "threshold": threshold,
                        "retained_template_id": retained_template_id,
                    })),
            )
            .await?;

        Ok(IdentifyOutcome::Completed {
            matches: scan.results,
            skipped: scan.skipped,
            threshold,
            retained_template_id,
        })
    }

    /// Re-run watchlist matching for a stored template. A template that fails
    /// to decrypt is audited and returned as an error, never skipped.
    pub async fn match_template(
        &self,
        template_id: &str,
        actor_id: &str,
        threshold: Option<f32>,
        cancel: &CancelToken,
    ) -> Result<MatchScan, ServiceError> {
        let threshold = self.threshold(threshold)?;
        let template = self
            .store
            .get_template(template_id)
            .await
            .map_err(|e| self.fault("match_template", e.into()))?
            .ok_or_else(|| ServiceError::NotFound(template_id.to_string()))?;
        let ctx = OperationContext::new(&template.store_id, actor_id).subject(template.subject_id.as_deref());
        let op = AuditOperation::Match;

        let decision = self.decide(&ctx).await?;
        if !decision.granted {
            self.record_denial(&ctx, op, &decision, &decision.reason).await?;
            return Err(ServiceError::ConsentDenied(decision.reason));
        }

        let scan = match self
            .matcher
            .match_against_watchlist(&template, &template.store_id, threshold, cancel)
            .await
        {
            Ok(scan) => scan,
            Err(MatchError::Cancelled) => return Err(self.cancelled(&ctx, op, &decision).await),
            Err(e) => return Err(self.failed(&ctx, op, &decision, e.into()).await),
        };

        self.ledger
            .record(
                ctx.audit(op)
                    .consent(decision.consent_status(), decision.legal_basis)
                    .details(serde_json::json!({
                        "template_id": template.id,
                        "matches": match_summary(&scan.results),
                        "skipped": scan.skipped,
                        "threshold": threshold,
                    })),
            )
            .await?;
        Ok(scan)
    }

    // --- Data-subject requests ---

    pub async fn erase_subject(
        &self,
        subject_id: &str,
        ctx: &OperationContext,
    ) -> Result<ErasureReport, ServiceError> {
        self.subjects
            .erase(subject_id, &ctx.store_id, &ctx.actor_id)
            .await
            .map_err(|e| self.fault("erase_subject", e.into()))
    }

    pub async fn export_subject_report(
        &self,
        subject_id: &str,
        ctx: &OperationContext,
    ) -> Result<SubjectReport, ServiceError> {
        self.subjects
            .access_report(subject_id, &ctx.store_id, &ctx.actor_id)
            .await
            .map_err(|e| self.fault("export_subject_report", e.into()))
    }

    // --- Watchlist ---

    /// Enroll a watchlist reference. A `legal_authorization` reference grants
    /// processing under legal obligation; otherwise the consent gate decides.
    pub async fn add_to_watchlist(
        &self,
        image: &[u8],
        draft: WatchlistDraft,
        ctx: &OperationContext,
        cancel: &CancelToken,
    ) -> Result<WatchlistOutcome, ServiceError> {
        let ctx = ctx.clone().subject(draft.subject_id.as_deref());
        let op = AuditOperation::WatchlistUpdate;

        let decision = match draft.legal_authorization.as_deref().map(str::trim) {
            Some(reference) if !reference.is_empty() => Decision {
                granted: true,
                legal_basis: Some(LegalBasis::LegalObligation),
                reason: format!("legal authorization {reference}"),
                withdrawn_at: None,
            },
            _ => self.decide(&ctx).await?,
        };
        if !decision.granted {
            self.record_denial(&ctx, op, &decision, &decision.reason).await?;
            return Ok(WatchlistOutcome::Denied {
                reason: decision.reason,
            });
        }

        let features = self.extract(image, &ctx, op, &decision, cancel).await?;
        if cancel.is_cancelled() {
            return Err(self.cancelled(&ctx, op, &decision).await);
        }

        let meta = self.template_meta(&ctx, &decision, features.quality);
        let stored = self
            .vault
            .store_watchlist_reference(meta, &features.embedding, |t| {
                let entry = WatchlistEntry {
                    id: uuid::Uuid::new_v4().to_string(),
                    store_id: ctx.store_id.clone(),
                    subject_id: draft.subject_id.clone(),
                    display_name: draft.display_name.clone(),
                    category: draft.category,
                    risk_level: draft.risk_level,
                    template_id: t.id.clone(),
                    added_by: ctx.actor_id.clone(),
                    added_at: Utc::now(),
                    is_active: true,
                    legal_authorization: draft.legal_authorization.clone(),
                };
                let audit = ctx
                    .audit(op)
                    .consent(decision.consent_status(), decision.legal_basis)
                    .details(serde_json::json!({
                        "action": "add",
                        "entry_id": entry.id,
                        "template_id": t.id,
                        "category": entry.category,
                        "risk_level": entry.risk_level,
                    }));
                (entry, audit)
            })
            .await;
        let entry = match stored {
            Ok((_, entry, _)) => entry,
            Err(e) => return Err(self.failed(&ctx, op, &decision, e.into()).await),
        };

        Ok(WatchlistOutcome::Added { entry })
    }

    /// Take an entry out of matching. The row and its template remain.
    pub async fn deactivate_watchlist_entry(
        &self,
        entry_id: &str,
        actor_id: &str,
    ) -> Result<bool, ServiceError> {
        let entry = self
            .store
            .get_watchlist_entry(entry_id)
            .await
            .map_err(|e| self.fault("deactivate_watchlist_entry", e.into()))?
            .ok_or_else(|| ServiceError::NotFound(entry_id.to_string()))?;
        let changed = self
            .store
            .deactivate_watchlist_entry(entry_id)
            .await
            .map_err(|e| self.fault("deactivate_watchlist_entry", e.into()))?;

        self.ledger
            .record(
                OperationContext::new(&entry.store_id, actor_id)
                    .subject(entry.subject_id.as_deref())
                    .audit(AuditOperation::WatchlistUpdate)
                    .details(serde_json::json!({
                        "action": "deactivate",
                        "entry_id": entry.id,
                        "changed": changed,
                    })),
            )
            .await?;
        Ok(changed)
    }

    pub async fn watchlist_stats(&self, store_id: &str) -> Result<WatchlistStats, ServiceError> {
        let counts = self
            .store
            .watchlist_counts(store_id)
            .await
            .map_err(|e| self.fault("watchlist_stats", e.into()))?;
        Ok(WatchlistStats {
            store_id: store_id.to_string(),
            active: counts.active,
            inactive: counts.inactive,
            by_category: counts.by_category,
        })
    }

    // --- Maintenance ---

    pub async fn sweep_now(&self) -> Result<SweepOutcome, ServiceError> {
        self.sweeper
            .sweep_once(Utc::now())
            .await
            .map_err(|e| self.fault("sweep_now", e.into()))
    }

    pub async fn verify_ledger(&self) -> Result<ChainReport, ServiceError> {
        self.ledger
            .verify_chain()
            .await
            .map_err(|e| self.fault("verify_ledger", e.into()))
    }

    // --- Internals ---

    async fn decide(&self, ctx: &OperationContext) -> Result<Decision, ServiceError> {
        self.gate
            .check(&ctx.store_id, ctx.subject_id.as_deref(), Purpose::BiometricRecognition)
            .await
            .map_err(|e| self.fault("consent_check", e.into()))
    }

    /// Reason to refuse, if the gate denied or granted a different basis
    /// than the caller asserted.
    fn denial(&self, decision: &Decision, requested: Option<LegalBasis>) -> Option<String> {
        if !decision.granted {
            return Some(decision.reason.clone());
        }
        match (requested, decision.legal_basis) {
            (Some(requested), Some(granted)) if requested != granted => Some(format!(
                "requested legal basis {requested} not established; {granted} applies"
            )),
            _ => None,
        }
    }

    async fn extract(
        &self,
        image: &[u8],
        ctx: &OperationContext,
        op: AuditOperation,
        decision: &Decision,
        cancel: &CancelToken,
    ) -> Result<Features, ServiceError> {
        match self.extractor.extract(image, cancel).await {
            Ok(features) => Ok(features),
            Err(ExtractionError::Cancelled) => Err(self.cancelled(ctx, op, decision).await),
            Err(e) => Err(self.failed(ctx, op, decision, e.into()).await),
        }
    }

    fn template_meta<'a>(
        &self,
        ctx: &'a OperationContext,
        decision: &Decision,
        quality: f32,
    ) -> NewTemplate<'a> {
        NewTemplate {
            subject_id: ctx.subject_id.as_deref(),
            store_id: &ctx.store_id,
            legal_basis: decision.legal_basis.unwrap_or(LegalBasis::Consent),
            quality_score: quality,
            consent_verified: decision.legal_basis == Some(LegalBasis::Consent),
            retention_days: self.config.retention_days_for(&ctx.store_id),
        }
    }

    fn threshold(&self, requested: Option<f32>) -> Result<f32, ServiceError> {
        let threshold = requested.unwrap_or(self.config.default_threshold);
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(ServiceError::InvalidRequest(format!(
                "threshold {threshold} outside [0, 1]"
            )));
        }
        Ok(threshold)
    }

    /// Keep an unmatched capture. The template row and its own extract entry
    /// commit together; a failure only costs the retention.
    async fn retain_capture(
        &self,
        ctx: &OperationContext,
        decision: &Decision,
        candidate: &BiometricTemplate,
    ) -> Option<String> {
        let entry = ctx
            .audit(AuditOperation::Extract)
            .consent(decision.consent_status(), decision.legal_basis)
            .details(serde_json::json!({
                "action": "retain_capture",
                "template_id": candidate.id,
                "algorithm": candidate.algorithm,
                "quality": candidate.quality_score,
                "expires_at": candidate.expires_at,
            }));
        match self.vault.persist_with_audit(candidate, entry).await {
            Ok(_) => Some(candidate.id.clone()),
            Err(e) => {
                tracing::warn!(error = %e, "unmatched capture not retained");
                None
            }
        }
    }

    async fn record_denial(
        &self,
        ctx: &OperationContext,
        op: AuditOperation,
        decision: &Decision,
        reason: &str,
    ) -> Result<(), ServiceError> {
        self.ledger
            .record(
                ctx.audit(op)
                    .consent(ConsentStatus::Denied, decision.legal_basis)
                    .outcome(AuditOutcome::Denied)
                    .details(serde_json::json!({ "reason": reason })),
            )
            .await?;
        Ok(())
    }

    /// Record a cancellation. Cancellation is not a failure.
    async fn cancelled(&self, ctx: &OperationContext, op: AuditOperation, decision: &Decision) -> ServiceError {
        let entry = ctx
            .audit(op)
            .consent(decision.consent_status(), decision.legal_basis)
            .outcome(AuditOutcome::Cancelled);
        match self.ledger.record(entry).await {
            Ok(_) => ServiceError::Cancelled,
            Err(e) => e.into(),
        }
    }

    /// Record a failed operation and hand back the error to return.
    async fn failed(
        &self,
        ctx: &OperationContext,
        op: AuditOperation,
        decision: &Decision,
        err: ServiceError,
    ) -> ServiceError {
        let err = self.fault(op.as_str(), err);
        let entry = ctx
            .audit(op)
            .consent(decision.consent_status(), decision.legal_basis)
            .outcome(AuditOutcome::Error)
            .details(serde_json::json!({ "error": error_kind(&err) }));
        match self.ledger.record(entry).await {
            Ok(_) => err,
            Err(e) => e.into(),
        }
    }

    /// Log infrastructure faults with their internal text; pass the error on.
    fn fault(&self, operation: &str, err: ServiceError) -> ServiceError {
        if err.is_infrastructure() {
            tracing::error!(operation, error = %err, "operation failed");
        } else {
            tracing::info!(operation, error = %err, "operation rejected");
        }
        err
    }
}

fn outcome_for(decision: &Decision) -> AuditOutcome {
    if decision.granted {
        AuditOutcome::Success
    } else {
        AuditOutcome::Denied
    }
}

/// Ledger form of a match list: entry ids and scores only.
fn match_summary(results: &[MatchResult]) -> serde_json::Value {
    results
        .iter()
        .map(|r| serde_json::json!({ "entry_id": r.watchlist_entry_id, "score": r.similarity_score }))
        .collect()
}

/// Stable, non-vendor label for a failure, for ledger details.
fn error_kind(err: &ServiceError) -> &'static str {
    match err {
        ServiceError::ConsentDenied(_) => "consent_denied",
        ServiceError::InvalidImage(_) => "invalid_image",
        ServiceError::InvalidResponse(_) => "invalid_response",
        ServiceError::ServiceUnavailable(_) => "service_unavailable",
        ServiceError::Cancelled => "cancelled",
        ServiceError::Decryption { .. } => "decryption_failed",
        ServiceError::NotFound(_) => "not_found",
        ServiceError::InvalidRequest(_) => "invalid_request",
        ServiceError::Store(_) | ServiceError::Vault(_) | ServiceError::Ledger(_) => "persistence",
    }
}
