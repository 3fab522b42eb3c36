//! MatchEngine: candidate template vs. a store's active watchlist.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use warden_core::{BiometricTemplate, CancelToken, CosineMatcher, MatchResult, Matcher, ScoredEntry};
use warden_store::{Store, StoreError};
use warden_vault::{TemplateVault, VaultError};

#[derive(Error, Debug)]
pub enum MatchError {
    /// The candidate itself could not be opened. Never skipped.
    #[error("candidate template unusable: {0}")]
    Candidate(#[source] VaultError),
    #[error("watchlist scan cancelled")]
    Cancelled,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of a full watchlist scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchScan {
    /// Matches at or above the threshold, best first.
    pub results: Vec<MatchResult>,
    /// Active entries evaluated.
    pub scanned: usize,
    /// Entries skipped because their template was missing or failed to decrypt.
    pub skipped: usize,
}

pub struct MatchEngine<M = CosineMatcher> {
    store: Store,
    vault: Arc<TemplateVault>,
    matcher: M,
}

impl MatchEngine<CosineMatcher> {
    pub fn new(store: Store, vault: Arc<TemplateVault>) -> Self {
        Self::with_matcher(store, vault, CosineMatcher)
    }
}

impl<M: Matcher + Send + Sync> MatchEngine<M> {
    pub fn with_matcher(store: Store, vault: Arc<TemplateVault>, matcher: M) -> Self {
        Self { store, vault, matcher }
    }

    /// Compare `candidate` against every active entry for `store_id`.
    ///
    /// An entry whose template cannot be opened is skipped with a warning;
    /// the rest of the watchlist is still evaluated. Cancellation is checked
    /// between entries and yields [`MatchError::Cancelled`], never a partial list.
    pub async fn match_against_watchlist(
        &self,
        candidate: &BiometricTemplate,
        store_id: &str,
        threshold: f32,
        cancel: &CancelToken,
    ) -> Result<MatchScan, MatchError> {
        let capture = self
            .vault
            .decrypt(candidate)
            .await
            .map_err(MatchError::Candidate)?;

        let entries = self.store.active_watchlist(store_id).await?;
        let mut scored = Vec::with_capacity(entries.len());
        let mut skipped = 0usize;

        for entry in &entries {
            if cancel.is_cancelled() {
                tracing::info!(store_id, evaluated = scored.len(), "watchlist scan cancelled");
                return Err(MatchError::Cancelled);
            }

            let Some(template) = self.store.get_template(&entry.template_id).await? else {
                tracing::warn!(entry_id = %entry.id, template_id = %entry.template_id, "watchlist template missing; skipping entry");
                skipped += 1;
                continue;
            };

            let reference = match self.vault.decrypt(&template).await {
                Ok(reference) => reference,
                Err(e) => {
                    tracing::warn!(entry_id = %entry.id, template_id = %template.id, error = %e, "watchlist template decryption failed; skipping entry");
                    skipped += 1;
                    continue;
                }
            };

            scored.push(ScoredEntry {
                entry_id: entry.id.clone(),
                added_at: entry.added_at,
                similarity: self.matcher.score(&capture, &reference),
            });
        }

        if cancel.is_cancelled() {
            return Err(MatchError::Cancelled);
        }

        let scanned = entries.len();
        let results = self.matcher.rank(scored, threshold);
        tracing::info!(
            store_id,
            scanned,
            skipped,
            matches = results.len(),
            threshold,
            "watchlist scan complete"
        );
        Ok(MatchScan {
            results,
            scanned,
            skipped,
        })
    }
}
