use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use warden_core::{CancelToken, LegalBasis, RiskLevel, WatchlistCategory, WatchlistDraft};
use warden_engine::{OperationContext, RecognitionService, ServiceError, PROCESSING_UNAVAILABLE};
use zbus::interface;

/// Upper bound on one request, extraction and watchlist scan included.
const REQUEST_DEADLINE: Duration = Duration::from_secs(60);

/// D-Bus interface for the Warden recognition daemon.
///
/// Bus name: io.warden.Engine1
/// Object path: /io/warden/Engine1
///
/// Empty strings stand in for absent optional arguments (`subject_id`,
/// `legal_basis`, `legal_authorization`); a negative threshold selects the
/// configured default. Structured results are JSON strings.
pub struct WardenService {
    service: Arc<RecognitionService>,
    started_at: Instant,
}

impl WardenService {
    pub fn new(service: Arc<RecognitionService>) -> Self {
        Self {
            service,
            started_at: Instant::now(),
        }
    }
}

#[interface(name = "io.warden.Engine1")]
impl WardenService {
    async fn check_consent(
        &self,
        store_id: &str,
        subject_id: &str,
        actor_id: &str,
    ) -> zbus::fdo::Result<String> {
        let ctx = context(store_id, subject_id, actor_id);
        to_json(&self.service.check_consent(&ctx).await.map_err(failed)?)
    }

    async fn record_consent(
        &self,
        store_id: &str,
        subject_id: &str,
        legal_basis: &str,
        actor_id: &str,
    ) -> zbus::fdo::Result<String> {
        let ctx = context(store_id, subject_id, actor_id);
        let basis = parse_arg::<LegalBasis>(legal_basis)?;
        tracing::info!(store_id, %basis, "record_consent requested");
        to_json(&self.service.record_consent(&ctx, basis).await.map_err(failed)?)
    }

    async fn withdraw_consent(
        &self,
        store_id: &str,
        subject_id: &str,
        actor_id: &str,
    ) -> zbus::fdo::Result<String> {
        let ctx = context(store_id, subject_id, actor_id);
        tracing::info!(store_id, "withdraw_consent requested");
        let withdrawn = self.service.withdraw_consent(&ctx).await.map_err(failed)?;
        to_json(&serde_json::json!({ "withdrawn": withdrawn }))
    }

    async fn enroll(
        &self,
        image: Vec<u8>,
        store_id: &str,
        subject_id: &str,
        legal_basis: &str,
        actor_id: &str,
    ) -> zbus::fdo::Result<String> {
        let ctx = context(store_id, subject_id, actor_id);
        let basis = optional(legal_basis)
            .map(parse_arg::<LegalBasis>)
            .transpose()?;
        tracing::info!(store_id, bytes = image.len(), "enroll requested");
        let outcome = self
            .service
            .enroll(&image, &ctx, basis, &request_token())
            .await
            .map_err(failed)?;
        to_json(&outcome)
    }

    async fn identify(
        &self,
        image: Vec<u8>,
        store_id: &str,
        subject_id: &str,
        threshold: f64,
        actor_id: &str,
    ) -> zbus::fdo::Result<String> {
        let ctx = context(store_id, subject_id, actor_id);
        let threshold = (threshold >= 0.0).then_some(threshold as f32);
        tracing::info!(store_id, bytes = image.len(), "identify requested");
        let outcome = self
            .service
            .identify(&image, &ctx, threshold, &request_token())
            .await
            .map_err(failed)?;
        to_json(&outcome)
    }

    async fn erase_subject(
        &self,
        store_id: &str,
        subject_id: &str,
        actor_id: &str,
    ) -> zbus::fdo::Result<String> {
        let subject = required("subject_id", subject_id)?;
        let ctx = OperationContext::new(store_id, actor_id);
        tracing::info!(store_id, "erase_subject requested");
        to_json(&self.service.erase_subject(subject, &ctx).await.map_err(failed)?)
    }

    async fn export_subject_report(
        &self,
        store_id: &str,
        subject_id: &str,
        actor_id: &str,
    ) -> zbus::fdo::Result<String> {
        let subject = required("subject_id", subject_id)?;
        let ctx = OperationContext::new(store_id, actor_id);
        tracing::info!(store_id, "export_subject_report requested");
        to_json(
            &self
                .service
                .export_subject_report(subject, &ctx)
                .await
                .map_err(failed)?,
        )
    }

    #[allow(clippy::too_many_arguments)]
    async fn add_to_watchlist(
        &self,
        image: Vec<u8>,
        store_id: &str,
        display_name: &str,
        category: &str,
        risk_level: &str,
        subject_id: &str,
        legal_authorization: &str,
        actor_id: &str,
    ) -> zbus::fdo::Result<String> {
        let draft = WatchlistDraft {
            subject_id: optional(subject_id).map(str::to_string),
            display_name: required("display_name", display_name)?.to_string(),
            category: parse_arg::<WatchlistCategory>(category)?,
            risk_level: parse_arg::<RiskLevel>(risk_level)?,
            legal_authorization: optional(legal_authorization).map(str::to_string),
        };
        let ctx = OperationContext::new(store_id, actor_id);
        tracing::info!(store_id, category, "add_to_watchlist requested");
        let outcome = self
            .service
            .add_to_watchlist(&image, draft, &ctx, &request_token())
            .await
            .map_err(failed)?;
        to_json(&outcome)
    }

    async fn deactivate_watchlist_entry(&self, entry_id: &str, actor_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(entry_id, "deactivate_watchlist_entry requested");
        self.service
            .deactivate_watchlist_entry(entry_id, actor_id)
            .await
            .map_err(failed)
    }

    async fn watchlist_stats(&self, store_id: &str) -> zbus::fdo::Result<String> {
        to_json(&self.service.watchlist_stats(store_id).await.map_err(failed)?)
    }

    async fn sweep_now(&self) -> zbus::fdo::Result<String> {
        tracing::info!("sweep_now requested");
        to_json(&self.service.sweep_now().await.map_err(failed)?)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let ledger = self.service.verify_ledger().await.map_err(failed)?;
        let config = self.service.config();
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "embedding_dim": self.service.extractor().dimension(),
            "algorithm": self.service.extractor().algorithm(),
            "default_threshold": config.default_threshold,
            "retention_days": config.retention_days,
            "retain_identify_captures": config.retain_identify_captures,
            "ledger_entries": ledger.entries,
            "ledger_intact": ledger.is_intact(),
        }))
    }
}

fn context(store_id: &str, subject_id: &str, actor_id: &str) -> OperationContext {
    OperationContext::new(store_id, actor_id).subject(optional(subject_id))
}

fn request_token() -> CancelToken {
    CancelToken::never().with_deadline(tokio::time::Instant::now() + REQUEST_DEADLINE)
}

fn optional(arg: &str) -> Option<&str> {
    let arg = arg.trim();
    (!arg.is_empty()).then_some(arg)
}

fn required<'a>(name: &str, arg: &'a str) -> zbus::fdo::Result<&'a str> {
    optional(arg).ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("{name} is required")))
}

fn parse_arg<T>(arg: &str) -> zbus::fdo::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    arg.trim()
        .parse()
        .map_err(|e: T::Err| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

/// Only the public message crosses the bus.
fn failed(e: ServiceError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.public_message())
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| {
        tracing::error!(error = %e, "response serialization failed");
        zbus::fdo::Error::Failed(PROCESSING_UNAVAILABLE.to_string())
    })
}
