mod common;

use common::*;
use warden_core::{AuditOperation, AuditOutcome, CancelToken, LegalBasis, RiskLevel, WatchlistCategory, WatchlistDraft};
use warden_engine::{
    EnrollOutcome, ErasureReport, IdentifyOutcome, WatchlistOutcome, PROCESSING_UNAVAILABLE,
};

const CAROL: &str = "subject-carol";

async fn enrolled(h: &Harness) -> String {
    let carol = ctx(Some(CAROL));
    h.service.record_consent(&carol, LegalBasis::Consent).await.unwrap();
    match h.service.enroll(PNG, &carol, None, &CancelToken::never()).await.unwrap() {
        EnrollOutcome::Enrolled { template } => template.id,
        other => panic!("expected enrollment, got {other:?}"),
    }
}

#[tokio::test]
async fn test_erasure_is_idempotent() {
    let h = harness(answer(&[0.0, 0.0, 0.0, 1.0, 0.0])).await;
    let template_id = enrolled(&h).await;

    let first = h.service.erase_subject(CAROL, &ctx(None)).await.unwrap();
    assert_eq!(
        first,
        ErasureReport {
            templates_deleted: 1,
            watchlist_entries_deactivated: 0,
            consent_withdrawn: true,
        }
    );
    assert!(h.store.get_template(&template_id).await.unwrap().is_none());

    let second = h.service.erase_subject(CAROL, &ctx(None)).await.unwrap();
    assert_eq!(second, ErasureReport::default());

    let erasures = h
        .store
        .audit_for_subject(CAROL, STORE)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.operation == AuditOperation::Erase)
        .count();
    assert_eq!(erasures, 2);

    // Consent is gone too, so the subject cannot be processed again.
    let outcome = h
        .service
        .identify(PNG, &ctx(Some(CAROL)), None, &CancelToken::never())
        .await
        .unwrap();
    assert!(matches!(outcome, IdentifyOutcome::Denied { .. }));
}

#[tokio::test]
async fn test_erasure_deactivates_subject_watchlist_entries() {
    let h = harness(answer(&[0.0, 0.0, 0.0, 1.0, 0.0])).await;
    let draft = WatchlistDraft {
        subject_id: Some(CAROL.into()),
        display_name: "Carol".into(),
        category: WatchlistCategory::BannedIndividual,
        risk_level: RiskLevel::Medium,
        legal_authorization: Some("ban notice 88".into()),
    };
    let WatchlistOutcome::Added { entry } = h
        .service
        .add_to_watchlist(PNG, draft, &ctx(None), &CancelToken::never())
        .await
        .unwrap()
    else {
        panic!("expected watchlist entry");
    };

    let report = h.service.erase_subject(CAROL, &ctx(None)).await.unwrap();
    assert_eq!(report.templates_deleted, 1);
    assert_eq!(report.watchlist_entries_deactivated, 1);

    let stored = h.store.get_watchlist_entry(&entry.id).await.unwrap().unwrap();
    assert!(!stored.is_active);
    assert!(h.store.get_template(&entry.template_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_partial_erasure_is_recorded_as_error() {
    let db = TempDb::new();
    let h = db.harness(answer(&[0.0, 0.0, 0.0, 1.0, 0.0])).await;
    let template_id = enrolled(&h).await;

    // Templates go, then the consent update fails.
    db.exec(
        "CREATE TRIGGER refuse_withdrawal BEFORE UPDATE ON consent
         BEGIN SELECT RAISE(ABORT, 'consent table unavailable'); END;",
    );
    let err = h.service.erase_subject(CAROL, &ctx(None)).await.unwrap_err();
    assert_eq!(err.public_message(), PROCESSING_UNAVAILABLE);
    assert!(h.store.get_template(&template_id).await.unwrap().is_none());

    let failure = h
        .store
        .audit_for_subject(CAROL, STORE)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.operation == AuditOperation::Erase)
        .expect("erase failure recorded");
    assert_eq!(failure.outcome, AuditOutcome::Error);
    assert_eq!(failure.details["templates_deleted"], 1);
    assert_eq!(failure.details["consent_withdrawn"], false);

    db.exec("DROP TRIGGER refuse_withdrawal;");
    let retry = h.service.erase_subject(CAROL, &ctx(None)).await.unwrap();
    assert_eq!(retry.templates_deleted, 0);
    assert!(retry.consent_withdrawn);
}

#[tokio::test]
async fn test_access_report_has_metadata_but_no_biometrics() {
    let h = harness(answer(&[0.0, 0.0, 0.0, 1.0, 0.0])).await;
    let template_id = enrolled(&h).await;
    let stored = h.store.get_template(&template_id).await.unwrap().unwrap();

    let report = h.service.export_subject_report(CAROL, &ctx(None)).await.unwrap();
    assert_eq!(report.subject_id, CAROL);
    assert_eq!(report.templates.len(), 1);
    assert_eq!(report.templates[0].id, template_id);
    assert_eq!(report.consent_history.len(), 1);
    assert!(report.watchlist.is_empty());
    assert!(report
        .audit_trail
        .iter()
        .any(|e| e.operation == AuditOperation::Extract));

    let json = serde_json::to_value(&report).unwrap();
    assert!(json["templates"][0].get("ciphertext").is_none());
    assert!(json["templates"][0].get("embedding").is_none());
    let text = json.to_string();
    let ciphertext_bytes = serde_json::to_string(&stored.ciphertext).unwrap();
    assert!(!text.contains(&ciphertext_bytes));

    let trail = h.store.audit_for_subject(CAROL, STORE).await.unwrap();
    let last = trail.last().unwrap();
    assert_eq!(last.operation, AuditOperation::Export);
    assert_eq!(last.details["templates"], 1);
}

#[tokio::test]
async fn test_access_report_for_unknown_subject_is_empty() {
    let h = harness(answer(&[0.0, 0.0, 0.0, 1.0, 0.0])).await;
    let report = h
        .service
        .export_subject_report("nobody", &ctx(None))
        .await
        .unwrap();
    assert!(report.templates.is_empty());
    assert!(report.consent_history.is_empty());
    assert!(report.audit_trail.is_empty());
}
