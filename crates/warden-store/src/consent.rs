//! Consent records. Withdrawal is permanent; re-consent inserts a new row.

use crate::{fmt_ts, parse_opt_ts, parse_text, parse_ts, Store, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use warden_core::{ConsentRecord, Purpose};

const CONSENT_COLUMNS: &str =
    "id, subject_id, store_id, purpose, consent_given, legal_basis, consent_date, withdrawn_at";

fn row_to_consent(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConsentRecord> {
    Ok(ConsentRecord {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        store_id: row.get(2)?,
        purpose: parse_text(3, row.get(3)?)?,
        consent_given: row.get(4)?,
        legal_basis: parse_text(5, row.get(5)?)?,
        consent_date: parse_ts(6, row.get(6)?)?,
        withdrawn_at: parse_opt_ts(7, row.get(7)?)?,
    })
}

impl Store {
    pub async fn insert_consent(&self, record: ConsentRecord) -> Result<(), StoreError> {
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO consent (id, subject_id, store_id, purpose, consent_given,
                                          legal_basis, consent_date, withdrawn_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        record.id,
                        record.subject_id,
                        record.store_id,
                        record.purpose.as_str(),
                        record.consent_given,
                        record.legal_basis.as_str(),
                        fmt_ts(&record.consent_date),
                        record.withdrawn_at.as_ref().map(fmt_ts),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Most recent record for the tuple. `subject_id = None` selects the
    /// anonymous visitor-class record.
    pub async fn latest_consent(
        &self,
        subject_id: Option<&str>,
        store_id: &str,
        purpose: Purpose,
    ) -> Result<Option<ConsentRecord>, StoreError> {
        let subject_id = subject_id.map(str::to_string);
        let store_id = store_id.to_string();
        let record = self
            .conn()
            .call(move |conn| {
                let record = conn
                    .query_row(
                        &format!(
                            "SELECT {CONSENT_COLUMNS} FROM consent
                             WHERE subject_id IS ?1 AND store_id = ?2 AND purpose = ?3
                             ORDER BY consent_date DESC, rowid DESC LIMIT 1"
                        ),
                        params![subject_id, store_id, purpose.as_str()],
                        row_to_consent,
                    )
                    .optional()?;
                Ok(record)
            })
            .await?;
        Ok(record)
    }

    /// Every consent record for a subject at a store, oldest first.
    pub async fn consent_history(
        &self,
        subject_id: &str,
        store_id: &str,
    ) -> Result<Vec<ConsentRecord>, StoreError> {
        let subject_id = subject_id.to_string();
        let store_id = store_id.to_string();
        let records = self
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CONSENT_COLUMNS} FROM consent
                     WHERE subject_id = ?1 AND store_id = ?2 ORDER BY consent_date, rowid"
                ))?;
                let records = stmt
                    .query_map(params![subject_id, store_id], row_to_consent)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await?;
        Ok(records)
    }

    /// Stamp `withdrawn_at` on every not-yet-withdrawn record for the tuple.
    /// Returns how many records changed.
    pub async fn withdraw_consent(
        &self,
        subject_id: Option<&str>,
        store_id: &str,
        purpose: Purpose,
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let subject_id = subject_id.map(str::to_string);
        let store_id = store_id.to_string();
        let changed = self
            .conn()
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE consent SET withdrawn_at = ?4
                     WHERE subject_id IS ?1 AND store_id = ?2 AND purpose = ?3
                       AND withdrawn_at IS NULL",
                    params![subject_id, store_id, purpose.as_str(), fmt_ts(&at)],
                )?;
                Ok(n)
            })
            .await?;
        Ok(changed)
    }

    /// (subject, store) pairs with at least one withdrawn record for `purpose`.
    /// Callers decide on the latest record; a re-consent supersedes the withdrawal.
    pub async fn withdrawn_subjects(&self, purpose: Purpose) -> Result<Vec<(String, String)>, StoreError> {
        let pairs = self
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT subject_id, store_id FROM consent
                     WHERE subject_id IS NOT NULL AND purpose = ?1 AND withdrawn_at IS NOT NULL
                     ORDER BY subject_id, store_id",
                )?;
                let pairs = stmt
                    .query_map(params![purpose.as_str()], |r| Ok((r.get(0)?, r.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(pairs)
            })
            .await?;
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::LegalBasis;

    fn record(subject: Option<&str>, date: DateTime<Utc>) -> ConsentRecord {
        ConsentRecord::new(
            subject,
            "store-1",
            Purpose::BiometricRecognition,
            true,
            LegalBasis::Consent,
            date,
        )
    }

    #[tokio::test]
    async fn test_latest_consent_picks_newest() {
        let store = Store::open_in_memory().await.unwrap();
        let t0 = Utc::now() - chrono::Duration::days(2);
        let older = record(Some("s1"), t0);
        let newer = record(Some("s1"), t0 + chrono::Duration::days(1));
        store.insert_consent(older).await.unwrap();
        store.insert_consent(newer.clone()).await.unwrap();

        let latest = store
            .latest_consent(Some("s1"), "store-1", Purpose::BiometricRecognition)
            .await
            .unwrap();
        assert_eq!(latest, Some(newer));
        assert!(store
            .latest_consent(Some("s2"), "store-1", Purpose::BiometricRecognition)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_anonymous_visitor_class() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_consent(record(None, Utc::now())).await.unwrap();

        let anon = store
            .latest_consent(None, "store-1", Purpose::BiometricRecognition)
            .await
            .unwrap();
        assert!(anon.unwrap().subject_id.is_none());
        assert!(store
            .latest_consent(Some("s1"), "store-1", Purpose::BiometricRecognition)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_withdrawal_is_permanent() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_consent(record(Some("s1"), Utc::now())).await.unwrap();

        let first = Utc::now();
        let n = store
            .withdraw_consent(Some("s1"), "store-1", Purpose::BiometricRecognition, first)
            .await
            .unwrap();
        assert_eq!(n, 1);
        // Already withdrawn rows are left alone.
        let n = store
            .withdraw_consent(Some("s1"), "store-1", Purpose::BiometricRecognition, Utc::now())
            .await
            .unwrap();
        assert_eq!(n, 0);

        let direct = store
            .conn()
            .call(|conn| {
                conn.execute("UPDATE consent SET withdrawn_at = NULL", [])?;
                Ok(())
            })
            .await;
        assert!(direct.is_err());

        let latest = store
            .latest_consent(Some("s1"), "store-1", Purpose::BiometricRecognition)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.withdrawn_at, Some(first));
        assert_eq!(
            store.withdrawn_subjects(Purpose::BiometricRecognition).await.unwrap(),
            vec![("s1".to_string(), "store-1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_history_keeps_all_records() {
        let store = Store::open_in_memory().await.unwrap();
        let t0 = Utc::now();
        store.insert_consent(record(Some("s1"), t0)).await.unwrap();
        store
            .withdraw_consent(Some("s1"), "store-1", Purpose::BiometricRecognition, t0)
            .await
            .unwrap();
        store
            .insert_consent(record(Some("s1"), t0 + chrono::Duration::seconds(1)))
            .await
            .unwrap();

        let history = store.consent_history("s1", "store-1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].is_active());
        assert!(history[1].is_active());
    }
}
