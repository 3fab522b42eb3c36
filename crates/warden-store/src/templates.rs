//! Encrypted template rows.

use crate::audit::append_on;
use crate::{fmt_ts, parse_text, parse_ts, Store, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use warden_core::{AuditEntry, BiometricTemplate};

const TEMPLATE_COLUMNS: &str = "id, subject_id, store_id, ciphertext, key_id, algorithm, \
     quality_score, created_at, expires_at, legal_basis, consent_verified";

fn row_to_template(row: &rusqlite::Row<'_>) -> rusqlite::Result<BiometricTemplate> {
    Ok(BiometricTemplate {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        store_id: row.get(2)?,
        ciphertext: row.get(3)?,
        key_id: row.get(4)?,
        algorithm: row.get(5)?,
        quality_score: row.get::<_, f64>(6)? as f32,
        created_at: parse_ts(7, row.get(7)?)?,
        expires_at: parse_ts(8, row.get(8)?)?,
        legal_basis: parse_text(9, row.get(9)?)?,
        consent_verified: row.get(10)?,
    })
}

pub(crate) fn insert_on(conn: &rusqlite::Connection, t: &BiometricTemplate) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO templates (id, subject_id, store_id, ciphertext, key_id, algorithm,
                                quality_score, created_at, expires_at, legal_basis, consent_verified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            t.id,
            t.subject_id,
            t.store_id,
            t.ciphertext,
            t.key_id,
            t.algorithm,
            t.quality_score as f64,
            fmt_ts(&t.created_at),
            fmt_ts(&t.expires_at),
            t.legal_basis.as_str(),
            t.consent_verified,
        ],
    )?;
    Ok(())
}

impl Store {
    pub async fn insert_template(&self, template: BiometricTemplate) -> Result<(), StoreError> {
        self.conn()
            .call(move |conn| {
                insert_on(conn, &template)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Insert a template and its ledger entry in one transaction.
    pub async fn insert_template_with_audit(
        &self,
        template: BiometricTemplate,
        entry: AuditEntry,
    ) -> Result<AuditEntry, StoreError> {
        let stored = self
            .conn()
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                insert_on(&tx, &template)?;
                let stored = append_on(&tx, entry)?;
                tx.commit()?;
                Ok(stored)
            })
            .await?;
        Ok(stored)
    }

    pub async fn get_template(&self, id: &str) -> Result<Option<BiometricTemplate>, StoreError> {
        let id = id.to_string();
        let template = self
            .conn()
            .call(move |conn| {
                let t = conn
                    .query_row(
                        &format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE id = ?1"),
                        params![id],
                        row_to_template,
                    )
                    .optional()?;
                Ok(t)
            })
            .await?;
        Ok(template)
    }

    pub async fn templates_for_subject(
        &self,
        subject_id: &str,
        store_id: &str,
    ) -> Result<Vec<BiometricTemplate>, StoreError> {
        let subject_id = subject_id.to_string();
        let store_id = store_id.to_string();
        self.query_templates(
            format!(
                "SELECT {TEMPLATE_COLUMNS} FROM templates
                 WHERE subject_id = ?1 AND store_id = ?2 ORDER BY created_at, id"
            ),
            vec![subject_id, store_id],
        )
        .await
    }

    /// Templates whose `expires_at` falls at or before `cutoff`.
    pub async fn templates_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<BiometricTemplate>, StoreError> {
        self.query_templates(
            format!(
                "SELECT {TEMPLATE_COLUMNS} FROM templates
                 WHERE expires_at <= ?1 ORDER BY expires_at, id"
            ),
            vec![fmt_ts(&cutoff)],
        )
        .await
    }

    /// Distinct (subject, store) pairs that own at least one template.
    pub async fn template_owners(&self) -> Result<Vec<(String, String)>, StoreError> {
        let owners = self
            .conn()
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT subject_id, store_id FROM templates
                     WHERE subject_id IS NOT NULL ORDER BY subject_id, store_id",
                )?;
                let owners = stmt
                    .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(owners)
            })
            .await?;
        Ok(owners)
    }

    pub async fn count_templates_with_key(&self, key_id: &str) -> Result<u64, StoreError> {
        let key_id = key_id.to_string();
        let n = self
            .conn()
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM templates WHERE key_id = ?1",
                    params![key_id],
                    |r| r.get(0),
                )?;
                Ok(n)
            })
            .await?;
        Ok(n as u64)
    }

    /// Move `expires_at` later. Returns false if the template is missing or
    /// `expires_at` would not increase.
    pub async fn extend_template_expiry(
        &self,
        id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let id = id.to_string();
        let changed = self
            .conn()
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE templates SET expires_at = ?2 WHERE id = ?1 AND expires_at < ?2",
                    params![id, fmt_ts(&expires_at)],
                )?;
                Ok(n)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Remove a template row. Returns false if it did not exist.
    pub async fn delete_template(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        let changed = self
            .conn()
            .call(move |conn| {
                let n = conn.execute("DELETE FROM templates WHERE id = ?1", params![id])?;
                Ok(n)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Remove a template row and append its ledger entry in one transaction.
    /// Returns None, with nothing appended, if the row did not exist.
    pub async fn delete_template_with_audit(
        &self,
        id: &str,
        entry: AuditEntry,
    ) -> Result<Option<AuditEntry>, StoreError> {
        let id = id.to_string();
        let stored = self
            .conn()
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                if tx.execute("DELETE FROM templates WHERE id = ?1", params![id])? == 0 {
                    return Ok(None);
                }
                let stored = append_on(&tx, entry)?;
                tx.commit()?;
                Ok(Some(stored))
            })
            .await?;
        Ok(stored)
    }

    async fn query_templates(
        &self,
        sql: String,
        args: Vec<String>,
    ) -> Result<Vec<BiometricTemplate>, StoreError> {
        let templates = self
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let templates = stmt
                    .query_map(rusqlite::params_from_iter(args.iter()), row_to_template)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(templates)
            })
            .await?;
        Ok(templates)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use warden_core::{AuditOperation, LegalBasis};

    pub(crate) fn template(id: &str, subject: Option<&str>, key_id: &str, expires_at: DateTime<Utc>) -> BiometricTemplate {
        BiometricTemplate {
            id: id.into(),
            subject_id: subject.map(str::to_string),
            store_id: "store-1".into(),
            ciphertext: vec![1, 2, 3, 4],
            key_id: key_id.into(),
            algorithm: "test/v1".into(),
            quality_score: 0.75,
            created_at: Utc::now(),
            expires_at,
            legal_basis: LegalBasis::Consent,
            consent_verified: true,
        }
    }

    #[tokio::test]
    async fn test_insert_get_delete() {
        let store = Store::open_in_memory().await.unwrap();
        let t = template("t1", Some("s1"), "k1", Utc::now());
        store.insert_template(t.clone()).await.unwrap();

        let loaded = store.get_template("t1").await.unwrap().unwrap();
        assert_eq!(loaded.summary(), t.summary());
        assert_eq!(loaded.ciphertext, t.ciphertext);

        assert!(store.delete_template("t1").await.unwrap());
        assert!(!store.delete_template("t1").await.unwrap());
        assert!(store.get_template("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_with_audit_is_atomic() {
        let store = Store::open_in_memory().await.unwrap();
        let t = template("t1", Some("s1"), "k1", Utc::now());
        store.insert_template(t.clone()).await.unwrap();

        // Duplicate id: the template insert fails and the audit row must not land.
        let entry = AuditEntry::new(AuditOperation::Extract, "op", "store-1");
        let err = store.insert_template_with_audit(t, entry).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.audit_for_store("store-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_with_audit_commits_both_or_neither() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_template(template("t1", Some("s1"), "k1", Utc::now())).await.unwrap();

        let entry = AuditEntry::new(AuditOperation::Erase, "sweeper", "store-1").subject(Some("s1"));
        let stored = store.delete_template_with_audit("t1", entry.clone()).await.unwrap();
        assert!(stored.is_some_and(|e| e.entry_hash.is_some()));
        assert!(store.get_template("t1").await.unwrap().is_none());
        assert_eq!(store.audit_for_subject("s1", "store-1").await.unwrap().len(), 1);

        // Already gone: no second erase entry.
        assert!(store.delete_template_with_audit("t1", entry).await.unwrap().is_none());
        assert_eq!(store.audit_for_store("store-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expiry_queries() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();
        store
            .insert_template(template("old", Some("s1"), "k1", now - chrono::Duration::hours(1)))
            .await
            .unwrap();
        store
            .insert_template(template("new", None, "k1", now + chrono::Duration::days(10)))
            .await
            .unwrap();

        let expired = store.templates_expiring_before(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "old");
        assert_eq!(store.count_templates_with_key("k1").await.unwrap(), 2);
        assert_eq!(store.template_owners().await.unwrap(), vec![("s1".to_string(), "store-1".to_string())]);
    }

    #[tokio::test]
    async fn test_extend_expiry_only_forward() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();
        store.insert_template(template("t1", None, "k1", now)).await.unwrap();
        assert!(!store
            .extend_template_expiry("t1", now - chrono::Duration::days(1))
            .await
            .unwrap());
        assert!(store
            .extend_template_expiry("t1", now + chrono::Duration::days(1))
            .await
            .unwrap());
    }
}
