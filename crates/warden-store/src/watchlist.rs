//! Watchlist entries. Rows are deactivated, never deleted.

use crate::audit::append_on;
use crate::templates::insert_on;
use crate::{fmt_ts, parse_text, parse_ts, Store, StoreError};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use warden_core::{AuditEntry, BiometricTemplate, WatchlistEntry};

const WATCHLIST_COLUMNS: &str = "id, store_id, subject_id, display_name, category, risk_level, \
     template_id, added_by, added_at, is_active, legal_authorization";

fn row_to_watchlist(row: &rusqlite::Row<'_>) -> rusqlite::Result<WatchlistEntry> {
    Ok(WatchlistEntry {
        id: row.get(0)?,
        store_id: row.get(1)?,
        subject_id: row.get(2)?,
        display_name: row.get(3)?,
        category: parse_text(4, row.get(4)?)?,
        risk_level: parse_text(5, row.get(5)?)?,
        template_id: row.get(6)?,
        added_by: row.get(7)?,
        added_at: parse_ts(8, row.get(8)?)?,
        is_active: row.get(9)?,
        legal_authorization: row.get(10)?,
    })
}

fn insert_entry_on(conn: &rusqlite::Connection, e: &WatchlistEntry) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO watchlist (id, store_id, subject_id, display_name, category, risk_level,
                                template_id, added_by, added_at, is_active, legal_authorization)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            e.id,
            e.store_id,
            e.subject_id,
            e.display_name,
            e.category.as_str(),
            e.risk_level.as_str(),
            e.template_id,
            e.added_by,
            fmt_ts(&e.added_at),
            e.is_active,
            e.legal_authorization,
        ],
    )?;
    Ok(())
}

/// Entry counts at a store; `by_category` covers active entries only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchlistCounts {
    pub active: u64,
    pub inactive: u64,
    pub by_category: BTreeMap<String, u64>,
}

impl Store {
    /// Insert a watchlist entry. A second active entry for the same template
    /// is rejected with [`StoreError::Conflict`].
    pub async fn insert_watchlist_entry(&self, entry: WatchlistEntry) -> Result<(), StoreError> {
        self.conn()
            .call(move |conn| {
                insert_entry_on(conn, &entry)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Insert a template, the entry that owns it, and the ledger entry
    /// recording the change, all or nothing.
    pub async fn insert_watchlist_enrollment(
        &self,
        template: BiometricTemplate,
        entry: WatchlistEntry,
        audit: AuditEntry,
    ) -> Result<AuditEntry, StoreError> {
        let stored = self
            .conn()
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                insert_on(&tx, &template)?;
                insert_entry_on(&tx, &entry)?;
                let stored = append_on(&tx, audit)?;
                tx.commit()?;
                Ok(stored)
            })
            .await?;
        Ok(stored)
    }

    pub async fn get_watchlist_entry(&self, id: &str) -> Result<Option<WatchlistEntry>, StoreError> {
        let id = id.to_string();
        let entry = self
            .conn()
            .call(move |conn| {
                let entry = conn
                    .query_row(
                        &format!("SELECT {WATCHLIST_COLUMNS} FROM watchlist WHERE id = ?1"),
                        params![id],
                        row_to_watchlist,
                    )
                    .optional()?;
                Ok(entry)
            })
            .await?;
        Ok(entry)
    }

    /// Active entries for a store in insertion order.
    pub async fn active_watchlist(&self, store_id: &str) -> Result<Vec<WatchlistEntry>, StoreError> {
        let store_id = store_id.to_string();
        self.query_watchlist(
            format!(
                "SELECT {WATCHLIST_COLUMNS} FROM watchlist
                 WHERE store_id = ?1 AND is_active = 1 ORDER BY added_at, id"
            ),
            vec![store_id],
        )
        .await
    }

    /// Every entry, active or not, naming a subject at a store.
    pub async fn watchlist_for_subject(
        &self,
        subject_id: &str,
        store_id: &str,
    ) -> Result<Vec<WatchlistEntry>, StoreError> {
        self.query_watchlist(
            format!(
                "SELECT {WATCHLIST_COLUMNS} FROM watchlist
                 WHERE subject_id = ?1 AND store_id = ?2 ORDER BY added_at, id"
            ),
            vec![subject_id.to_string(), store_id.to_string()],
        )
        .await
    }

    /// Returns false if the entry was unknown or already inactive.
    pub async fn deactivate_watchlist_entry(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.deactivate_where("id = ?1", vec![id]).await.map(|n| n > 0)
    }

    pub async fn deactivate_watchlist_for_template(&self, template_id: &str) -> Result<usize, StoreError> {
        self.deactivate_where("template_id = ?1", vec![template_id.to_string()])
            .await
    }

    pub async fn deactivate_watchlist_for_subject(
        &self,
        subject_id: &str,
        store_id: &str,
    ) -> Result<usize, StoreError> {
        self.deactivate_where(
            "subject_id = ?1 AND store_id = ?2",
            vec![subject_id.to_string(), store_id.to_string()],
        )
        .await
    }

    pub async fn watchlist_counts(&self, store_id: &str) -> Result<WatchlistCounts, StoreError> {
        let store_id = store_id.to_string();
        let rows: Vec<(String, bool, i64)> = self
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT category, is_active, COUNT(*) FROM watchlist
                     WHERE store_id = ?1 GROUP BY category, is_active",
                )?;
                let rows = stmt
                    .query_map(params![store_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut counts = WatchlistCounts::default();
        for (category, active, n) in rows {
            let n = n as u64;
            if active {
                counts.active += n;
                *counts.by_category.entry(category).or_default() += n;
            } else {
                counts.inactive += n;
            }
        }
        Ok(counts)
    }

    async fn deactivate_where(&self, clause: &'static str, args: Vec<String>) -> Result<usize, StoreError> {
        let changed = self
            .conn()
            .call(move |conn| {
                let n = conn.execute(
                    &format!("UPDATE watchlist SET is_active = 0 WHERE {clause} AND is_active = 1"),
                    rusqlite::params_from_iter(args.iter()),
                )?;
                Ok(n)
            })
            .await?;
        Ok(changed)
    }

    async fn query_watchlist(&self, sql: String, args: Vec<String>) -> Result<Vec<WatchlistEntry>, StoreError> {
        let entries = self
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let entries = stmt
                    .query_map(rusqlite::params_from_iter(args.iter()), row_to_watchlist)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(entries)
            })
            .await?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::tests::template;
    use chrono::Utc;
    use warden_core::{AuditOperation, RiskLevel, WatchlistCategory};

    fn entry(id: &str, template_id: &str, category: WatchlistCategory) -> WatchlistEntry {
        WatchlistEntry {
            id: id.into(),
            store_id: "store-1".into(),
            subject_id: Some("s1".into()),
            display_name: "Person".into(),
            category,
            risk_level: RiskLevel::High,
            template_id: template_id.into(),
            added_by: "operator-1".into(),
            added_at: Utc::now(),
            is_active: true,
            legal_authorization: None,
        }
    }

    #[tokio::test]
    async fn test_one_active_entry_per_template() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .insert_watchlist_entry(entry("w1", "t1", WatchlistCategory::SecurityThreat))
            .await
            .unwrap();
        let err = store
            .insert_watchlist_entry(entry("w2", "t1", WatchlistCategory::SecurityThreat))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Once the first is inactive the template may be referenced again.
        assert!(store.deactivate_watchlist_entry("w1").await.unwrap());
        assert!(!store.deactivate_watchlist_entry("w1").await.unwrap());
        store
            .insert_watchlist_entry(entry("w2", "t1", WatchlistCategory::SecurityThreat))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_enrollment_is_atomic() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .insert_watchlist_entry(entry("w1", "t1", WatchlistCategory::SecurityThreat))
            .await
            .unwrap();

        let audit = AuditEntry::new(AuditOperation::WatchlistUpdate, "operator-1", "store-1");
        let err = store
            .insert_watchlist_enrollment(
                template("t1", Some("s1"), "k1", Utc::now()),
                entry("w2", "t1", WatchlistCategory::SecurityThreat),
                audit,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.get_template("t1").await.unwrap().is_none());
        assert!(store.audit_for_store("store-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_watchlist_and_counts() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .insert_watchlist_entry(entry("w1", "t1", WatchlistCategory::SecurityThreat))
            .await
            .unwrap();
        store
            .insert_watchlist_entry(entry("w2", "t2", WatchlistCategory::BannedIndividual))
            .await
            .unwrap();
        store
            .insert_watchlist_entry(entry("w3", "t3", WatchlistCategory::BannedIndividual))
            .await
            .unwrap();
        assert_eq!(store.deactivate_watchlist_for_template("t3").await.unwrap(), 1);

        let active = store.active_watchlist("store-1").await.unwrap();
        assert_eq!(active.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), ["w1", "w2"]);

        let counts = store.watchlist_counts("store-1").await.unwrap();
        assert_eq!(counts.active, 2);
        assert_eq!(counts.inactive, 1);
        assert_eq!(counts.by_category.get("banned_individual"), Some(&1));

        assert_eq!(store.deactivate_watchlist_for_subject("s1", "store-1").await.unwrap(), 2);
        assert!(store.active_watchlist("store-1").await.unwrap().is_empty());
        assert_eq!(store.watchlist_for_subject("s1", "store-1").await.unwrap().len(), 3);
    }
}
