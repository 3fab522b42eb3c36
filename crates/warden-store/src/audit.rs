//! Append-only, hash-chained audit table.

use crate::{fmt_ts, parse_text, parse_ts, Store, StoreError};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use sha2::{Digest, Sha256};
use warden_core::AuditEntry;

const AUDIT_COLUMNS: &str = "id, operation, actor_id, store_id, subject_id, consent_status, \
     legal_basis, outcome, timestamp, details, prev_hash, entry_hash";

/// SHA-256 over the previous entry hash and the entry's canonical body, hex-encoded.
pub fn chain_hash(prev_hash: Option<&str>, entry: &AuditEntry) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(entry.canonical_body());
    hex::encode(hasher.finalize())
}

/// Result of recomputing the ledger's hash chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub entries: usize,
    /// Id of the first entry whose link or hash does not verify.
    pub broken_at: Option<String>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.broken_at.is_none()
    }
}

/// Link `entry` to the current tip and insert it. Runs on the caller's
/// connection or transaction.
pub(crate) fn append_on(conn: &rusqlite::Connection, mut entry: AuditEntry) -> rusqlite::Result<AuditEntry> {
    let prev: Option<String> = conn
        .query_row(
            "SELECT entry_hash FROM audit ORDER BY seq DESC LIMIT 1",
            [],
            |r| r.get(0),
        )
        .optional()?;
    entry.entry_hash = Some(chain_hash(prev.as_deref(), &entry));
    entry.prev_hash = prev;

    let details = entry.details.to_string();
    conn.execute(
        "INSERT INTO audit (id, operation, actor_id, store_id, subject_id, consent_status,
                            legal_basis, outcome, timestamp, details, prev_hash, entry_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            entry.id,
            entry.operation.as_str(),
            entry.actor_id,
            entry.store_id,
            entry.subject_id,
            entry.consent_status.as_str(),
            entry.legal_basis.map(|b| b.as_str()),
            entry.outcome.as_str(),
            fmt_ts(&entry.timestamp),
            details,
            entry.prev_hash,
            entry.entry_hash,
        ],
    )?;
    Ok(entry)
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let details: String = row.get(9)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        operation: parse_text(1, row.get(1)?)?,
        actor_id: row.get(2)?,
        store_id: row.get(3)?,
        subject_id: row.get(4)?,
        consent_status: parse_text(5, row.get(5)?)?,
        legal_basis: row
            .get::<_, Option<String>>(6)?
            .map(|s| parse_text(6, s))
            .transpose()?,
        outcome: parse_text(7, row.get(7)?)?,
        timestamp: parse_ts(8, row.get(8)?)?,
        details: serde_json::from_str(&details)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?,
        prev_hash: row.get(10)?,
        entry_hash: row.get(11)?,
    })
}

impl Store {
    /// Append one audit entry, returning it with its chain hashes assigned.
    pub async fn append_audit(&self, entry: AuditEntry) -> Result<AuditEntry, StoreError> {
        let stored = self
            .conn()
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let stored = append_on(&tx, entry)?;
                tx.commit()?;
                Ok(stored)
            })
            .await?;
        Ok(stored)
    }

    /// Audit trail for one subject at one store, oldest first.
    pub async fn audit_for_subject(
        &self,
        subject_id: &str,
        store_id: &str,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let subject_id = subject_id.to_string();
        let store_id = store_id.to_string();
        let entries = self
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit
                     WHERE subject_id = ?1 AND store_id = ?2 ORDER BY seq"
                ))?;
                let entries = stmt
                    .query_map(params![subject_id, store_id], row_to_entry)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(entries)
            })
            .await?;
        Ok(entries)
    }

    /// All audit entries for a store, oldest first.
    pub async fn audit_for_store(&self, store_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        let store_id = store_id.to_string();
        let entries = self
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit WHERE store_id = ?1 ORDER BY seq"
                ))?;
                let entries = stmt
                    .query_map(params![store_id], row_to_entry)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(entries)
            })
            .await?;
        Ok(entries)
    }

    /// Recompute the hash chain over the whole ledger.
    pub async fn verify_audit_chain(&self) -> Result<ChainReport, StoreError> {
        let entries = self
            .conn()
            .call(|conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {AUDIT_COLUMNS} FROM audit ORDER BY seq"))?;
                let entries = stmt
                    .query_map([], row_to_entry)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(entries)
            })
            .await?;

        let mut prev: Option<String> = None;
        for entry in &entries {
            let expected = chain_hash(prev.as_deref(), entry);
            if entry.prev_hash != prev || entry.entry_hash.as_deref() != Some(expected.as_str()) {
                tracing::warn!(entry_id = %entry.id, "audit chain verification failed");
                return Ok(ChainReport {
                    entries: entries.len(),
                    broken_at: Some(entry.id.clone()),
                });
            }
            prev = entry.entry_hash.clone();
        }
        Ok(ChainReport {
            entries: entries.len(),
            broken_at: None,
        })
    }
}
