//! Key material table backing the local key manager.

use crate::{fmt_ts, parse_opt_ts, parse_ts, Store, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

/// A stored data-encryption key. Revoked rows keep their id but lose their material.
#[derive(Clone)]
pub struct KeyRow {
    pub id: String,
    pub scope: String,
    pub material: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for KeyRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRow")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("revoked_at", &self.revoked_at)
            .finish_non_exhaustive()
    }
}

fn row_to_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<KeyRow> {
    Ok(KeyRow {
        id: row.get(0)?,
        scope: row.get(1)?,
        material: row.get(2)?,
        created_at: parse_ts(3, row.get(3)?)?,
        revoked_at: parse_opt_ts(4, row.get(4)?)?,
    })
}

impl Store {
    pub async fn insert_key(&self, key: KeyRow) -> Result<(), StoreError> {
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO keys (id, scope, material, created_at, revoked_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        key.id,
                        key.scope,
                        key.material,
                        fmt_ts(&key.created_at),
                        key.revoked_at.as_ref().map(fmt_ts),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_key(&self, key_id: &str) -> Result<Option<KeyRow>, StoreError> {
        let key_id = key_id.to_string();
        let row = self
            .conn()
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT id, scope, material, created_at, revoked_at FROM keys WHERE id = ?1",
                        params![key_id],
                        row_to_key,
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        Ok(row)
    }

    /// Newest unrevoked key for a scope.
    pub async fn latest_active_key(&self, scope: &str) -> Result<Option<KeyRow>, StoreError> {
        let scope = scope.to_string();
        let row = self
            .conn()
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT id, scope, material, created_at, revoked_at FROM keys
                         WHERE scope = ?1 AND revoked_at IS NULL
                         ORDER BY created_at DESC, id DESC LIMIT 1",
                        params![scope],
                        row_to_key,
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        Ok(row)
    }

    /// Mark a key revoked and overwrite its material. Returns false if the key
    /// was unknown or already revoked.
    pub async fn revoke_key(&self, key_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let key_id = key_id.to_string();
        let changed = self
            .conn()
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE keys SET revoked_at = ?2, material = zeroblob(0)
                     WHERE id = ?1 AND revoked_at IS NULL",
                    params![key_id, fmt_ts(&at)],
                )?;
                Ok(n)
            })
            .await?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str, scope: &str, created_at: DateTime<Utc>) -> KeyRow {
        KeyRow {
            id: id.into(),
            scope: scope.into(),
            material: vec![7u8; 32],
            created_at,
            revoked_at: None,
        }
    }

    #[tokio::test]
    async fn test_latest_active_key_skips_revoked() {
        let store = Store::open_in_memory().await.unwrap();
        let t0 = Utc::now();
        store.insert_key(key("k1", "store:a", t0)).await.unwrap();
        store
            .insert_key(key("k2", "store:a", t0 + chrono::Duration::seconds(1)))
            .await
            .unwrap();

        assert_eq!(store.latest_active_key("store:a").await.unwrap().unwrap().id, "k2");
        assert!(store.revoke_key("k2", Utc::now()).await.unwrap());
        assert!(!store.revoke_key("k2", Utc::now()).await.unwrap());
        assert_eq!(store.latest_active_key("store:a").await.unwrap().unwrap().id, "k1");
        assert!(store.latest_active_key("store:b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoke_wipes_material() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_key(key("k1", "store:a", Utc::now())).await.unwrap();
        store.revoke_key("k1", Utc::now()).await.unwrap();
        let row = store.get_key("k1").await.unwrap().unwrap();
        assert!(row.material.is_empty());
        assert!(row.revoked_at.is_some());
    }

    #[test]
    fn test_debug_omits_material() {
        let dbg = format!("{:?}", key("k1", "s", Utc::now()));
        assert!(!dbg.contains("material"));
    }
}
