//! Key-management collaborator and the SQLite-backed local implementation.

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use warden_store::{KeyRow, Store, StoreError};
use zeroize::{Zeroize, Zeroizing};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("key revoked: {0}")]
    Revoked(String),
    #[error("malformed key material for {0}")]
    Malformed(String),
    #[error("key store error: {0}")]
    Store(#[from] StoreError),
}

impl KeyError {
    /// True when the key itself is unusable, as opposed to the key service
    /// being unreachable.
    pub fn is_key_fault(&self) -> bool {
        !matches!(self, KeyError::Store(_))
    }
}

/// Key material, wiped on drop. `Debug` prints only the id.
#[derive(Clone)]
pub struct DataKey {
    pub id: String,
    material: Zeroizing<[u8; KEY_LEN]>,
}

impl DataKey {
    pub fn new(id: impl Into<String>, material: [u8; KEY_LEN]) -> Self {
        Self {
            id: id.into(),
            material: Zeroizing::new(material),
        }
    }

    pub fn material(&self) -> &[u8; KEY_LEN] {
        &self.material
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey").field("id", &self.id).finish_non_exhaustive()
    }
}

/// External key service boundary. Every call is an I/O suspension point and
/// is never retried by the vault.
#[async_trait]
pub trait KeyManager: Send + Sync {
    /// Mint a new key for `scope` and return its id.
    async fn generate_key(&self, scope: &str) -> Result<String, KeyError>;

    async fn get_key(&self, key_id: &str) -> Result<DataKey, KeyError>;

    /// Returns false if the key was unknown or already revoked.
    async fn revoke_key(&self, key_id: &str) -> Result<bool, KeyError>;

    /// Newest unrevoked key for `scope`, if any.
    async fn active_key(&self, scope: &str) -> Result<Option<String>, KeyError>;
}

/// Local key manager keeping material in the `keys` table.
#[derive(Clone)]
pub struct SqliteKeyManager {
    store: Store,
}

impl SqliteKeyManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl KeyManager for SqliteKeyManager {
    async fn generate_key(&self, scope: &str) -> Result<String, KeyError> {
        let mut material = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut material);
        let id = uuid::Uuid::new_v4().to_string();
        let row = KeyRow {
            id: id.clone(),
            scope: scope.to_string(),
            material: material.to_vec(),
            created_at: Utc::now(),
            revoked_at: None,
        };
        material.zeroize();
        self.store.insert_key(row).await?;
        tracing::info!(key_id = %id, scope, "data key generated");
        Ok(id)
    }

    async fn get_key(&self, key_id: &str) -> Result<DataKey, KeyError> {
        let Some(mut row) = self.store.get_key(key_id).await? else {
            return Err(KeyError::NotFound(key_id.to_string()));
        };
        if row.revoked_at.is_some() {
            return Err(KeyError::Revoked(key_id.to_string()));
        }
        let parsed: Result<[u8; KEY_LEN], _> = row.material.as_slice().try_into();
        row.material.zeroize();
        let material = parsed.map_err(|_| KeyError::Malformed(key_id.to_string()))?;
        Ok(DataKey::new(row.id.clone(), material))
    }

    async fn revoke_key(&self, key_id: &str) -> Result<bool, KeyError> {
        let revoked = self.store.revoke_key(key_id, Utc::now()).await?;
        if revoked {
            tracing::info!(key_id, "data key revoked");
        }
        Ok(revoked)
    }

    async fn active_key(&self, scope: &str) -> Result<Option<String>, KeyError> {
        Ok(self.store.latest_active_key(scope).await?.map(|row| row.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_get_revoke() {
        let store = Store::open_in_memory().await.unwrap();
        let km = SqliteKeyManager::new(store);

        let id = km.generate_key("store:a").await.unwrap();
        let key = km.get_key(&id).await.unwrap();
        assert_eq!(key.id, id);
        assert_ne!(key.material(), &[0u8; KEY_LEN]);
        assert_eq!(km.active_key("store:a").await.unwrap(), Some(id.clone()));

        assert!(km.revoke_key(&id).await.unwrap());
        assert!(matches!(km.get_key(&id).await, Err(KeyError::Revoked(_))));
        assert_eq!(km.active_key("store:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let store = Store::open_in_memory().await.unwrap();
        let km = SqliteKeyManager::new(store);
        let err = km.get_key("missing").await.unwrap_err();
        assert!(matches!(err, KeyError::NotFound(_)));
        assert!(err.is_key_fault());
        assert!(!km.revoke_key("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_are_distinct() {
        let store = Store::open_in_memory().await.unwrap();
        let km = SqliteKeyManager::new(store);
        let a = km.get_key(&km.generate_key("s").await.unwrap()).await.unwrap();
        let b = km.get_key(&km.generate_key("s").await.unwrap()).await.unwrap();
        assert_ne!(a.material(), b.material());
    }

    #[test]
    fn test_debug_hides_material() {
        let key = DataKey::new("k1", [0xab; KEY_LEN]);
        let dbg = format!("{key:?}");
        assert!(dbg.contains("k1"));
        assert!(!dbg.contains("171"));
    }
}
