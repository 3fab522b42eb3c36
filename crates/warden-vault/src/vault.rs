//! TemplateVault: seals embeddings into templates and opens them for comparison.
//!
//! Ciphertext layout is `nonce (12) || AES-256-GCM(ciphertext || tag)`, with
//! `"{template_id}|{store_id}"` as associated data. Each store has one active
//! key epoch; minting and rotating the epoch key is serialised per store while
//! ordinary sealing runs concurrently.

use crate::keys::{DataKey, KeyError, KeyManager};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, RwLock as EpochLock};
use warden_core::{AuditEntry, BiometricTemplate, Embedding, LegalBasis, WatchlistEntry};
use warden_store::{Store, StoreError};
use zeroize::Zeroizing;

pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum VaultError {
    /// Integrity check or key lookup failed. No partial plaintext is returned.
    #[error("template {template_id} could not be decrypted")]
    Decryption { template_id: String },
    #[error("template encryption failed")]
    Encryption,
    #[error("embedding is empty")]
    EmptyEmbedding,
    #[error("template not found: {0}")]
    NotFound(String),
    #[error("retention for template {template_id} can only be extended")]
    RetentionShortened { template_id: String },
    #[error("key service error: {0}")]
    Key(#[from] KeyError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Metadata for a template about to be sealed.
#[derive(Debug, Clone, Copy)]
pub struct NewTemplate<'a> {
    pub subject_id: Option<&'a str>,
    pub store_id: &'a str,
    pub legal_basis: LegalBasis,
    pub quality_score: f32,
    pub consent_verified: bool,
    pub retention_days: u32,
}

#[derive(Default)]
struct KeyCache {
    by_id: HashMap<String, DataKey>,
    /// store_id -> key_id of the active epoch.
    current: HashMap<String, String>,
}

pub struct TemplateVault {
    store: Store,
    keys: Arc<dyn KeyManager>,
    cache: RwLock<KeyCache>,
    epochs: Mutex<HashMap<String, Arc<EpochLock<()>>>>,
}

fn key_scope(store_id: &str) -> String {
    format!("store:{store_id}")
}

fn associated_data(template_id: &str, store_id: &str) -> Vec<u8> {
    format!("{template_id}|{store_id}").into_bytes()
}

impl TemplateVault {
    pub fn new(store: Store, keys: Arc<dyn KeyManager>) -> Self {
        Self {
            store,
            keys,
            cache: RwLock::new(KeyCache::default()),
            epochs: Mutex::new(HashMap::new()),
        }
    }

    /// Encrypt an embedding into a new template without persisting it.
    pub async fn seal(
        &self,
        meta: NewTemplate<'_>,
        embedding: &Embedding,
    ) -> Result<BiometricTemplate, VaultError> {
        let (_epoch, key) = self.epoch_key(meta.store_id).await?;
        self.seal_with(&key, meta, embedding)
    }

    /// Seal and persist.
    pub async fn store(
        &self,
        meta: NewTemplate<'_>,
        embedding: &Embedding,
    ) -> Result<BiometricTemplate, VaultError> {
        let (_epoch, key) = self.epoch_key(meta.store_id).await?;
        let template = self.seal_with(&key, meta, embedding)?;
        self.store.insert_template(template.clone()).await?;
        tracing::info!(
            template_id = %template.id,
            store_id = %template.store_id,
            key_id = %template.key_id,
            "template stored"
        );
        Ok(template)
    }

    /// Seal and persist together with the ledger entry built for it; both
    /// land or neither does.
    pub async fn store_with_audit<F>(
        &self,
        meta: NewTemplate<'_>,
        embedding: &Embedding,
        audit: F,
    ) -> Result<(BiometricTemplate, AuditEntry), VaultError>
    where
        F: FnOnce(&BiometricTemplate) -> AuditEntry + Send,
    {
        let (_epoch, key) = self.epoch_key(meta.store_id).await?;
        let template = self.seal_with(&key, meta, embedding)?;
        let entry = audit(&template);
        let entry = self
            .store
            .insert_template_with_audit(template.clone(), entry)
            .await?;
        tracing::info!(
            template_id = %template.id,
            store_id = %template.store_id,
            key_id = %template.key_id,
            "template stored"
        );
        Ok((template, entry))
    }

    /// Seal a watchlist reference template and persist it with the entry
    /// that owns it and the ledger entry, in one transaction.
    pub async fn store_watchlist_reference<F>(
        &self,
        meta: NewTemplate<'_>,
        embedding: &Embedding,
        build: F,
    ) -> Result<(BiometricTemplate, WatchlistEntry, AuditEntry), VaultError>
    where
        F: FnOnce(&BiometricTemplate) -> (WatchlistEntry, AuditEntry) + Send,
    {
        let (_epoch, key) = self.epoch_key(meta.store_id).await?;
        let template = self.seal_with(&key, meta, embedding)?;
        let (entry, audit) = build(&template);
        let audit = self
            .store
            .insert_watchlist_enrollment(template.clone(), entry.clone(), audit)
            .await?;
        tracing::info!(
            template_id = %template.id,
            entry_id = %entry.id,
            store_id = %template.store_id,
            "watchlist reference stored"
        );
        Ok((template, entry, audit))
    }

    /// Persist a template produced by [`seal`](Self::seal) together with its
    /// ledger entry. Refused if its key has been revoked since sealing.
    pub async fn persist_with_audit(
        &self,
        template: &BiometricTemplate,
        entry: AuditEntry,
    ) -> Result<AuditEntry, VaultError> {
        let lock = self.epoch_lock(&template.store_id);
        let _epoch = lock.read().await;
        self.key_by_id(&template.key_id).await?;
        let entry = self
            .store
            .insert_template_with_audit(template.clone(), entry)
            .await?;
        tracing::info!(template_id = %template.id, store_id = %template.store_id, "sealed template persisted");
        Ok(entry)
    }

    /// Open a template. Fails closed on any integrity or key problem.
    pub async fn decrypt(&self, template: &BiometricTemplate) -> Result<Embedding, VaultError> {
        let fail = || VaultError::Decryption {
            template_id: template.id.clone(),
        };

        let key = match self.key_by_id(&template.key_id).await {
            Ok(key) => key,
            Err(KeyError::Store(e)) => return Err(VaultError::Key(KeyError::Store(e))),
            Err(_) => return Err(fail()),
        };

        if template.ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(fail());
        }
        let (nonce, body) = template.ciphertext.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(key.material()).map_err(|_| fail())?;
        let aad = associated_data(&template.id, &template.store_id);
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce), Payload { msg: body, aad: &aad })
                .map_err(|_| fail())?,
        );

        let embedding = Embedding::from_le_bytes(&plaintext, Some(template.algorithm.clone()))
            .filter(|e| e.dimension() > 0)
            .ok_or_else(fail)?;
        Ok(embedding)
    }

    pub async fn get(&self, template_id: &str) -> Result<Option<BiometricTemplate>, VaultError> {
        Ok(self.store.get_template(template_id).await?)
    }

    /// Remove a template row. A missing row is `Ok(false)`.
    ///
    /// When no remaining template uses the key and the key is no longer the
    /// store's active epoch key, the key is revoked. Revocation failures are
    /// logged, not returned.
    pub async fn delete(&self, template_id: &str) -> Result<bool, VaultError> {
        let Some(template) = self.store.get_template(template_id).await? else {
            return Ok(false);
        };

        let lock = self.epoch_lock(&template.store_id);
        let _epoch = lock.write().await;

        if !self.store.delete_template(template_id).await? {
            return Ok(false);
        }
        self.deleted(&template).await;
        Ok(true)
    }

    /// Like [`delete`](Self::delete), but the row removal and the ledger
    /// entry built for it commit together. A missing row is `Ok(None)` and
    /// nothing is recorded.
    pub async fn delete_with_audit<F>(
        &self,
        template_id: &str,
        audit: F,
    ) -> Result<Option<AuditEntry>, VaultError>
    where
        F: FnOnce(&BiometricTemplate) -> AuditEntry + Send,
    {
        let Some(template) = self.store.get_template(template_id).await? else {
            return Ok(None);
        };

        let lock = self.epoch_lock(&template.store_id);
        let _epoch = lock.write().await;

        let entry = audit(&template);
        let Some(entry) = self.store.delete_template_with_audit(template_id, entry).await? else {
            return Ok(None);
        };
        self.deleted(&template).await;
        Ok(Some(entry))
    }

    /// Move `expires_at` later. An earlier or equal date is refused.
    pub async fn extend_retention(
        &self,
        template_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, VaultError> {
        let template = self
            .store
            .get_template(template_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(template_id.to_string()))?;
        if expires_at <= template.expires_at
            || !self.store.extend_template_expiry(template_id, expires_at).await?
        {
            return Err(VaultError::RetentionShortened {
                template_id: template_id.to_string(),
            });
        }
        tracing::info!(template_id, expires_at = %expires_at, "retention extended");
        Ok(expires_at)
    }

    /// Start a new key epoch for a store. Existing templates keep their key;
    /// the previous epoch key is revoked if nothing uses it.
    pub async fn rotate_key(&self, store_id: &str) -> Result<String, VaultError> {
        let lock = self.epoch_lock(store_id);
        let _epoch = lock.write().await;

        let previous = self.cached_current(store_id).map(|k| k.id.clone());
        let key_id = self.keys.generate_key(&key_scope(store_id)).await?;
        let key = self.keys.get_key(&key_id).await?;
        self.cache_current(store_id, key);
        tracing::info!(store_id, key_id = %key_id, "key epoch rotated");

        if let Some(previous) = previous {
            if let Err(e) = self.revoke_if_orphaned(store_id, &previous).await {
                tracing::warn!(key_id = %previous, error = %e, "key revocation skipped");
            }
        }
        Ok(key_id)
    }

    fn seal_with(
        &self,
        key: &DataKey,
        meta: NewTemplate<'_>,
        embedding: &Embedding,
    ) -> Result<BiometricTemplate, VaultError> {
        if embedding.dimension() == 0 {
            return Err(VaultError::EmptyEmbedding);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let aad = associated_data(&id, meta.store_id);
        let plaintext = Zeroizing::new(embedding.to_le_bytes());

        let cipher =
            Aes256Gcm::new_from_slice(key.material()).map_err(|_| VaultError::Encryption)?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let body = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_slice(),
                    aad: &aad,
                },
            )
            .map_err(|_| VaultError::Encryption)?;

        let mut ciphertext = Vec::with_capacity(NONCE_LEN + body.len());
        ciphertext.extend_from_slice(&nonce);
        ciphertext.extend_from_slice(&body);

        let created_at = Utc::now();
        Ok(BiometricTemplate {
            id,
            subject_id: meta.subject_id.map(str::to_string),
            store_id: meta.store_id.to_string(),
            ciphertext,
            key_id: key.id.clone(),
            algorithm: embedding
                .algorithm
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            quality_score: meta.quality_score,
            created_at,
            expires_at: created_at + Duration::days(i64::from(meta.retention_days)),
            legal_basis: meta.legal_basis,
            consent_verified: meta.consent_verified,
        })
    }

    /// Active epoch key for a store, minting one if the store has none. The
    /// returned guard keeps rotation and revocation out until the caller has
    /// finished persisting.
    async fn epoch_key(
        &self,
        store_id: &str,
    ) -> Result<(OwnedRwLockReadGuard<()>, DataKey), VaultError> {
        let lock = self.epoch_lock(store_id);

        let guard = lock.clone().read_owned().await;
        if let Some(key) = self.cached_current(store_id) {
            return Ok((guard, key));
        }
        drop(guard);

        {
            let _mint = lock.write().await;
            if self.cached_current(store_id).is_none() {
                let scope = key_scope(store_id);
                let key_id = match self.keys.active_key(&scope).await? {
                    Some(id) => id,
                    None => self.keys.generate_key(&scope).await?,
                };
                let key = self.keys.get_key(&key_id).await?;
                self.cache_current(store_id, key);
            }
        }

        let guard = lock.read_owned().await;
        let key = self
            .cached_current(store_id)
            .ok_or_else(|| KeyError::NotFound(key_scope(store_id)))?;
        Ok((guard, key))
    }

    async fn key_by_id(&self, key_id: &str) -> Result<DataKey, KeyError> {
        if let Some(key) = self.read_cache().by_id.get(key_id) {
            return Ok(key.clone());
        }
        let key = self.keys.get_key(key_id).await?;
        self.write_cache().by_id.insert(key.id.clone(), key.clone());
        Ok(key)
    }

    /// Caller holds the store's epoch write lock.
    async fn deleted(&self, template: &BiometricTemplate) {
        tracing::info!(template_id = %template.id, store_id = %template.store_id, "template deleted");
        if let Err(e) = self.revoke_if_orphaned(&template.store_id, &template.key_id).await {
            tracing::warn!(key_id = %template.key_id, error = %e, "key revocation skipped");
        }
    }

    /// Caller holds the store's epoch write lock.
    async fn revoke_if_orphaned(&self, store_id: &str, key_id: &str) -> Result<(), VaultError> {
        if self.cached_current(store_id).is_some_and(|k| k.id == key_id) {
            return Ok(());
        }
        if self.keys.active_key(&key_scope(store_id)).await?.as_deref() == Some(key_id) {
            return Ok(());
        }
        if self.store.count_templates_with_key(key_id).await? > 0 {
            return Ok(());
        }
        self.keys.revoke_key(key_id).await?;
        self.write_cache().by_id.remove(key_id);
        Ok(())
    }

    fn cached_current(&self, store_id: &str) -> Option<DataKey> {
        let cache = self.read_cache();
        let key_id = cache.current.get(store_id)?;
        cache.by_id.get(key_id).cloned()
    }

    fn cache_current(&self, store_id: &str, key: DataKey) {
        let mut cache = self.write_cache();
        cache.current.insert(store_id.to_string(), key.id.clone());
        cache.by_id.insert(key.id.clone(), key);
    }

    fn epoch_lock(&self, store_id: &str) -> Arc<EpochLock<()>> {
        let mut epochs = self.epochs.lock().unwrap_or_else(|e| e.into_inner());
        epochs.entry(store_id.to_string()).or_default().clone()
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, KeyCache> {
        self.cache.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, KeyCache> {
        self.cache.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SqliteKeyManager;
    use warden_core::AuditOperation;

    async fn vault() -> (TemplateVault, Store) {
        let store = Store::open_in_memory().await.unwrap();
        let keys = Arc::new(SqliteKeyManager::new(store.clone()));
        (TemplateVault::new(store.clone(), keys), store)
    }

    fn meta(store_id: &str) -> NewTemplate<'_> {
        NewTemplate {
            subject_id: Some("subject-1"),
            store_id,
            legal_basis: LegalBasis::Consent,
            quality_score: 0.9,
            consent_verified: true,
            retention_days: 30,
        }
    }

    fn embedding() -> Embedding {
        Embedding::new(vec![0.25, -1.5, 3.0, 0.0, 1e-6], Some("test/v1".into()))
    }

    #[tokio::test]
    async fn test_store_decrypt_roundtrip() {
        let (vault, store) = vault().await;
        let e = embedding();
        let t = vault.store(meta("store-1"), &e).await.unwrap();

        assert_eq!(t.algorithm, "test/v1");
        assert_eq!(t.ciphertext.len(), NONCE_LEN + e.dimension() * 4 + TAG_LEN);
        assert!(t.expires_at - t.created_at == Duration::days(30));

        let loaded = store.get_template(&t.id).await.unwrap().unwrap();
        assert_eq!(vault.decrypt(&loaded).await.unwrap(), e);
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails_closed() {
        let (vault, _) = vault().await;
        let mut t = vault.store(meta("store-1"), &embedding()).await.unwrap();
        let last = t.ciphertext.len() - 1;
        t.ciphertext[last] ^= 0x01;
        assert!(matches!(
            vault.decrypt(&t).await,
            Err(VaultError::Decryption { .. })
        ));

        t.ciphertext.truncate(4);
        assert!(matches!(
            vault.decrypt(&t).await,
            Err(VaultError::Decryption { .. })
        ));
    }

    #[tokio::test]
    async fn test_ciphertext_bound_to_row() {
        let (vault, _) = vault().await;
        let a = vault.store(meta("store-1"), &embedding()).await.unwrap();
        let mut b = vault.store(meta("store-1"), &embedding()).await.unwrap();
        b.ciphertext = a.ciphertext.clone();
        assert!(matches!(
            vault.decrypt(&b).await,
            Err(VaultError::Decryption { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_key_id_fails_closed() {
        let (vault, _) = vault().await;
        let mut t = vault.store(meta("store-1"), &embedding()).await.unwrap();
        t.key_id = "corrupted".into();
        assert!(matches!(
            vault.decrypt(&t).await,
            Err(VaultError::Decryption { .. })
        ));
    }

    #[tokio::test]
    async fn test_seal_does_not_persist() {
        let (vault, store) = vault().await;
        let t = vault.seal(meta("store-1"), &embedding()).await.unwrap();
        assert!(store.get_template(&t.id).await.unwrap().is_none());
        assert_eq!(vault.decrypt(&t).await.unwrap(), embedding());
    }

    #[tokio::test]
    async fn test_empty_embedding_rejected() {
        let (vault, _) = vault().await;
        let err = vault
            .store(meta("store-1"), &Embedding::new(vec![], None))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::EmptyEmbedding));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stores_share_one_epoch() {
        let (vault, _) = vault().await;
        let vault = Arc::new(vault);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let vault = vault.clone();
            handles.push(tokio::spawn(async move {
                vault.store(meta("store-1"), &embedding()).await.unwrap().key_id
            }));
        }
        let mut key_ids = Vec::new();
        for h in handles {
            key_ids.push(h.await.unwrap());
        }
        key_ids.dedup();
        assert_eq!(key_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_stores_get_separate_keys() {
        let (vault, _) = vault().await;
        let a = vault.store(meta("store-1"), &embedding()).await.unwrap();
        let b = vault.store(meta("store-2"), &embedding()).await.unwrap();
        assert_ne!(a.key_id, b.key_id);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (vault, store) = vault().await;
        let t = vault.store(meta("store-1"), &embedding()).await.unwrap();
        assert!(vault.delete(&t.id).await.unwrap());
        assert!(!vault.delete(&t.id).await.unwrap());
        assert!(store.get_template(&t.id).await.unwrap().is_none());
        // Active epoch key survives for future templates.
        assert!(store.get_key(&t.key_id).await.unwrap().unwrap().revoked_at.is_none());
    }

    #[tokio::test]
    async fn test_rotation_and_orphan_revocation() {
        let (vault, store) = vault().await;
        let old = vault.store(meta("store-1"), &embedding()).await.unwrap();
        let new_key = vault.rotate_key("store-1").await.unwrap();
        assert_ne!(new_key, old.key_id);

        // Old epoch still has a template, so its key is kept and still opens it.
        assert_eq!(vault.decrypt(&old).await.unwrap(), embedding());
        let fresh = vault.store(meta("store-1"), &embedding()).await.unwrap();
        assert_eq!(fresh.key_id, new_key);

        // Deleting the last template of the retired epoch revokes its key.
        assert!(vault.delete(&old.id).await.unwrap());
        let row = store.get_key(&old.key_id).await.unwrap().unwrap();
        assert!(row.revoked_at.is_some());
        assert!(row.material.is_empty());
    }

    #[tokio::test]
    async fn test_extend_retention_only_forward() {
        let (vault, _) = vault().await;
        let t = vault.store(meta("store-1"), &embedding()).await.unwrap();

        let earlier = t.expires_at - Duration::days(1);
        assert!(matches!(
            vault.extend_retention(&t.id, earlier).await,
            Err(VaultError::RetentionShortened { .. })
        ));
        let later = t.expires_at + Duration::days(1);
        assert_eq!(vault.extend_retention(&t.id, later).await.unwrap(), later);
        assert_eq!(vault.get(&t.id).await.unwrap().unwrap().expires_at, later);
        assert!(matches!(
            vault.extend_retention("missing", later).await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_store_with_audit_lands_both() {
        let (vault, store) = vault().await;
        let (t, audited) = vault
            .store_with_audit(meta("store-1"), &embedding(), |t| {
                AuditEntry::new(AuditOperation::Extract, "operator-1", "store-1")
                    .subject(t.subject_id.as_deref())
                    .details(serde_json::json!({"template_id": t.id}))
            })
            .await
            .unwrap();
        assert!(store.get_template(&t.id).await.unwrap().is_some());
        assert!(audited.entry_hash.is_some());
        assert_eq!(audited.details["template_id"], t.id.as_str());
        assert_eq!(store.audit_for_store("store-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persist_sealed_template_with_audit() {
        let (vault, store) = vault().await;
        let t = vault.seal(meta("store-1"), &embedding()).await.unwrap();
        let entry = AuditEntry::new(AuditOperation::Extract, "operator-1", "store-1");
        let stored = vault.persist_with_audit(&t, entry.clone()).await.unwrap();
        assert!(stored.entry_hash.is_some());
        assert!(store.get_template(&t.id).await.unwrap().is_some());

        let mut orphan = vault.seal(meta("store-1"), &embedding()).await.unwrap();
        orphan.key_id = "revoked-or-unknown".into();
        assert!(matches!(
            vault.persist_with_audit(&orphan, entry).await,
            Err(VaultError::Key(_))
        ));
        assert!(store.get_template(&orphan.id).await.unwrap().is_none());
        assert_eq!(store.audit_for_store("store-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_with_audit_records_once() {
        let (vault, store) = vault().await;
        let old = vault.store(meta("store-1"), &embedding()).await.unwrap();
        vault.rotate_key("store-1").await.unwrap();

        let erase = |t: &BiometricTemplate| {
            AuditEntry::new(AuditOperation::Erase, "sweeper", &t.store_id)
                .subject(t.subject_id.as_deref())
                .details(serde_json::json!({"template_id": t.id}))
        };
        let entry = vault.delete_with_audit(&old.id, erase).await.unwrap().unwrap();
        assert_eq!(entry.details["template_id"], old.id.as_str());
        assert!(store.get_template(&old.id).await.unwrap().is_none());
        // Retired epoch key goes with its last template.
        assert!(store.get_key(&old.key_id).await.unwrap().unwrap().revoked_at.is_some());

        assert!(vault.delete_with_audit(&old.id, erase).await.unwrap().is_none());
        assert_eq!(store.audit_for_store("store-1").await.unwrap().len(), 1);
    }
}
