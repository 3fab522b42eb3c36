#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use warden_core::{
    Embedding, FeatureExtractor, LegalBasis, LegitimateInterestPolicy, NoLegitimateInterest,
    RawAnalysis, RiskLevel, StorePolicy, StorePolicyTable, VisionAnalyzer, VisionError,
    WatchlistCategory, WatchlistEntry,
};
use warden_engine::{EngineConfig, OperationContext, RecognitionService};
use warden_store::Store;
use warden_vault::{DataKey, KeyError, KeyManager, NewTemplate, SqliteKeyManager};

pub const STORE: &str = "store-1";
pub const OPERATOR: &str = "operator-1";
pub const DIM: usize = 5;
pub const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

#[derive(Clone)]
pub enum Script {
    Answer(Vec<f32>, f32),
    Unavailable,
    /// Never answer; used to cancel mid-extraction.
    Hang,
}

/// Vision collaborator double with a replaceable script.
pub struct ScriptedAnalyzer {
    script: Mutex<Script>,
    pub calls: AtomicUsize,
    pub started: Notify,
}

impl ScriptedAnalyzer {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
            started: Notify::new(),
        })
    }

    pub fn set(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionAnalyzer for ScriptedAnalyzer {
    async fn analyze(&self, _image: &[u8]) -> Result<RawAnalysis, VisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        let script = self.script.lock().unwrap().clone();
        match script {
            Script::Answer(embedding, confidence) => Ok(RawAnalysis {
                embedding,
                confidence,
            }),
            Script::Unavailable => Err(VisionError::Unavailable("connection refused".into())),
            Script::Hang => std::future::pending().await,
        }
    }
}

pub struct Harness {
    pub store: Store,
    pub service: RecognitionService,
    pub analyzer: Arc<ScriptedAnalyzer>,
}

pub async fn harness_on(
    store: Store,
    keys: Arc<dyn KeyManager>,
    script: Script,
    policy: Arc<dyn LegitimateInterestPolicy>,
    config: EngineConfig,
) -> Harness {
    let analyzer = ScriptedAnalyzer::new(script);
    let extractor = FeatureExtractor::new(analyzer.clone(), DIM)
        .with_timeout(std::time::Duration::from_secs(5))
        .with_algorithm("test-extractor/v1");
    let service = RecognitionService::new(store.clone(), keys, policy, extractor, config);
    Harness {
        store,
        service,
        analyzer,
    }
}

pub async fn harness_with(
    script: Script,
    policy: Arc<dyn LegitimateInterestPolicy>,
    config: EngineConfig,
) -> Harness {
    let store = Store::open_in_memory().await.unwrap();
    let keys = Arc::new(SqliteKeyManager::new(store.clone()));
    harness_on(store, keys, script, policy, config).await
}

pub async fn harness(script: Script) -> Harness {
    harness_with(script, Arc::new(NoLegitimateInterest), EngineConfig::default()).await
}

/// Key service that refuses every call.
pub struct UnreachableKeys;

#[async_trait]
impl KeyManager for UnreachableKeys {
    async fn generate_key(&self, _scope: &str) -> Result<String, KeyError> {
        Err(KeyError::NotFound("kms down".into()))
    }

    async fn get_key(&self, key_id: &str) -> Result<DataKey, KeyError> {
        Err(KeyError::NotFound(key_id.into()))
    }

    async fn revoke_key(&self, key_id: &str) -> Result<bool, KeyError> {
        Err(KeyError::NotFound(key_id.into()))
    }

    async fn active_key(&self, _scope: &str) -> Result<Option<String>, KeyError> {
        Err(KeyError::NotFound("kms down".into()))
    }
}

/// File-backed database, removed on drop. Lets a test reach in with a
/// second connection to break a table mid-workflow.
pub struct TempDb {
    pub path: PathBuf,
}

impl TempDb {
    pub fn new() -> Self {
        let path = std::env::temp_dir().join(format!("warden-test-{}.db", uuid::Uuid::new_v4()));
        Self { path }
    }

    pub async fn harness(&self, script: Script) -> Harness {
        let store = Store::open(&self.path).await.unwrap();
        let keys = Arc::new(SqliteKeyManager::new(store.clone()));
        harness_on(store, keys, script, security_policy(), EngineConfig::default()).await
    }

    pub fn exec(&self, sql: &str) {
        let conn = rusqlite::Connection::open(&self.path).unwrap();
        conn.execute_batch(sql).unwrap();
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut name = self.path.clone().into_os_string();
            name.push(suffix);
            let _ = std::fs::remove_file(name);
        }
    }
}

/// Policy granting legitimate interest for security processing at [`STORE`].
pub fn security_policy() -> Arc<dyn LegitimateInterestPolicy> {
    Arc::new(StorePolicyTable::from_policies([StorePolicy {
        id: STORE.into(),
        security_processing: true,
        retention_days: None,
    }]))
}

pub fn ctx(subject: Option<&str>) -> OperationContext {
    OperationContext::new(STORE, OPERATOR).subject(subject)
}

pub fn answer(values: &[f32]) -> Script {
    Script::Answer(values.to_vec(), 0.9)
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap()
}

pub fn reference_meta() -> NewTemplate<'static> {
    NewTemplate {
        subject_id: None,
        store_id: STORE,
        legal_basis: LegalBasis::LegalObligation,
        quality_score: 1.0,
        consent_verified: false,
        retention_days: 30,
    }
}

/// Seal `values` as-is (no normalisation) and reference it from an active entry.
pub async fn seed_entry(h: &Harness, id: &str, values: &[f32], minute: i64) -> WatchlistEntry {
    seed_entry_with(h, id, values, minute, reference_meta()).await
}

pub async fn seed_entry_with(
    h: &Harness,
    id: &str,
    values: &[f32],
    minute: i64,
    meta: NewTemplate<'_>,
) -> WatchlistEntry {
    let template = h
        .service
        .vault()
        .store(meta, &Embedding::new(values.to_vec(), Some("seed".into())))
        .await
        .unwrap();
    let entry = WatchlistEntry {
        id: id.into(),
        store_id: STORE.into(),
        subject_id: None,
        display_name: format!("entry {id}"),
        category: WatchlistCategory::SecurityThreat,
        risk_level: RiskLevel::High,
        template_id: template.id,
        added_by: OPERATOR.into(),
        added_at: base_time() + Duration::minutes(minute),
        is_active: true,
        legal_authorization: Some("order-17".into()),
    };
    h.store.insert_watchlist_entry(entry.clone()).await.unwrap();
    entry
}
