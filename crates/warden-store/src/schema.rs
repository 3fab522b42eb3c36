//! SQLite schema. Applied idempotently on open.

pub(crate) const PRAGMAS: &str = "
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA foreign_keys=ON;
PRAGMA busy_timeout=5000;
PRAGMA secure_delete=ON;
";

pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS templates (
    id               TEXT PRIMARY KEY,
    subject_id       TEXT,
    store_id         TEXT NOT NULL,
    ciphertext       BLOB NOT NULL,
    key_id           TEXT NOT NULL,
    algorithm        TEXT NOT NULL,
    quality_score    REAL NOT NULL,
    created_at       TEXT NOT NULL,
    expires_at       TEXT NOT NULL,
    legal_basis      TEXT NOT NULL,
    consent_verified INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_templates_subject ON templates(subject_id, store_id);
CREATE INDEX IF NOT EXISTS idx_templates_expires ON templates(expires_at);
CREATE INDEX IF NOT EXISTS idx_templates_key ON templates(key_id);

CREATE TABLE IF NOT EXISTS watchlist (
    id                  TEXT PRIMARY KEY,
    store_id            TEXT NOT NULL,
    subject_id          TEXT,
    display_name        TEXT NOT NULL,
    category            TEXT NOT NULL,
    risk_level          TEXT NOT NULL,
    template_id         TEXT NOT NULL,
    added_by            TEXT NOT NULL,
    added_at            TEXT NOT NULL,
    is_active           INTEGER NOT NULL,
    legal_authorization TEXT
);
CREATE INDEX IF NOT EXISTS idx_watchlist_store ON watchlist(store_id, is_active);
CREATE UNIQUE INDEX IF NOT EXISTS idx_watchlist_active_template
    ON watchlist(template_id) WHERE is_active = 1;

CREATE TABLE IF NOT EXISTS consent (
    id            TEXT PRIMARY KEY,
    subject_id    TEXT,
    store_id      TEXT NOT NULL,
    purpose       TEXT NOT NULL,
    consent_given INTEGER NOT NULL,
    legal_basis   TEXT NOT NULL,
    consent_date  TEXT NOT NULL,
    withdrawn_at  TEXT
);
CREATE INDEX IF NOT EXISTS idx_consent_subject ON consent(subject_id, store_id, purpose);

CREATE TRIGGER IF NOT EXISTS consent_withdrawal_permanent
BEFORE UPDATE OF withdrawn_at ON consent
WHEN OLD.withdrawn_at IS NOT NULL
BEGIN
    SELECT RAISE(ABORT, 'consent withdrawal is permanent');
END;

CREATE TABLE IF NOT EXISTS audit (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    id             TEXT NOT NULL UNIQUE,
    operation      TEXT NOT NULL,
    actor_id       TEXT NOT NULL,
    store_id       TEXT NOT NULL,
    subject_id     TEXT,
    consent_status TEXT NOT NULL,
    legal_basis    TEXT,
    outcome        TEXT NOT NULL,
    timestamp      TEXT NOT NULL,
    details        TEXT NOT NULL,
    prev_hash      TEXT,
    entry_hash     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_subject ON audit(subject_id, store_id);

CREATE TRIGGER IF NOT EXISTS audit_no_update
BEFORE UPDATE ON audit
BEGIN
    SELECT RAISE(ABORT, 'audit entries are immutable');
END;

CREATE TRIGGER IF NOT EXISTS audit_no_delete
BEFORE DELETE ON audit
BEGIN
    SELECT RAISE(ABORT, 'audit entries are immutable');
END;

CREATE TABLE IF NOT EXISTS keys (
    id         TEXT PRIMARY KEY,
    scope      TEXT NOT NULL,
    material   BLOB NOT NULL,
    created_at TEXT NOT NULL,
    revoked_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_keys_scope ON keys(scope, created_at);
";
