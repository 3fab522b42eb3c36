//! warden-vault: Encrypted template storage.
//!
//! Embeddings are sealed with AES-256-GCM under per-store data keys obtained
//! from a [`KeyManager`]. Plaintext exists only in zeroised buffers while a
//! template is being sealed or opened.

mod keys;
mod vault;

pub use keys::{DataKey, KeyError, KeyManager, SqliteKeyManager, KEY_LEN};
pub use vault::{NewTemplate, TemplateVault, VaultError, NONCE_LEN};
