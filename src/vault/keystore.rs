// # Vault Key Store
//
// Encrypted-at-rest credential store. The master key is derived from a
// passphrase with Argon2id; entries are sealed with an AEAD cipher and a
// per-entry random nonce. The store file carries a versioned header
// {version, kdf, cipher, salt, iterations} so parameters can evolve without
// breaking old stores.
//
// Decrypted material lives in zeroizing buffers and is wiped on release.
// Every read emits an access record through the attached hook, which the
// orchestrator wires to the audit log.

use crate::error::{DbError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chacha20poly1305::ChaCha20Poly1305;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use zeroize::{Zeroize, Zeroizing};

const VAULT_VERSION: u32 = 2;
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const VERIFIER_PLAINTEXT: &[u8] = b"steward-vault-verifier-v2";

/// AEAD cipher used to seal entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherKind {
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Store file location
    pub path: PathBuf,

    /// Cipher for new stores; existing stores keep their header's cipher
    pub cipher: CipherKind,

    /// Argon2id memory cost in KiB
    pub kdf_memory_kib: u32,

    /// Argon2id iteration count
    pub kdf_iterations: u32,

    /// Argon2id parallelism
    pub kdf_parallelism: u32,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/vault/store.json"),
            cipher: CipherKind::Aes256Gcm,
            kdf_memory_kib: 64 * 1024,
            kdf_iterations: 3,
            kdf_parallelism: 1,
        }
    }
}

/// Versioned store header. Salt is base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultHeader {
    version: u32,
    kdf: String,
    cipher: CipherKind,
    salt: String,
    iterations: u32,
    memory_kib: u32,
    parallelism: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedEntry {
    nonce: String,
    ciphertext: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultFile {
    header: VaultHeader,
    verifier: SealedEntry,
    entries: HashMap<String, SealedEntry>,
}

/// A decrypted secret. The buffer is zeroed when the value drops.
pub struct SecretString(Zeroizing<Vec<u8>>);

impl SecretString {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Borrow the secret for the smallest scope required.
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn expose_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.0)
            .map_err(|_| DbError::DecryptFailure("secret is not valid UTF-8".to_string()))
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretString(***)")
    }
}

/// Access record emitted on every secret read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultAccess {
    pub name: String,
    pub operation: String,
    pub at: chrono::DateTime<Utc>,
}

pub type AccessHook = Arc<dyn Fn(VaultAccess) + Send + Sync>;

/// The vault. Key derivation and crypto operations are serialized behind a
/// single mutex per the shared-resource policy.
pub struct Vault {
    config: VaultConfig,
    header: RwLock<Option<VaultHeader>>,
    master_key: Mutex<Option<Zeroizing<Vec<u8>>>>,
    entries: RwLock<HashMap<String, SealedEntry>>,
    verifier: RwLock<Option<SealedEntry>>,
    access_hook: RwLock<Option<AccessHook>>,
    redactor: RwLock<Option<Arc<crate::vault::Redactor>>>,
}

impl Vault {
    pub fn new(config: VaultConfig) -> Self {
        Self {
            config,
            header: RwLock::new(None),
            master_key: Mutex::new(None),
            entries: RwLock::new(HashMap::new()),
            verifier: RwLock::new(None),
            access_hook: RwLock::new(None),
            redactor: RwLock::new(None),
        }
    }

    /// Wire the audit hook. Set once by the orchestrator.
    pub fn set_access_hook(&self, hook: AccessHook) {
        *self.access_hook.write() = Some(hook);
    }

    /// Attach the redactor so it learns every live secret value.
    pub fn attach_redactor(&self, redactor: Arc<crate::vault::Redactor>) {
        *self.redactor.write() = Some(redactor);
    }

    /// Open (or create) the store and derive the master key from the
    /// passphrase. Wrong passphrases surface as DECRYPT_FAILURE from the
    /// verifier check; the store is untouched.
    pub fn unlock(&self, passphrase: &str) -> Result<()> {
        let existing = self.load_file()?;
        match existing {
            Some(file) => {
                let key = derive_key(passphrase, &file.header)?;
                // Verify before accepting the key.
                open_sealed(&file.header.cipher, &key, &file.verifier).map_err(|_| {
                    DbError::DecryptFailure("verifier check failed; wrong passphrase or tampered store".to_string())
                })?;
                *self.header.write() = Some(file.header);
                *self.verifier.write() = Some(file.verifier);
                *self.entries.write() = file.entries;
                *self.master_key.lock() = Some(key);
            }
            None => {
                let header = self.fresh_header()?;
                let key = derive_key(passphrase, &header)?;
                let verifier = seal(&header.cipher, &key, VERIFIER_PLAINTEXT)?;
                *self.header.write() = Some(header);
                *self.verifier.write() = Some(verifier);
                *self.entries.write() = HashMap::new();
                *self.master_key.lock() = Some(key);
                self.persist()?;
            }
        }
        self.feed_redactor()?;
        tracing::info!(path = %self.config.path.display(), "vault unlocked");
        Ok(())
    }

    /// Drop the master key and all decrypted material.
    pub fn lock(&self) {
        if let Some(mut key) = self.master_key.lock().take() {
            key.zeroize();
        }
        tracing::info!("vault locked");
    }

    pub fn is_unlocked(&self) -> bool {
        self.master_key.lock().is_some()
    }

    /// Store a secret. Replaces any existing value under the same name.
    pub fn put(&self, name: &str, value: &[u8]) -> Result<()> {
        crate::common::validate_identifier(name)?;
        let (cipher, key) = self.cipher_and_key()?;
        let sealed = seal(&cipher, &key, value)?;
        let now = Utc::now().timestamp();
        {
            let mut entries = self.entries.write();
            let entry = entries.entry(name.to_string()).or_insert_with(|| SealedEntry {
                nonce: String::new(),
                ciphertext: String::new(),
                created_at: now,
                updated_at: now,
            });
            entry.nonce = sealed.nonce;
            entry.ciphertext = sealed.ciphertext;
            entry.updated_at = now;
        }
        self.persist()?;
        if let Some(redactor) = self.redactor.read().as_ref() {
            if let Ok(text) = std::str::from_utf8(value) {
                redactor.register_secret(text);
            }
        }
        self.record_access(name, "put");
        Ok(())
    }

    /// Fetch and decrypt a secret. Emits an access record.
    pub fn get(&self, name: &str) -> Result<SecretString> {
        let (cipher, key) = self.cipher_and_key()?;
        let sealed = self
            .entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("vault entry '{}'", name)))?;
        let plaintext = open_sealed(&cipher, &key, &sealed)?;
        self.record_access(name, "get");
        Ok(SecretString(plaintext))
    }

    /// Remove a secret. Idempotent.
    pub fn delete(&self, name: &str) -> Result<()> {
        let removed = {
            let mut entries = self.entries.write();
            entries.remove(name)
        };
        if removed.is_some() {
            self.persist()?;
            self.record_access(name, "delete");
        }
        Ok(())
    }

    /// Names of stored secrets, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn cipher_and_key(&self) -> Result<(CipherKind, Zeroizing<Vec<u8>>)> {
        let cipher = self
            .header
            .read()
            .as_ref()
            .map(|h| h.cipher)
            .ok_or_else(|| DbError::MasterKeyUnavailable("vault not unlocked".to_string()))?;
        let key = self
            .master_key
            .lock()
            .as_ref()
            .cloned()
            .ok_or_else(|| DbError::MasterKeyUnavailable("vault not unlocked".to_string()))?;
        Ok((cipher, key))
    }

    fn fresh_header(&self) -> Result<VaultHeader> {
        let mut salt = [0u8; 16];
        rand::rng().fill_bytes(&mut salt);
        Ok(VaultHeader {
            version: VAULT_VERSION,
            kdf: "argon2id".to_string(),
            cipher: self.config.cipher,
            salt: B64.encode(salt),
            iterations: self.config.kdf_iterations,
            memory_kib: self.config.kdf_memory_kib,
            parallelism: self.config.kdf_parallelism,
        })
    }

    fn load_file(&self) -> Result<Option<VaultFile>> {
        if !self.config.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.config.path)?;
        let file: VaultFile = serde_json::from_str(&raw)
            .map_err(|e| DbError::DecryptFailure(format!("corrupt vault store: {}", e)))?;
        if file.header.version > VAULT_VERSION {
            return Err(DbError::Configuration(format!(
                "vault store version {} is newer than supported {}",
                file.header.version, VAULT_VERSION
            )));
        }
        Ok(Some(file))
    }

    fn persist(&self) -> Result<()> {
        let header = self
            .header
            .read()
            .clone()
            .ok_or_else(|| DbError::MasterKeyUnavailable("vault not unlocked".to_string()))?;
        let verifier = self
            .verifier
            .read()
            .clone()
            .ok_or_else(|| DbError::InvariantViolated("vault verifier missing".to_string()))?;
        let file = VaultFile {
            header,
            verifier,
            entries: self.entries.read().clone(),
        };
        if let Some(parent) = self.config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.config.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;
        std::fs::rename(&tmp, &self.config.path)?;
        Ok(())
    }

    /// Push every live secret into the redactor's dynamic set.
    fn feed_redactor(&self) -> Result<()> {
        let redactor = match self.redactor.read().as_ref() {
            Some(r) => Arc::clone(r),
            None => return Ok(()),
        };
        let (cipher, key) = self.cipher_and_key()?;
        for sealed in self.entries.read().values() {
            if let Ok(plain) = open_sealed(&cipher, &key, sealed) {
                if let Ok(text) = std::str::from_utf8(&plain) {
                    redactor.register_secret(text);
                }
            }
        }
        Ok(())
    }

    fn record_access(&self, name: &str, operation: &str) {
        if let Some(hook) = self.access_hook.read().as_ref() {
            hook(VaultAccess {
                name: name.to_string(),
                operation: operation.to_string(),
                at: Utc::now(),
            });
        }
    }
}

fn derive_key(passphrase: &str, header: &VaultHeader) -> Result<Zeroizing<Vec<u8>>> {
    let salt = B64
        .decode(&header.salt)
        .map_err(|e| DbError::DecryptFailure(format!("corrupt salt: {}", e)))?;
    let params = Params::new(header.memory_kib, header.iterations, header.parallelism, Some(KEY_LEN))
        .map_err(|e| DbError::Configuration(format!("bad KDF parameters: {}", e)))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = Zeroizing::new(vec![0u8; KEY_LEN]);
    argon
        .hash_password_into(passphrase.as_bytes(), &salt, &mut key)
        .map_err(|e| DbError::MasterKeyUnavailable(format!("key derivation failed: {}", e)))?;
    Ok(key)
}

fn seal(cipher: &CipherKind, key: &[u8], plaintext: &[u8]) -> Result<SealedEntry> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    let ciphertext = match cipher {
        CipherKind::Aes256Gcm => {
            let aead = Aes256Gcm::new_from_slice(key)
                .map_err(|e| DbError::Internal(format!("cipher init: {}", e)))?;
            aead.encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
                .map_err(|_| DbError::Internal("encryption failed".to_string()))?
        }
        CipherKind::ChaCha20Poly1305 => {
            let aead = ChaCha20Poly1305::new_from_slice(key)
                .map_err(|e| DbError::Internal(format!("cipher init: {}", e)))?;
            aead.encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
                .map_err(|_| DbError::Internal("encryption failed".to_string()))?
        }
    };
    let now = Utc::now().timestamp();
    Ok(SealedEntry {
        nonce: B64.encode(nonce),
        ciphertext: B64.encode(ciphertext),
        created_at: now,
        updated_at: now,
    })
}

fn open_sealed(
    cipher: &CipherKind,
    key: &[u8],
    sealed: &SealedEntry,
) -> Result<Zeroizing<Vec<u8>>> {
    let nonce = B64
        .decode(&sealed.nonce)
        .map_err(|e| DbError::DecryptFailure(format!("corrupt nonce: {}", e)))?;
    let ciphertext = B64
        .decode(&sealed.ciphertext)
        .map_err(|e| DbError::DecryptFailure(format!("corrupt ciphertext: {}", e)))?;
    if nonce.len() != NONCE_LEN {
        return Err(DbError::DecryptFailure("nonce length mismatch".to_string()));
    }
    let plaintext = match cipher {
        CipherKind::Aes256Gcm => {
            let aead = Aes256Gcm::new_from_slice(key)
                .map_err(|e| DbError::Internal(format!("cipher init: {}", e)))?;
            aead.decrypt(aes_gcm::Nonce::from_slice(&nonce), ciphertext.as_slice())
                .map_err(|_| DbError::DecryptFailure("authentication failed".to_string()))?
        }
        CipherKind::ChaCha20Poly1305 => {
            let aead = ChaCha20Poly1305::new_from_slice(key)
                .map_err(|e| DbError::Internal(format!("cipher init: {}", e)))?;
            aead.decrypt(
                chacha20poly1305::Nonce::from_slice(&nonce),
                ciphertext.as_slice(),
            )
            .map_err(|_| DbError::DecryptFailure("authentication failed".to_string()))?
        }
    };
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> VaultConfig {
        VaultConfig {
            path: dir.path().join("store.json"),
            cipher: CipherKind::Aes256Gcm,
            // Small KDF costs keep tests fast; production defaults are higher.
            kdf_memory_kib: 8 * 1024,
            kdf_iterations: 1,
            kdf_parallelism: 1,
        }
    }

    #[test]
    fn put_get_roundtrip_and_replace() {
        let dir = TempDir::new().unwrap();
        let vault = Vault::new(test_config(&dir));
        vault.unlock("passphrase").unwrap();

        vault.put("pg-prod", b"s3cret").unwrap();
        assert_eq!(vault.get("pg-prod").unwrap().expose(), b"s3cret");

        vault.put("pg-prod", b"rotated").unwrap();
        assert_eq!(vault.get("pg-prod").unwrap().expose(), b"rotated");
        assert_eq!(vault.list(), vec!["pg-prod".to_string()]);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let vault = Vault::new(test_config(&dir));
        vault.unlock("passphrase").unwrap();
        vault.put("k", b"v").unwrap();
        vault.delete("k").unwrap();
        vault.delete("k").unwrap();
        assert!(matches!(vault.get("k"), Err(DbError::NotFound(_))));
    }

    #[test]
    fn wrong_passphrase_is_detected() {
        let dir = TempDir::new().unwrap();
        {
            let vault = Vault::new(test_config(&dir));
            vault.unlock("right").unwrap();
            vault.put("k", b"v").unwrap();
        }
        let vault = Vault::new(test_config(&dir));
        let err = vault.unlock("wrong").unwrap_err();
        assert_eq!(err.code(), "DECRYPT_FAILURE");
        assert!(!vault.is_unlocked());
    }

    #[test]
    fn locked_vault_refuses_operations() {
        let dir = TempDir::new().unwrap();
        let vault = Vault::new(test_config(&dir));
        assert!(matches!(
            vault.get("k"),
            Err(DbError::MasterKeyUnavailable(_))
        ));
        vault.unlock("p").unwrap();
        vault.put("k", b"v").unwrap();
        vault.lock();
        assert!(matches!(
            vault.get("k"),
            Err(DbError::MasterKeyUnavailable(_))
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_decrypt() {
        let dir = TempDir::new().unwrap();
        let vault = Vault::new(test_config(&dir));
        vault.unlock("p").unwrap();
        vault.put("k", b"payload").unwrap();
        {
            let mut entries = vault.entries.write();
            let entry = entries.get_mut("k").unwrap();
            let mut raw = B64.decode(&entry.ciphertext).unwrap();
            raw[0] ^= 0x01;
            entry.ciphertext = B64.encode(raw);
        }
        assert!(matches!(vault.get("k"), Err(DbError::DecryptFailure(_))));
    }

    #[test]
    fn survives_reopen_with_chacha() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.cipher = CipherKind::ChaCha20Poly1305;
        {
            let vault = Vault::new(config.clone());
            vault.unlock("p").unwrap();
            vault.put("redis-stage", b"tok").unwrap();
        }
        let vault = Vault::new(config);
        vault.unlock("p").unwrap();
        assert_eq!(vault.get("redis-stage").unwrap().expose(), b"tok");
    }

    #[test]
    fn access_hook_fires_on_read() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let dir = TempDir::new().unwrap();
        let vault = Vault::new(test_config(&dir));
        vault.unlock("p").unwrap();
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reads);
        vault.set_access_hook(Arc::new(move |access| {
            if access.operation == "get" {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        vault.put("k", b"v").unwrap();
        vault.get("k").unwrap();
        vault.get("k").unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }
}
