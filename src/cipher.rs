//! Payload encryption at rest.
//!
//! AES-256-GCM with a random 96-bit nonce per record. The stored blob is
//! `nonce (12) || ciphertext+tag`. Each key is identified by a short SHA-256
//! fingerprint kept next to the record so rotated stores can still be read.
//!
//! The key file holds one base64 key per line: the first line is the active
//! key, later lines are retired keys still accepted for decryption.

use std::path::Path;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine as _;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};
use crate::memory::hex;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

#[derive(Clone)]
struct KeyMaterial {
    id: String,
    bytes: [u8; KEY_LEN],
}

impl KeyMaterial {
    fn new(bytes: [u8; KEY_LEN]) -> Self {
        let digest = Sha256::digest(bytes);
        Self { id: hex(&digest[..8]), bytes }
    }

    fn random() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill(&mut bytes[..]);
        Self::new(bytes)
    }

    fn cipher(&self) -> CoreResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.bytes)
            .map_err(|_| CoreError::Crypto("AES key must be 32 bytes".into()))
    }
}

/// Symmetric cipher for record payloads.
#[derive(Clone)]
pub struct PayloadCipher {
    active: KeyMaterial,
    retired: Vec<KeyMaterial>,
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCipher")
            .field("key_id", &self.active.id)
            .field("retired", &self.retired.len())
            .finish()
    }
}

impl PayloadCipher {
    /// A cipher with a fresh random key. Nothing is persisted.
    pub fn generate() -> Self {
        Self {
            active: KeyMaterial::random(),
            retired: Vec::new(),
        }
    }

    pub fn from_key(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            active: KeyMaterial::new(bytes),
            retired: Vec::new(),
        }
    }

    /// Read the key file, creating it with a new key if absent.
    pub fn load_or_create(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let cipher = Self::generate();
            cipher.save(path)?;
            tracing::info!(path = %path.display(), key_id = %cipher.key_id(), "created payload key");
            return Ok(cipher);
        }

        let contents = std::fs::read_to_string(path)?;
        let mut keys = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(decode_key);
        let active = keys
            .next()
            .ok_or_else(|| CoreError::Crypto(format!("key file {} is empty", path.display())))??;
        let retired = keys.collect::<CoreResult<Vec<_>>>()?;
        Ok(Self { active, retired })
    }

    /// Write all keys, active first. The file is replaced atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let b64 = base64::engine::general_purpose::STANDARD;
        let mut body = String::new();
        for key in std::iter::once(&self.active).chain(self.retired.iter()) {
            body.push_str(&b64.encode(key.bytes));
            body.push('\n');
        }

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, body)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Fingerprint of the active key.
    pub fn key_id(&self) -> &str {
        &self.active.id
    }

    /// A new cipher whose active key is fresh; the current key is retired.
    pub fn rotated(&self) -> Self {
        let mut retired = vec![self.active.clone()];
        retired.extend(self.retired.iter().cloned());
        Self {
            active: KeyMaterial::random(),
            retired,
        }
    }

    /// Drop every retired key. Call once no record references them.
    pub fn without_retired(&self) -> Self {
        Self {
            active: self.active.clone(),
            retired: Vec::new(),
        }
    }

    /// Encrypt with the active key.
    pub fn encrypt(&self, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut nonce_bytes);
        let ciphertext = self
            .active
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CoreError::Crypto(format!("AES-256-GCM encryption failed: {e}")))?;

        let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packed.extend_from_slice(&nonce_bytes);
        packed.extend_from_slice(&ciphertext);
        Ok(packed)
    }

    /// Decrypt a blob written under `key_id` (active or retired).
    pub fn decrypt(&self, key_id: &str, packed: &[u8]) -> CoreResult<Vec<u8>> {
        let key = std::iter::once(&self.active)
            .chain(self.retired.iter())
            .find(|k| k.id == key_id)
            .ok_or_else(|| CoreError::Crypto(format!("unknown key id {key_id}")))?;

        if packed.len() < NONCE_LEN + TAG_LEN {
            return Err(CoreError::Crypto("ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = packed.split_at(NONCE_LEN);
        key.cipher()?
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CoreError::Crypto("decryption failed: wrong key or corrupted data".into()))
    }
}

fn decode_key(line: &str) -> CoreResult<KeyMaterial> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(line)
        .map_err(|e| CoreError::Crypto(format!("failed to decode key: {e}")))?;
    let bytes: [u8; KEY_LEN] = raw
        .try_into()
        .map_err(|_| CoreError::Crypto("key must be 32 bytes".into()))?;
    Ok(KeyMaterial::new(bytes))
}
