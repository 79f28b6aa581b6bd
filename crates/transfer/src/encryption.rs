//! Optional AES-256-GCM stage and the local key store.
//!
//! Encrypted payloads are laid out as `nonce (12 B) || ciphertext`. The
//! stage runs after compression on upload and before decompression on
//! download.

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use tracing::debug;

use crate::TransferError;
use crate::types::Chunk;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// A chunk cipher bound to one key.
pub struct ChunkCipher {
    key_id: String,
    cipher: Aes256Gcm,
}

impl fmt::Debug for ChunkCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkCipher")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl ChunkCipher {
    pub fn new(key_id: impl Into<String>, key: &[u8; KEY_LEN]) -> Result<Self, TransferError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| TransferError::Encryption(format!("invalid key: {e}")))?;
        Ok(Self {
            key_id: key_id.into(),
            cipher,
        })
    }

    /// Identifier recorded in the manifest for this key.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, TransferError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        #[allow(deprecated)]
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ct = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| TransferError::Encryption(format!("encryption failed: {e}")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Decrypts `nonce || ciphertext`. Tampered data fails authentication.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, TransferError> {
        if data.len() < NONCE_LEN {
            return Err(TransferError::Encryption("ciphertext too short".into()));
        }
        let (nonce_bytes, ct) = data.split_at(NONCE_LEN);
        #[allow(deprecated)]
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ct)
            .map_err(|e| TransferError::Encryption(format!("decryption failed: {e}")))
    }

    /// Applies the encryption stage to `chunk`.
    pub fn encrypt_chunk(&self, mut chunk: Chunk) -> Result<Chunk, TransferError> {
        if chunk.encrypted {
            return Ok(chunk);
        }
        chunk.data = self.encrypt(&chunk.data)?;
        chunk.encrypted = true;
        Ok(chunk)
    }

    /// Reverses [`encrypt_chunk`](Self::encrypt_chunk).
    pub fn decrypt_chunk(&self, mut chunk: Chunk) -> Result<Chunk, TransferError> {
        if !chunk.encrypted {
            return Ok(chunk);
        }
        chunk.data = self.decrypt(&chunk.data)?;
        chunk.encrypted = false;
        Ok(chunk)
    }
}

/// Persistent store of encryption keys, indexed by key id.
///
/// Keys are cached in memory and persisted as a JSON object of
/// `key_id -> hex key`. Writes hold an exclusive lock on `<path>.lock` and
/// merge into whatever is on disk, so stores opened by other processes never
/// erase each other's keys.
pub struct KeyStore {
    path: PathBuf,
    keys: RwLock<HashMap<String, String>>,
}

impl KeyStore {
    /// Opens the store at `path`, loading existing keys.
    pub fn open(path: PathBuf) -> Result<Self, TransferError> {
        let keys = load_keys(&path)?;
        Ok(Self {
            path,
            keys: RwLock::new(keys),
        })
    }

    /// Generates and persists a new random key. Returns its id.
    pub fn generate(&self) -> Result<String, TransferError> {
        let key: [u8; KEY_LEN] = rand::random();
        let key_id = uuid::Uuid::new_v4().to_string();

        let _lock = lock_exclusive(&self.path)?;
        let mut on_disk = load_keys(&self.path)?;
        on_disk.insert(key_id.clone(), hex::encode(key));
        write_keys(&self.path, &on_disk)?;
        *self.keys.write().unwrap_or_else(PoisonError::into_inner) = on_disk;
        Ok(key_id)
    }

    /// Builds a cipher for `key_id`, reloading the file once if the key was
    /// added after this store was opened.
    pub fn cipher(&self, key_id: &str) -> Result<ChunkCipher, TransferError> {
        let cached = self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key_id)
            .cloned();
        let encoded = match cached {
            Some(encoded) => encoded,
            None => {
                let fresh = load_keys(&self.path)?;
                let found = fresh.get(key_id).cloned();
                *self.keys.write().unwrap_or_else(PoisonError::into_inner) = fresh;
                found.ok_or_else(|| TransferError::KeyNotFound(key_id.to_string()))?
            }
        };
        let bytes = hex::decode(&encoded)
            .map_err(|e| TransferError::Encryption(format!("stored key {key_id}: {e}")))?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            TransferError::Encryption(format!("stored key {key_id} has the wrong length"))
        })?;
        ChunkCipher::new(key_id, &key)
    }

    /// Returns all stored key ids, sorted.
    pub fn key_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Holds an advisory lock on the sidecar `<path>.lock` until dropped.
fn lock_exclusive(path: &Path) -> Result<File, TransferError> {
    std::fs::create_dir_all(parent_dir(path))?;
    let mut lock_path = path.as_os_str().to_owned();
    lock_path.push(".lock");
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(PathBuf::from(lock_path))?;
    file.lock()?;
    Ok(file)
}

/// Writes the keys through a temporary file in the same directory, so a
/// crash never leaves a half-written store. The temporary file is created
/// owner-only on Unix.
fn write_keys(path: &Path, keys: &HashMap<String, String>) -> Result<(), TransferError> {
    let json = serde_json::to_string_pretty(keys)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent_dir(path))?;
    tmp.write_all(json.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| TransferError::Io(e.error))?;
    debug!("persisted {} key(s) to {:?}", keys.len(), path);
    Ok(())
}

fn load_keys(path: &Path) -> Result<HashMap<String, String>, TransferError> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    let keys: HashMap<String, String> = serde_json::from_str(&data)?;
    debug!("loaded {} key(s) from {:?}", keys.len(), path);
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, KeyStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = KeyStore::open(tmp.path().join("keys.json")).unwrap();
        (tmp, store)
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = ChunkCipher::new("k1", &[7u8; KEY_LEN]).unwrap();
        let ct = cipher.encrypt(b"secret chunk").unwrap();
        assert_eq!(ct.len(), NONCE_LEN + b"secret chunk".len() + 16);
        assert_eq!(cipher.decrypt(&ct).unwrap(), b"secret chunk");
    }

    #[test]
    fn nonces_differ_between_calls() {
        let cipher = ChunkCipher::new("k1", &[7u8; KEY_LEN]).unwrap();
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let cipher = ChunkCipher::new("k1", &[7u8; KEY_LEN]).unwrap();
        let mut ct = cipher.encrypt(b"secret chunk").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(matches!(
            cipher.decrypt(&ct),
            Err(TransferError::Encryption(_))
        ));
        assert!(cipher.decrypt(&[0u8; 4]).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let a = ChunkCipher::new("a", &[1u8; KEY_LEN]).unwrap();
        let b = ChunkCipher::new("b", &[2u8; KEY_LEN]).unwrap();
        let ct = a.encrypt(b"data").unwrap();
        assert!(b.decrypt(&ct).is_err());
    }

    #[test]
    fn chunk_stage_roundtrip() {
        let cipher = ChunkCipher::new("k1", &[9u8; KEY_LEN]).unwrap();
        let chunk = Chunk::new(3, 0, b"payload".to_vec());
        let sealed = cipher.encrypt_chunk(chunk.clone()).unwrap();
        assert!(sealed.encrypted);
        assert_ne!(sealed.data, chunk.data);
        assert_eq!(cipher.decrypt_chunk(sealed).unwrap(), chunk);
    }

    #[test]
    fn debug_does_not_print_key() {
        let cipher = ChunkCipher::new("visible-id", &[0xAA; KEY_LEN]).unwrap();
        let out = format!("{cipher:?}");
        assert!(out.contains("visible-id"));
        assert!(!out.contains("aaaa"));
    }

    #[test]
    fn store_generate_and_reload() {
        let (tmp, store) = test_store();
        let id = store.generate().unwrap();
        let ct = store.cipher(&id).unwrap().encrypt(b"hello").unwrap();

        let reloaded = KeyStore::open(tmp.path().join("keys.json")).unwrap();
        assert_eq!(reloaded.key_ids(), vec![id.clone()]);
        assert_eq!(reloaded.cipher(&id).unwrap().decrypt(&ct).unwrap(), b"hello");
    }

    #[test]
    fn store_missing_key() {
        let (_tmp, store) = test_store();
        assert!(matches!(
            store.cipher("nope"),
            Err(TransferError::KeyNotFound(_))
        ));
    }

    #[test]
    fn stores_sharing_a_file_keep_each_others_keys() {
        let (tmp, first) = test_store();
        let second = KeyStore::open(tmp.path().join("keys.json")).unwrap();

        let a = first.generate().unwrap();
        let b = second.generate().unwrap();

        let reopened = KeyStore::open(tmp.path().join("keys.json")).unwrap();
        assert!(reopened.cipher(&a).is_ok());
        assert!(reopened.cipher(&b).is_ok());
        // A key written by another handle is picked up on a miss.
        let ct = second.cipher(&b).unwrap().encrypt(b"x").unwrap();
        assert_eq!(first.cipher(&b).unwrap().decrypt(&ct).unwrap(), b"x");
    }

    #[test]
    fn concurrent_generates_lose_no_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("keys.json");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || KeyStore::open(path).unwrap().generate().unwrap())
            })
            .collect();
        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let reopened = KeyStore::open(path).unwrap();
        assert_eq!(reopened.key_ids().len(), 8);
        for id in &ids {
            assert!(reopened.cipher(id).is_ok());
        }
    }

    #[test]
    fn store_creates_parent_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("dir").join("keys.json");
        let store = KeyStore::open(path.clone()).unwrap();
        store.generate().unwrap();
        assert!(path.exists());
    }
}
