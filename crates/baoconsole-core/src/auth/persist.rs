//! Session persistence across restarts.
//!
//! The session is serialized to JSON and sealed with ChaCha20-Poly1305 under
//! a key kept in the OS keychain. File layout: `nonce (12 bytes) ||
//! ciphertext || tag (16 bytes)`. This keeps the token out of plaintext on
//! disk; it does not protect against anyone who can read the keychain.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::credentials::{CredentialStore, KEY_LEN};
use crate::session::Session;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.bin";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Bumped when the persisted layout changes; other versions are discarded.
const FORMAT_VERSION: u32 = 1;

pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
}

impl SessionCipher {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    /// Cipher keyed from the OS keychain, creating the key on first use.
    pub fn from_keychain() -> Result<Self> {
        Ok(Self::new(CredentialStore::session_key()?))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| anyhow!("Failed to encrypt session"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(anyhow!("Session file is truncated"));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("Session file failed authentication"))
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionCipher { .. }")
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedSession {
    version: u32,
    session: Session,
}

/// The encrypted session file in the cache directory.
pub struct SessionFile {
    path: PathBuf,
    cipher: SessionCipher,
}

impl SessionFile {
    pub fn new(cache_dir: &Path, cipher: SessionCipher) -> Self {
        Self {
            path: cache_dir.join(SESSION_FILE),
            cipher,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted session.
    ///
    /// Unreadable, tampered or foreign-version files are removed and treated
    /// as absent. Expired tokens are dropped but the namespace is kept.
    pub fn load(&self) -> Result<Option<Session>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let sealed = std::fs::read(&self.path).context("Failed to read session file")?;

        let persisted = match self
            .cipher
            .open(&sealed)
            .and_then(|plain| serde_json::from_slice::<PersistedSession>(&plain).map_err(Into::into))
        {
            Ok(persisted) if persisted.version == FORMAT_VERSION => persisted,
            Ok(persisted) => {
                debug!(version = persisted.version, "Discarding session file with unknown version");
                self.clear()?;
                return Ok(None);
            }
            Err(e) => {
                warn!(error = %e, "Discarding unreadable session file");
                self.clear()?;
                return Ok(None);
            }
        };

        let session = persisted.session;
        if session.is_expired() || !session.is_consistent() {
            debug!("Persisted token expired");
            return Ok(Some(Session::anonymous(session.namespace)));
        }
        Ok(Some(session))
    }

    /// Save session to disk
    pub fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let persisted = PersistedSession {
            version: FORMAT_VERSION,
            session: session.clone(),
        };
        let plain = serde_json::to_vec(&persisted)?;
        let sealed = self.cipher.seal(&plain)?;
        std::fs::write(&self.path, sealed).context("Failed to write session file")?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove session file")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TokenMeta;

    fn cipher() -> SessionCipher {
        SessionCipher::new([7u8; KEY_LEN])
    }

    fn authenticated(namespace: Option<&str>) -> Session {
        Session {
            token: Some("t1".to_string()),
            token_meta: Some(TokenMeta::new("acc", 3600, true, vec!["default".to_string()])),
            namespace: namespace.map(str::to_string),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = SessionFile::new(dir.path(), cipher());
        let session = authenticated(Some("team-a"));

        file.save(&session).unwrap();
        let raw = std::fs::read(file.path()).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("t1\""));

        assert_eq!(file.load().unwrap(), Some(session));
    }

    #[test]
    fn test_wrong_key_discards_file() {
        let dir = tempfile::tempdir().unwrap();
        SessionFile::new(dir.path(), cipher()).save(&authenticated(None)).unwrap();

        let other = SessionFile::new(dir.path(), SessionCipher::new([9u8; KEY_LEN]));
        assert_eq!(other.load().unwrap(), None);
        assert!(!other.path().exists());
    }

    #[test]
    fn test_expired_token_keeps_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let file = SessionFile::new(dir.path(), cipher());
        let mut session = authenticated(Some("team-a"));
        if let Some(meta) = session.token_meta.as_mut() {
            meta.expires_at = chrono::Utc::now() - chrono::Duration::seconds(5);
        }
        file.save(&session).unwrap();

        let loaded = file.load().unwrap().unwrap();
        assert!(!loaded.has_token());
        assert_eq!(loaded.namespace(), Some("team-a"));
    }

    #[test]
    fn test_truncated_input_rejected() {
        assert!(cipher().open(&[0u8; 10]).is_err());
    }
}
