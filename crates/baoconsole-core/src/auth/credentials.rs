use anyhow::{anyhow, Context, Result};
use keyring::Entry;
use rand::RngCore;

const SERVICE_NAME: &str = "bao-console";

/// Keychain entry holding the key that encrypts the persisted session.
const SESSION_KEY_ENTRY: &str = "session-key";

pub const KEY_LEN: usize = 32;

/// Secrets the console keeps in the OS keychain.
pub struct CredentialStore;

impl CredentialStore {
    /// Load the session key, generating and storing a fresh one on first use.
    pub fn session_key() -> Result<[u8; KEY_LEN]> {
        let entry = Entry::new(SERVICE_NAME, SESSION_KEY_ENTRY)
            .context("Failed to create keyring entry")?;

        match entry.get_password() {
            Ok(encoded) => decode_key(&encoded),
            Err(keyring::Error::NoEntry) => {
                let mut key = [0u8; KEY_LEN];
                rand::thread_rng().fill_bytes(&mut key);
                entry
                    .set_password(&encode_key(&key))
                    .context("Failed to store session key in keychain")?;
                Ok(key)
            }
            Err(e) => Err(e).context("Failed to retrieve session key from keychain"),
        }
    }

    /// Forget the session key. Any persisted session becomes unreadable.
    pub fn delete_session_key() -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, SESSION_KEY_ENTRY)
            .context("Failed to create keyring entry")?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete session key from keychain"),
        }
    }
}

fn encode_key(key: &[u8; KEY_LEN]) -> String {
    hex::encode(key)
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = hex::decode(encoded.trim()).context("Stored session key is not hex")?;
    <[u8; KEY_LEN]>::try_from(bytes.as_slice())
        .map_err(|_| anyhow!("Stored session key has wrong length ({} bytes)", bytes.len()))
}
