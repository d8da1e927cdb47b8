//! Secret Service
//!
//! Holds the controller master key, generates per-volume secrets and
//! encrypts them with AES-256-GCM. Plaintext is length-padded before
//! encryption so ciphertexts do not leak the secret length.
//!
//! The master key itself is random. It is persisted only wrapped under a
//! key derived from the operator passphrase (PBKDF2-HMAC-SHA256 with a
//! per-cluster salt), so changing the passphrase re-wraps the same key and
//! every stored secret stays readable.

use crate::domain::ports::MasterKeyRecord;
use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use sha2::Sha256;
use tracing::info;
use zeroize::Zeroizing;

/// Length of generated volume secrets
pub const SECRET_LENGTH: usize = 20;

/// Master key length in bytes
pub const MASTER_KEY_LENGTH: usize = 32;

/// Default PBKDF2 rounds for new passphrases
pub const DEFAULT_PASSPHRASE_ROUNDS: u32 = 200_000;

const SALT_LENGTH: usize = 16;
const NONCE_LENGTH: usize = 12;
const PAD_BLOCK: usize = 16;
const LENGTH_PREFIX: usize = 4;

// =============================================================================
// Length Padding
// =============================================================================

/// 4-byte big-endian length prefix followed by random fill up to a
/// multiple of the block size
pub struct LengthPadding;

impl LengthPadding {
    pub fn conceal(plain: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let len = u32::try_from(plain.len())
            .map_err(|_| Error::Cipher("plaintext too long to pad".into()))?;
        let total = (LENGTH_PREFIX + plain.len()).div_ceil(PAD_BLOCK) * PAD_BLOCK;

        let mut out = Zeroizing::new(vec![0u8; total]);
        out[..LENGTH_PREFIX].copy_from_slice(&len.to_be_bytes());
        out[LENGTH_PREFIX..LENGTH_PREFIX + plain.len()].copy_from_slice(plain);
        rand::thread_rng().fill_bytes(&mut out[LENGTH_PREFIX + plain.len()..]);
        Ok(out)
    }

    pub fn retrieve(padded: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let prefix: [u8; LENGTH_PREFIX] = padded
            .get(..LENGTH_PREFIX)
            .and_then(|p| p.try_into().ok())
            .ok_or_else(|| Error::Cipher("padded data too short".into()))?;
        let len = u32::from_be_bytes(prefix) as usize;
        padded
            .get(LENGTH_PREFIX..LENGTH_PREFIX + len)
            .map(|plain| Zeroizing::new(plain.to_vec()))
            .ok_or_else(|| Error::Cipher("padded length exceeds data".into()))
    }
}

// =============================================================================
// Secret Service
// =============================================================================

/// Master key holder and secret cipher
#[derive(Default)]
pub struct SecretService {
    master_key: RwLock<Option<Zeroizing<Vec<u8>>>>,
}

impl std::fmt::Debug for SecretService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretService")
            .field("has_master_key", &self.has_master_key())
            .finish()
    }
}

impl SecretService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_master_key(&self) -> bool {
        self.master_key.read().is_some()
    }

    /// Install a raw 32-byte master key
    pub fn set_master_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != MASTER_KEY_LENGTH {
            return Err(Error::Cipher(format!(
                "master key must be {} bytes, got {}",
                MASTER_KEY_LENGTH,
                key.len()
            )));
        }
        *self.master_key.write() = Some(Zeroizing::new(key.to_vec()));
        info!("Master key set");
        Ok(())
    }

    /// Forget the master key
    pub fn clear_master_key(&self) {
        *self.master_key.write() = None;
    }

    /// Generate a new random master key wrapped under the passphrase
    ///
    /// Nothing is installed; persist the record first, then [`unlock`] it.
    ///
    /// [`unlock`]: SecretService::unlock
    pub fn create_master_key(&self, passphrase: &str, rounds: u32) -> Result<MasterKeyRecord> {
        let mut master_key = Zeroizing::new(vec![0u8; MASTER_KEY_LENGTH]);
        rand::thread_rng().fill_bytes(&mut master_key);
        wrap_master_key(&master_key, passphrase, rounds)
    }

    /// Unwrap a persisted master key and install it
    pub fn unlock(&self, passphrase: &str, record: &MasterKeyRecord) -> Result<()> {
        let master_key = unwrap_master_key(passphrase, record)?;
        self.set_master_key(&master_key)
    }

    /// Wrap the key of `record` under a new passphrase and a fresh salt
    pub fn rewrap(
        &self,
        old_passphrase: &str,
        new_passphrase: &str,
        record: &MasterKeyRecord,
        rounds: u32,
    ) -> Result<MasterKeyRecord> {
        let master_key = unwrap_master_key(old_passphrase, record)?;
        wrap_master_key(&master_key, new_passphrase, rounds)
    }

    /// Random alphanumeric secret
    pub fn generate_secret_string(&self, length: usize) -> Zeroizing<String> {
        Zeroizing::new(
            rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(length)
                .map(char::from)
                .collect(),
        )
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        let guard = self.master_key.read();
        let key = guard.as_ref().ok_or(Error::CryptoUnavailable)?;
        cipher_for(key)
    }

    /// Pad and encrypt; the output starts with the nonce
    pub fn encrypt_secret(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let padded = LengthPadding::conceal(plain)?;
        seal(&self.cipher()?, &padded)
    }

    /// Inverse of [`SecretService::encrypt_secret`]
    pub fn decrypt_secret(&self, encrypted: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let padded = open(&self.cipher()?, encrypted)?;
        LengthPadding::retrieve(&padded)
    }
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key).map_err(|e| Error::Cipher(e.to_string()))
}

fn seal(cipher: &Aes256Gcm, plain: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LENGTH];
    rand::thread_rng().fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plain)
        .map_err(|e| Error::Cipher(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LENGTH + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn open(cipher: &Aes256Gcm, encrypted: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if encrypted.len() <= NONCE_LENGTH {
        return Err(Error::Cipher("ciphertext too short".into()));
    }
    let (nonce, sealed) = encrypted.split_at(NONCE_LENGTH);
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map(Zeroizing::new)
        .map_err(|e| Error::Cipher(e.to_string()))
}

/// Key-encryption key for a passphrase
fn derive_wrapping_key(passphrase: &str, salt: &[u8], rounds: u32) -> Result<Zeroizing<Vec<u8>>> {
    if passphrase.is_empty() {
        return Err(Error::InvalidPassphrase {
            reason: "passphrase is empty".into(),
        });
    }
    if rounds == 0 {
        return Err(Error::Configuration("passphrase rounds must not be zero".into()));
    }
    let mut key = Zeroizing::new(vec![0u8; MASTER_KEY_LENGTH]);
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, rounds, &mut key);
    Ok(key)
}

fn wrap_master_key(master_key: &[u8], passphrase: &str, rounds: u32) -> Result<MasterKeyRecord> {
    let mut salt = [0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    let wrapping_key = derive_wrapping_key(passphrase, &salt, rounds)?;
    let wrapped = seal(&cipher_for(&wrapping_key)?, master_key)?;
    Ok(MasterKeyRecord {
        salt: BASE64.encode(salt),
        rounds,
        wrapped_key: BASE64.encode(wrapped),
    })
}

fn unwrap_master_key(passphrase: &str, record: &MasterKeyRecord) -> Result<Zeroizing<Vec<u8>>> {
    let salt = BASE64
        .decode(&record.salt)
        .map_err(|e| Error::Cipher(format!("stored salt is not base64: {}", e)))?;
    let wrapped = BASE64
        .decode(&record.wrapped_key)
        .map_err(|e| Error::Cipher(format!("stored master key is not base64: {}", e)))?;

    let wrapping_key = derive_wrapping_key(passphrase, &salt, record.rounds)?;
    // the GCM tag only verifies under the right passphrase
    let master_key = open(&cipher_for(&wrapping_key)?, &wrapped).map_err(|_| Error::PassphraseMismatch)?;
    if master_key.len() != MASTER_KEY_LENGTH {
        return Err(Error::Cipher("stored master key has the wrong length".into()));
    }
    Ok(master_key)
}
