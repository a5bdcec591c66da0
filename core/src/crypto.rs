//! Key material and the small authenticated-encryption formats built on it.
//!
//! * Key files wrap a 32-byte key under a password (Argon2id + XChaCha20-Poly1305).
//! * Secrets are short payloads encrypted with the repository public key used
//!   directly as a symmetric key, so that write-only users can read them.
//! * Sealed boxes encrypt anonymously to the repository public key; only the
//!   holder of the private key can open them.

use crate::{Error, KdfParams, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use tracing::error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

pub const KEY_SIZE: usize = 32;
pub const SALT_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 24;
pub const TAG_SIZE: usize = 16;
/// Ephemeral public key plus authentication tag.
pub const SEAL_OVERHEAD: usize = KEY_SIZE + TAG_SIZE;
pub const KEY_FILE_SIZE: usize = SALT_SIZE + NONCE_SIZE + KEY_SIZE + TAG_SIZE;
pub const SECRET_MAX_SIZE: usize = 2048;

const SECRET_VERSION: i8 = 1;
const SECRET_HEADER_SIZE: usize = 1 + NONCE_SIZE;
const SEAL_CONTEXT: &str = "sealsnap 2024 sealed box key";

/// Keys loaded by an authenticated disk. Dropping the set wipes it.
pub struct KeySet {
    id: Zeroizing<[u8; KEY_SIZE]>,
    pkey: PublicKey,
    skey: Option<StaticSecret>,
}

impl KeySet {
    /// Fresh repository identity: random id and an independent random keypair.
    pub fn generate() -> Self {
        let mut id = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng.fill_bytes(id.as_mut());

        let skey = StaticSecret::random_from_rng(OsRng);
        let pkey = PublicKey::from(&skey);

        Self {
            id,
            pkey,
            skey: Some(skey),
        }
    }

    pub fn write_only(pkey: [u8; KEY_SIZE]) -> Self {
        Self {
            id: Zeroizing::new([0u8; KEY_SIZE]),
            pkey: PublicKey::from(pkey),
            skey: None,
        }
    }

    /// The public key is derived from the private one.
    pub fn read_write(skey: [u8; KEY_SIZE]) -> Self {
        let skey = StaticSecret::from(skey);
        let pkey = PublicKey::from(&skey);

        Self {
            id: Zeroizing::new([0u8; KEY_SIZE]),
            pkey,
            skey: Some(skey),
        }
    }

    pub fn set_id(&mut self, id: &[u8; KEY_SIZE]) {
        self.id.copy_from_slice(id);
    }

    pub fn id(&self) -> &[u8; KEY_SIZE] {
        &self.id
    }

    pub fn public(&self) -> &PublicKey {
        &self.pkey
    }

    pub fn secret(&self) -> Option<&StaticSecret> {
        self.skey.as_ref()
    }
}

impl Drop for KeySet {
    fn drop(&mut self) {
        self.pkey.zeroize();
    }
}

/// Argon2id over `(password, salt)`. Failure means the KDF could not run
/// (typically memory exhaustion), not that the password is wrong.
pub fn derive_key(password: &str, salt: &[u8], params: &KdfParams) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let params = Params::new(params.memory, params.iterations, params.parallelism, Some(KEY_SIZE))
        .map_err(|e| Error::Encryption(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(password.as_bytes(), salt, key.as_mut())
        .map_err(|e| {
            error!("Failed to derive key from password (exhausted resource?): {}", e);
            Error::Encryption(e.to_string())
        })?;

    Ok(key)
}

/// Key file layout: `salt | nonce | ciphertext(payload + tag)`.
pub fn wrap_key(payload: &[u8; KEY_SIZE], password: &str, params: &KdfParams) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let key = derive_key(password, &salt, params)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    let ciphertext = cipher
        .encrypt(&nonce, payload.as_ref())
        .map_err(|e| Error::Encryption(e.to_string()))?;

    let mut data = Vec::with_capacity(KEY_FILE_SIZE);
    data.extend_from_slice(&salt);
    data.extend_from_slice(&nonce);
    data.extend_from_slice(&ciphertext);
    Ok(data)
}

/// Any problem with the key file itself (wrong password, tampering, bad
/// length) yields the same `Error::Authentication`.
pub fn unwrap_key(data: &[u8], password: &str, params: &KdfParams) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    if data.len() != KEY_FILE_SIZE {
        return Err(Error::Authentication);
    }

    let (salt, rest) = data.split_at(SALT_SIZE);
    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

    let key = derive_key(password, salt, params)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Authentication)?,
    );

    let mut payload = Zeroizing::new([0u8; KEY_SIZE]);
    payload.copy_from_slice(&plaintext);
    Ok(payload)
}

/// Secret file layout: `version | nonce | ciphertext(data + tag)`.
///
/// The public key is used as the symmetric key on purpose: every writer holds
/// it, so any user can recover the repository id without the private key.
pub fn encrypt_secret(pkey: &PublicKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() > SECRET_MAX_SIZE {
        return Err(Error::Other(format!(
            "Secret payload too large ({} bytes, limit is {})",
            data.len(),
            SECRET_MAX_SIZE
        )));
    }

    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(pkey.as_bytes()));
    let ciphertext = cipher
        .encrypt(&nonce, data)
        .map_err(|e| Error::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(SECRET_HEADER_SIZE + ciphertext.len());
    out.push(SECRET_VERSION as u8);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt_secret(pkey: &PublicKey, data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if data.len() < SECRET_HEADER_SIZE + TAG_SIZE || data.len() > SECRET_HEADER_SIZE + SECRET_MAX_SIZE + TAG_SIZE {
        return Err(Error::malformed("malformed secret file"));
    }
    if data[0] as i8 != SECRET_VERSION {
        return Err(Error::malformed(format!("unexpected secret version {}", data[0] as i8)));
    }

    let nonce = XNonce::from_slice(&data[1..SECRET_HEADER_SIZE]);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(pkey.as_bytes()));
    let plaintext = cipher
        .decrypt(nonce, &data[SECRET_HEADER_SIZE..])
        .map_err(|_| Error::Encryption("Failed to decrypt secret".to_string()))?;

    Ok(Zeroizing::new(plaintext))
}

fn seal_cipher(shared: &[u8; KEY_SIZE], epk: &PublicKey, rpk: &PublicKey) -> (XChaCha20Poly1305, XNonce) {
    let mut material = Zeroizing::new([0u8; 3 * KEY_SIZE]);
    material[..KEY_SIZE].copy_from_slice(shared);
    material[KEY_SIZE..2 * KEY_SIZE].copy_from_slice(epk.as_bytes());
    material[2 * KEY_SIZE..].copy_from_slice(rpk.as_bytes());
    let key = Zeroizing::new(blake3::derive_key(SEAL_CONTEXT, material.as_ref()));

    let mut hasher = blake3::Hasher::new();
    hasher.update(epk.as_bytes());
    hasher.update(rpk.as_bytes());
    let digest = hasher.finalize();
    let nonce = XNonce::clone_from_slice(&digest.as_bytes()[..NONCE_SIZE]);

    (XChaCha20Poly1305::new(Key::from_slice(key.as_ref())), nonce)
}

/// Anonymous public-key encryption. Output: `ephemeral_pk | ciphertext(payload + tag)`.
pub fn seal(payload: &[u8], recipient: &PublicKey) -> Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let epk = PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(Error::Encryption("Refusing to seal to a low-order public key".to_string()));
    }

    let (cipher, nonce) = seal_cipher(shared.as_bytes(), &epk, recipient);
    let ciphertext = cipher
        .encrypt(&nonce, payload)
        .map_err(|e| Error::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(SEAL_OVERHEAD + payload.len());
    out.extend_from_slice(epk.as_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn unseal(sealed: &[u8], pkey: &PublicKey, skey: &StaticSecret) -> Result<Zeroizing<Vec<u8>>> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(Error::malformed("sealed payload is truncated"));
    }

    let mut epk = [0u8; KEY_SIZE];
    epk.copy_from_slice(&sealed[..KEY_SIZE]);
    let epk = PublicKey::from(epk);

    let shared = skey.diffie_hellman(&epk);
    if !shared.was_contributory() {
        return Err(Error::Encryption("Failed to unseal (invalid ephemeral key)".to_string()));
    }

    let (cipher, nonce) = seal_cipher(shared.as_bytes(), &epk, pkey);
    let plaintext = cipher
        .decrypt(&nonce, &sealed[KEY_SIZE..])
        .map_err(|_| Error::Encryption("Failed to unseal (wrong key?)".to_string()))?;

    Ok(Zeroizing::new(plaintext))
}
