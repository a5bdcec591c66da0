//! Blob encryption and compression.
//!
//! ```text
//! Intro   = version:i8 | type:i8 | sealed_key:80 | stream_header:19
//! Frame_i = ciphertext (<= BLOB_SPLIT + 16), the last one sealed with the STREAM final flag
//! ```
//!
//! The plaintext goes through one zlib stream whose output is cut into
//! `BLOB_SPLIT` windows, each encrypted as one STREAM frame.

use crate::crypto::{self, KEY_SIZE, SEAL_OVERHEAD, TAG_SIZE};
use crate::{BlobType, Error, Result};
use chacha20poly1305::{
    aead::{
        generic_array::GenericArray,
        stream::{DecryptorBE32, EncryptorBE32},
        KeyInit, OsRng, Payload,
    },
    Key, XChaCha20Poly1305,
};
use flate2::{write::ZlibDecoder, write::ZlibEncoder, Compression};
use rand::RngCore;
use std::io::Write;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

pub const BLOB_VERSION: i8 = 1;
/// Oldest version this build still decodes.
pub const MIN_BLOB_VERSION: i8 = 1;

pub const BLOB_SPLIT: usize = 32 * 1024;
pub const STREAM_HEADER_SIZE: usize = 19;
pub const SEALED_KEY_SIZE: usize = KEY_SIZE + SEAL_OVERHEAD;
pub const INTRO_SIZE: usize = 2 + SEALED_KEY_SIZE + STREAM_HEADER_SIZE;

const FRAME_SIZE: usize = BLOB_SPLIT + TAG_SIZE;

/// Encrypts `plaintext` so that only the holder of the private key matching
/// `pkey` can read it back.
pub fn encode_blob(blob_type: BlobType, plaintext: &[u8], pkey: &PublicKey) -> Result<Vec<u8>> {
    let mut stream_key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(stream_key.as_mut());
    let mut header = [0u8; STREAM_HEADER_SIZE];
    OsRng.fill_bytes(&mut header);

    let sealed_key = crypto::seal(stream_key.as_ref(), pkey)?;
    debug_assert_eq!(sealed_key.len(), SEALED_KEY_SIZE);

    let mut out = Vec::with_capacity(INTRO_SIZE + plaintext.len() / 2 + TAG_SIZE);
    out.push(BLOB_VERSION as u8);
    out.push(blob_type as u8);
    out.extend_from_slice(&sealed_key);
    out.extend_from_slice(&header);

    // Version and type are bound to every frame
    let aad = [out[0], out[1]];

    let cipher = XChaCha20Poly1305::new(Key::from_slice(stream_key.as_ref()));
    let mut encryptor = EncryptorBE32::from_aead(cipher, GenericArray::from_slice(&header));
    let mut zlib = ZlibEncoder::new(Vec::with_capacity(BLOB_SPLIT * 2), Compression::default());

    for window in plaintext.chunks(BLOB_SPLIT) {
        zlib.write_all(window)?;

        // Keep at least one byte behind so the final frame is never empty
        let pending = zlib.get_mut();
        while pending.len() > BLOB_SPLIT {
            let tail = pending.split_off(BLOB_SPLIT);
            let frame = std::mem::replace(pending, tail);

            let ciphertext = encryptor
                .encrypt_next(Payload { msg: &frame, aad: &aad })
                .map_err(|e| Error::Encryption(e.to_string()))?;
            out.extend_from_slice(&ciphertext);
        }
    }

    let mut pending = zlib.finish()?;
    while pending.len() > BLOB_SPLIT {
        let tail = pending.split_off(BLOB_SPLIT);
        let ciphertext = encryptor
            .encrypt_next(Payload { msg: &pending, aad: &aad })
            .map_err(|e| Error::Encryption(e.to_string()))?;
        out.extend_from_slice(&ciphertext);
        pending = tail;
    }

    let ciphertext = encryptor
        .encrypt_last(Payload { msg: &pending, aad: &aad })
        .map_err(|e| Error::Encryption(e.to_string()))?;
    out.extend_from_slice(&ciphertext);

    Ok(out)
}

/// Reads the blob type without decrypting anything.
pub fn peek_type(raw: &[u8]) -> Result<BlobType> {
    if raw.len() < INTRO_SIZE {
        return Err(Error::malformed("truncated blob intro"));
    }
    check_version(raw[0] as i8)?;
    BlobType::try_from(raw[1] as i8)
}

fn check_version(version: i8) -> Result<()> {
    if version > BLOB_VERSION {
        return Err(Error::malformed(format!(
            "unexpected blob version {} (expected {})",
            version, BLOB_VERSION
        )));
    }
    if version < MIN_BLOB_VERSION {
        return Err(Error::malformed(format!(
            "blob version {} is too old and no longer supported",
            version
        )));
    }
    Ok(())
}

pub fn decode_blob(raw: &[u8], pkey: &PublicKey, skey: &StaticSecret) -> Result<(BlobType, Vec<u8>)> {
    let blob_type = peek_type(raw)?;

    let (intro, frames) = raw.split_at(INTRO_SIZE);
    let sealed_key = &intro[2..2 + SEALED_KEY_SIZE];
    let header = &intro[2 + SEALED_KEY_SIZE..];
    let aad = [intro[0], intro[1]];

    let stream_key = crypto::unseal(sealed_key, pkey, skey)
        .map_err(|_| Error::malformed("failed to unseal blob key (corrupt blob?)"))?;
    if stream_key.len() != KEY_SIZE {
        return Err(Error::malformed("unexpected blob key size"));
    }

    if frames.is_empty() {
        return Err(Error::malformed("truncated blob (missing final frame)"));
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(stream_key.as_slice()));
    let mut decryptor = DecryptorBE32::from_aead(cipher, GenericArray::from_slice(header));
    let mut zlib = ZlibDecoder::new(Vec::with_capacity(frames.len() * 2));

    let count = frames.len().div_ceil(FRAME_SIZE);
    for (i, frame) in frames.chunks(FRAME_SIZE).enumerate() {
        let payload = Payload { msg: frame, aad: &aad };

        if i + 1 == count {
            // Consumes the decryptor, nothing may follow the final frame
            return finish_decode(blob_type, decryptor.decrypt_last(payload), zlib);
        }

        let compressed = decryptor
            .decrypt_next(payload)
            .map_err(|_| Error::malformed("failed during blob decryption (truncated or corrupt)"))?;

        zlib.write_all(&compressed)
            .map_err(|e| Error::malformed(format!("failed to decompress blob: {}", e)))?;
    }

    Err(Error::malformed("truncated blob (missing final frame)"))
}

fn finish_decode(
    blob_type: BlobType,
    last: std::result::Result<Vec<u8>, chacha20poly1305::aead::Error>,
    mut zlib: ZlibDecoder<Vec<u8>>,
) -> Result<(BlobType, Vec<u8>)> {
    let compressed = last.map_err(|_| Error::malformed("failed during blob decryption (truncated or corrupt)"))?;

    zlib.write_all(&compressed)
        .map_err(|e| Error::malformed(format!("failed to decompress blob: {}", e)))?;
    let plaintext = zlib
        .finish()
        .map_err(|e| Error::malformed(format!("truncated compressed stream: {}", e)))?;

    Ok((blob_type, plaintext))
}
