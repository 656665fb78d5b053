//! Block-cipher primitives shared by request signing and push-event decoding.
//!
//! Everything here is a pure function over byte slices: no shared state, and
//! every cipher or padding fault comes back as a [`CryptoError`].
//!
//! # Zero IV
//!
//! The CBC helpers always use an all-zero IV. The server derives the same
//! IV, so this is a wire requirement and not a general-purpose default. Do not
//! reuse these helpers for anything that must stay confidential on its own.
//!
//! # GCM nonce size
//!
//! Push events are sealed with AES-GCM using a 16-byte nonce instead of the
//! usual 12 bytes, so the GCM types below are instantiated with `U16`.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{AesGcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

/// Nonce size used by push-event AES-GCM.
pub const GCM_NONCE_SIZE: usize = 16;

const ZERO_IV: [u8; AES_BLOCK_SIZE] = [0u8; AES_BLOCK_SIZE];

type Aes128Gcm16 = AesGcm<aes::Aes128, U16>;
type Aes192Gcm16 = AesGcm<aes::Aes192, U16>;
type Aes256Gcm16 = AesGcm<aes::Aes256, U16>;

/// Errors produced by the cryptographic primitives.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// PKCS#7 only supports block sizes in `1..=255`.
    #[error("invalid block size {0}")]
    InvalidBlockSize(usize),
    /// Input length is not a positive multiple of the block size.
    #[error("length {len} is not a multiple of block size {block_size}")]
    NotBlockAligned {
        /// Length of the offending input.
        len: usize,
        /// Block size the input was checked against.
        block_size: usize,
    },
    /// Trailing padding bytes are malformed.
    #[error("malformed PKCS#7 padding")]
    InvalidPadding,
    /// Key is not 16, 24 or 32 bytes long.
    #[error("invalid AES key length {0}")]
    InvalidKeyLength(usize),
    /// GCM IV is not [`GCM_NONCE_SIZE`] bytes long.
    #[error("invalid GCM IV length {0}")]
    InvalidIvLength(usize),
    /// The block cipher rejected its input.
    #[error("cipher failure: {0}")]
    Cipher(String),
    /// GCM tag verification failed (wrong key, IV, AAD, or tampered data).
    #[error("AES-GCM authentication failed")]
    Authentication,
    /// Input was not valid base64.
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    /// Decrypted bytes were not valid UTF-8.
    #[error("plaintext is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Text encoding for CBC ciphertext output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Lowercase hexadecimal.
    Hex,
    /// Standard base64 with padding.
    Base64,
}

/// Pad `data` to a multiple of `block_size` per PKCS#7.
///
/// A full block of padding is appended when `data` is already aligned.
pub fn pkcs7_pad(data: &[u8], block_size: usize) -> Result<Vec<u8>, CryptoError> {
    if block_size == 0 || block_size > 255 {
        return Err(CryptoError::InvalidBlockSize(block_size));
    }
    let pad = block_size - data.len() % block_size;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.resize(data.len() + pad, pad as u8);
    Ok(out)
}

/// Strip PKCS#7 padding, validating every padding byte.
pub fn pkcs7_unpad(data: &[u8], block_size: usize) -> Result<Vec<u8>, CryptoError> {
    if block_size == 0 || block_size > 255 {
        return Err(CryptoError::InvalidBlockSize(block_size));
    }
    if data.is_empty() || data.len() % block_size != 0 {
        return Err(CryptoError::NotBlockAligned {
            len: data.len(),
            block_size,
        });
    }

    let pad = usize::from(data[data.len() - 1]);
    if pad == 0 || pad > block_size {
        return Err(CryptoError::InvalidPadding);
    }
    let body_len = data.len() - pad;
    if data[body_len..].iter().any(|&b| usize::from(b) != pad) {
        return Err(CryptoError::InvalidPadding);
    }
    Ok(data[..body_len].to_vec())
}

macro_rules! cbc_encrypt_in_place {
    ($cipher:ty, $key:expr, $buf:expr) => {{
        let len = $buf.len();
        cbc::Encryptor::<$cipher>::new_from_slices($key, &ZERO_IV)
            .map_err(|e| CryptoError::Cipher(e.to_string()))?
            .encrypt_padded_mut::<NoPadding>($buf, len)
            .map_err(|e| CryptoError::Cipher(e.to_string()))?;
    }};
}

macro_rules! cbc_decrypt_in_place {
    ($cipher:ty, $key:expr, $buf:expr) => {{
        cbc::Decryptor::<$cipher>::new_from_slices($key, &ZERO_IV)
            .map_err(|e| CryptoError::Cipher(e.to_string()))?
            .decrypt_padded_mut::<NoPadding>($buf)
            .map_err(|e| CryptoError::Cipher(e.to_string()))?;
    }};
}

/// Encrypt `plaintext` with AES-CBC under a zero IV and PKCS#7 padding.
///
/// The AES variant is picked from the key length (16, 24 or 32 bytes).
pub fn aes_cbc_encrypt(
    key: &[u8],
    plaintext: &[u8],
    encoding: Encoding,
) -> Result<String, CryptoError> {
    let mut buf = pkcs7_pad(plaintext, AES_BLOCK_SIZE)?;
    match key.len() {
        16 => cbc_encrypt_in_place!(aes::Aes128, key, &mut buf),
        24 => cbc_encrypt_in_place!(aes::Aes192, key, &mut buf),
        32 => cbc_encrypt_in_place!(aes::Aes256, key, &mut buf),
        n => return Err(CryptoError::InvalidKeyLength(n)),
    }

    Ok(match encoding {
        Encoding::Hex => hex::encode(buf),
        Encoding::Base64 => BASE64.encode(buf),
    })
}

/// Decrypt base64 AES-CBC ciphertext produced under a zero IV.
pub fn aes_cbc_decrypt(key: &[u8], ciphertext_b64: &str) -> Result<Vec<u8>, CryptoError> {
    let mut buf = BASE64.decode(ciphertext_b64.trim())?;
    if buf.is_empty() || buf.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::NotBlockAligned {
            len: buf.len(),
            block_size: AES_BLOCK_SIZE,
        });
    }
    match key.len() {
        16 => cbc_decrypt_in_place!(aes::Aes128, key, &mut buf),
        24 => cbc_decrypt_in_place!(aes::Aes192, key, &mut buf),
        32 => cbc_decrypt_in_place!(aes::Aes256, key, &mut buf),
        n => return Err(CryptoError::InvalidKeyLength(n)),
    }
    pkcs7_unpad(&buf, AES_BLOCK_SIZE)
}

/// Decrypt AES-GCM `ciphertext` (tag appended) with an explicit 16-byte IV and AAD.
pub fn aes_gcm_decrypt(
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != GCM_NONCE_SIZE {
        return Err(CryptoError::InvalidIvLength(iv.len()));
    }
    let nonce = Nonce::<U16>::from_slice(iv);
    let payload = Payload {
        msg: ciphertext,
        aad,
    };

    let result = match key.len() {
        16 => Aes128Gcm16::new_from_slice(key)
            .map_err(|e| CryptoError::Cipher(e.to_string()))?
            .decrypt(nonce, payload),
        24 => Aes192Gcm16::new_from_slice(key)
            .map_err(|e| CryptoError::Cipher(e.to_string()))?
            .decrypt(nonce, payload),
        32 => Aes256Gcm16::new_from_slice(key)
            .map_err(|e| CryptoError::Cipher(e.to_string()))?
            .decrypt(nonce, payload),
        n => return Err(CryptoError::InvalidKeyLength(n)),
    };
    result.map_err(|_aead| CryptoError::Authentication)
}

/// Encrypt an HTTP request body with the base64 session secret key.
pub fn encode_aes(secret_key_b64: &str, plaintext: &str) -> Result<String, CryptoError> {
    let key = BASE64.decode(secret_key_b64.trim())?;
    aes_cbc_encrypt(&key, plaintext.as_bytes(), Encoding::Base64)
}

/// Decrypt an HTTP response body with the base64 session secret key.
///
/// The ciphertext may arrive URL-escaped; it is unescaped before decoding.
pub fn decode_aes(secret_key_b64: &str, ciphertext: &str) -> Result<String, CryptoError> {
    let key = BASE64.decode(secret_key_b64.trim())?;
    let unescaped = urlencoding::decode(ciphertext)?;
    let plain = aes_cbc_decrypt(&key, &unescaped)?;
    Ok(String::from_utf8(plain)?)
}
