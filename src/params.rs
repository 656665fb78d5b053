//! Request parameter encryption and signing.
//!
//! Every authenticated call (HTTP or the socket handshake) carries a body
//! sealed with a per-request key, and a `signkey` over its parameters.
//!
//! # Key derivation
//!
//! ```text
//! zcid      = AES-CBC(ZCID_KEY, "{api_type},{imei},{first_launch_ms}")  (upper hex)
//! zcid_ext  = random hex, 6..=12 chars
//! digest    = MD5(zcid_ext)                                           (upper hex)
//! key       = even(digest)[..8] ++ even(zcid)[..12] ++ reverse(odd(zcid)[..12])
//! ```
//!
//! The 32 ASCII characters of `key` are used directly as AES-256 key material.
//!
//! # Signature
//!
//! `signkey = md5_hex("zsecure" + call_type + values sorted by key)`.

use std::collections::BTreeMap;

use rand::Rng;
use serde::Serialize;

use crate::constants::{ENC_VERSION, SIGN_PREFIX, ZCID_KEY};
use crate::crypto::{aes_cbc_encrypt, CryptoError, Encoding};

/// Shortest random extension length.
const EXTENSION_MIN_LEN: usize = 6;
/// Longest random extension length.
const EXTENSION_MAX_LEN: usize = 12;

/// Errors raised while deriving or applying request keys.
///
/// All of these mean the request parameters are structurally invalid; callers
/// must not retry them.
#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    /// A required identifier is missing, empty, or zero.
    #[error("missing required parameter: {0}")]
    MissingField(&'static str),
    /// The identifier strings are too short to derive a key from.
    #[error("cannot derive request key: {0}")]
    KeyDerivation(&'static str),
    /// Underlying cipher failure.
    #[error("{op}: {source}")]
    Crypto {
        /// Operation that failed.
        op: &'static str,
        /// Underlying cipher error.
        #[source]
        source: CryptoError,
    },
    /// Request body could not be serialized.
    #[error("serialize request body: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Build the device identifier token for a device.
///
/// Fails before any cipher work if any identifier is missing or zero.
pub fn create_zcid(api_type: u32, imei: &str, first_launch_ms: i64) -> Result<String, ParamsError> {
    if api_type == 0 {
        return Err(ParamsError::MissingField("api_type"));
    }
    if imei.is_empty() {
        return Err(ParamsError::MissingField("imei"));
    }
    if first_launch_ms <= 0 {
        return Err(ParamsError::MissingField("first_launch_time"));
    }

    let message = format!("{api_type},{imei},{first_launch_ms}");
    let sealed = aes_cbc_encrypt(ZCID_KEY.as_bytes(), message.as_bytes(), Encoding::Hex)
        .map_err(|source| ParamsError::Crypto {
            op: "create_zcid",
            source,
        })?;
    Ok(sealed.to_uppercase())
}

/// Random lowercase hex string of 6 to 12 characters.
pub fn random_extension() -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut rng = rand::rng();
    let len = rng.random_range(EXTENSION_MIN_LEN..=EXTENSION_MAX_LEN);
    (0..len)
        .map(|_| char::from(HEX[rng.random_range(0..HEX.len())]))
        .collect()
}

/// Split a string into its characters at even and odd positions.
fn split_even_odd(s: &str) -> (Vec<char>, Vec<char>) {
    let mut even = Vec::with_capacity(s.len() / 2 + 1);
    let mut odd = Vec::with_capacity(s.len() / 2);
    for (i, c) in s.chars().enumerate() {
        if i % 2 == 0 {
            even.push(c);
        } else {
            odd.push(c);
        }
    }
    (even, odd)
}

/// Derive the request key from an extension and a device identifier token.
pub fn derive_key(zcid_ext: &str, zcid: &str) -> Result<String, ParamsError> {
    if zcid_ext.is_empty() {
        return Err(ParamsError::MissingField("zcid_ext"));
    }
    let digest = format!("{:x}", md5::compute(zcid_ext.as_bytes())).to_uppercase();
    let (digest_even, _) = split_even_odd(&digest);
    let (zcid_even, zcid_odd) = split_even_odd(zcid);

    if digest_even.len() < 8 {
        return Err(ParamsError::KeyDerivation("extension digest too short"));
    }
    if zcid_even.len() < 12 || zcid_odd.len() < 12 {
        return Err(ParamsError::KeyDerivation("device identifier token too short"));
    }

    let mut key = String::with_capacity(32);
    key.extend(&digest_even[..8]);
    key.extend(&zcid_even[..12]);
    key.extend(zcid_odd[..12].iter().rev());
    Ok(key)
}

/// Compute the `signkey` for a parameter set.
///
/// Parameters are sorted by name before their values are concatenated, so
/// the result does not depend on the iteration order of `params`.
pub fn sign_key<I, K, V>(call_type: &str, params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut pairs: Vec<(K, V)> = params.into_iter().collect();
    pairs.sort_by(|a, b| a.0.as_ref().cmp(b.0.as_ref()));

    let mut input = String::from(SIGN_PREFIX);
    input.push_str(call_type);
    for (_, value) in &pairs {
        input.push_str(value.as_ref());
    }
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Per-request encryptor: device identifier token, extension, and derived key.
#[derive(Clone)]
pub struct ParamsEncryptor {
    zcid: String,
    zcid_ext: String,
    encrypt_key: String,
}

impl std::fmt::Debug for ParamsEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamsEncryptor")
            .field("zcid", &self.zcid)
            .field("zcid_ext", &self.zcid_ext)
            .finish_non_exhaustive()
    }
}

impl ParamsEncryptor {
    /// Create an encryptor with a fresh random extension.
    pub fn new(api_type: u32, imei: &str, first_launch_ms: i64) -> Result<Self, ParamsError> {
        Self::with_extension(api_type, imei, first_launch_ms, random_extension())
    }

    /// Create an encryptor with a caller-chosen extension.
    pub fn with_extension(
        api_type: u32,
        imei: &str,
        first_launch_ms: i64,
        zcid_ext: String,
    ) -> Result<Self, ParamsError> {
        let zcid = create_zcid(api_type, imei, first_launch_ms)?;
        let encrypt_key = derive_key(&zcid_ext, &zcid)?;
        Ok(Self {
            zcid,
            zcid_ext,
            encrypt_key,
        })
    }

    /// Device identifier token.
    pub fn zcid(&self) -> &str {
        &self.zcid
    }

    /// Random extension mixed into the key.
    pub fn zcid_ext(&self) -> &str {
        &self.zcid_ext
    }

    /// Derived request key (32 ASCII characters).
    pub fn encrypt_key(&self) -> &str {
        &self.encrypt_key
    }

    /// Identifier parameters that accompany an encrypted body.
    pub fn params(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("zcid".to_string(), self.zcid.clone()),
            ("zcid_ext".to_string(), self.zcid_ext.clone()),
            ("enc_ver".to_string(), ENC_VERSION.to_string()),
        ])
    }

    /// Serialize `body` to JSON and seal it with the derived key (base64).
    pub fn encrypt_body<T: Serialize + ?Sized>(&self, body: &T) -> Result<String, ParamsError> {
        let json = serde_json::to_string(body)?;
        aes_cbc_encrypt(self.encrypt_key.as_bytes(), json.as_bytes(), Encoding::Base64).map_err(
            |source| ParamsError::Crypto {
                op: "encrypt_body",
                source,
            },
        )
    }
}

/// Fully assembled parameter set for an encrypted call.
#[derive(Debug, Clone)]
pub struct EncryptedRequest {
    /// Every outgoing parameter, `signkey` included.
    pub params: BTreeMap<String, String>,
    /// Key the body was sealed with; needed to open a reply sealed the same way.
    pub enk: String,
}

/// Seal `data` and assemble the signed parameter set for `call_type`.
///
/// `first_launch_ms` is normally the current time in milliseconds.
pub fn encrypted_params<T: Serialize + ?Sized>(
    api_type: u32,
    api_version: u32,
    imei: &str,
    first_launch_ms: i64,
    data: &T,
    call_type: &str,
) -> Result<EncryptedRequest, ParamsError> {
    let encryptor = ParamsEncryptor::new(api_type, imei, first_launch_ms)?;
    let mut params = encryptor.params();
    params.insert("params".to_string(), encryptor.encrypt_body(data)?);
    params.insert("type".to_string(), api_type.to_string());
    params.insert("client_version".to_string(), api_version.to_string());

    let signkey = sign_key(call_type, &params);
    params.insert("signkey".to_string(), signkey);

    Ok(EncryptedRequest {
        params,
        enk: encryptor.encrypt_key.clone(),
    })
}
