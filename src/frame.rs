//! Binary frame codec and encrypted-envelope decoding.
//!
//! # Wire Format
//!
//! ```text
//! [version: u8][command: u16 LE][subcommand: u8][body...]
//! ```
//!
//! Outbound bodies are plain JSON. Inbound bodies are an [`Envelope`]:
//!
//! ```json
//! { "key": null, "encrypt": 2, "error_code": 0, "error_message": "", "data": "..." }
//! ```
//!
//! `data` is decoded according to `encrypt`:
//!
//! | `encrypt` | Steps |
//! |---|---|
//! | 0 | `data` is the JSON body |
//! | 1 | base64 → JSON |
//! | 2 | URL-unescape → base64 → AES-GCM → gunzip → JSON |
//! | 3 | URL-unescape → base64 → AES-GCM → JSON |
//!
//! The AES-GCM buffer is laid out as `IV[0..16] | AAD[16..32] | ciphertext[32..]`.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::compression::{gunzip, CompressionError};
use crate::constants::{
    CMD_CIPHER_KEY, CMD_DUPLICATE_CONNECTION, CMD_GROUP_MESSAGES, CMD_OLD_GROUP_MESSAGES,
    CMD_OLD_GROUP_REACTIONS, CMD_OLD_USER_MESSAGES, CMD_OLD_USER_REACTIONS, CMD_PING,
    CMD_USER_MESSAGES, FRAME_HEADER_LEN, FRAME_VERSION,
};
use crate::crypto::{aes_gcm_decrypt, CryptoError, GCM_NONCE_SIZE};
use crate::models::ThreadType;

/// Length of the AAD slice inside an encrypted buffer.
const GCM_AAD_LEN: usize = 16;

/// Smallest encrypted buffer: IV + AAD + one 16-byte block (the tag).
pub const MIN_ENCRYPTED_LEN: usize = GCM_NONCE_SIZE + GCM_AAD_LEN + 16;

/// Base64 engine tolerant of missing padding, as the server omits it at times.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Errors raised while decoding an inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Frame shorter than the 4-byte header.
    #[error("frame too short for header: {len} bytes")]
    Header {
        /// Length of the frame received.
        len: usize,
    },
    /// Frame body is not an envelope object.
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    /// `encrypt` tag outside `0..=3`.
    #[error("unsupported encryption type {0}")]
    UnsupportedEncryption(u8),
    /// A keyed envelope arrived before a cipher key was delivered.
    #[error("encrypted envelope received without a cipher key")]
    MissingCipherKey,
    /// The cipher key itself is not valid base64.
    #[error("cipher key is not valid base64: {0}")]
    InvalidCipherKey(#[source] base64::DecodeError),
    /// A cipher-key frame carried no `key` field.
    #[error("cipher key frame has no key")]
    NoKeyInFrame,
    /// `data` must be a string for this encryption type.
    #[error("envelope data is not a string")]
    DataNotString,
    /// `data` could not be URL-unescaped.
    #[error("envelope data is not valid URL-escaped text")]
    UrlDecode(#[source] std::string::FromUtf8Error),
    /// `data` could not be base64-decoded.
    #[error("envelope data is not valid base64: {0}")]
    Base64(#[source] base64::DecodeError),
    /// Encrypted buffer is smaller than IV + AAD + tag.
    #[error("encrypted payload too short: {len} bytes (need at least {MIN_ENCRYPTED_LEN})")]
    TooShort {
        /// Length of the decoded buffer.
        len: usize,
    },
    /// AES-GCM decryption failed.
    #[error("decrypt: {0}")]
    Decrypt(#[source] CryptoError),
    /// Gzip inflate failed.
    #[error("decompress: {0}")]
    Decompress(#[source] CompressionError),
    /// Final payload is not UTF-8.
    #[error("payload is not valid UTF-8")]
    Utf8(#[source] std::string::FromUtf8Error),
    /// Final payload is not the expected JSON.
    #[error("payload JSON: {0}")]
    Json(#[source] serde_json::Error),
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version.
    pub version: u8,
    /// Command number.
    pub command: u16,
    /// Subcommand number.
    pub subcommand: u8,
    /// Raw body bytes (JSON outbound, envelope JSON inbound).
    pub body: Vec<u8>,
}

impl Frame {
    /// Build a frame from raw parts.
    pub fn new(version: u8, command: u16, subcommand: u8, body: Vec<u8>) -> Self {
        Self {
            version,
            command,
            subcommand,
            body,
        }
    }

    /// Build a frame whose body is `body` serialized as JSON.
    pub fn json<T: Serialize + ?Sized>(
        version: u8,
        command: u16,
        subcommand: u8,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(version, command, subcommand, serde_json::to_vec(body)?))
    }

    /// Serialize header and body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.body.len());
        out.push(self.version);
        out.extend_from_slice(&self.command.to_le_bytes());
        out.push(self.subcommand);
        out.extend_from_slice(&self.body);
        out
    }

    /// Split a raw frame into header fields and body.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(DecodeError::Header { len: bytes.len() });
        }
        Ok(Self {
            version: bytes[0],
            command: u16::from_le_bytes([bytes[1], bytes[2]]),
            subcommand: bytes[3],
            body: bytes[FRAME_HEADER_LEN..].to_vec(),
        })
    }

    /// Route this frame by its `(version, command, subcommand)` triple.
    pub fn kind(&self) -> FrameKind {
        FrameKind::from_header(self.version, self.command, self.subcommand)
    }
}

/// Known frame kinds. Anything else is [`FrameKind::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `(1,1,1)` cipher-key delivery.
    CipherKey,
    /// `(1,2,1)` keepalive ping.
    Ping,
    /// `(1,501,0)` / `(1,521,0)` live message batch.
    Messages(ThreadType),
    /// `(1,510,1)` / `(1,511,1)` old-message backfill.
    OldMessages(ThreadType),
    /// `(1,610,1)` / `(1,611,1)` old-reaction backfill.
    OldReactions(ThreadType),
    /// `(1,3000,0)` duplicate-connection kick.
    DuplicateConnection,
    /// Unrecognized triple; ignored.
    Unknown,
}

impl FrameKind {
    /// Classify a header triple.
    pub fn from_header(version: u8, command: u16, subcommand: u8) -> Self {
        if version != FRAME_VERSION {
            return Self::Unknown;
        }
        match (command, subcommand) {
            CMD_CIPHER_KEY => Self::CipherKey,
            CMD_PING => Self::Ping,
            CMD_USER_MESSAGES => Self::Messages(ThreadType::User),
            CMD_GROUP_MESSAGES => Self::Messages(ThreadType::Group),
            CMD_OLD_USER_MESSAGES => Self::OldMessages(ThreadType::User),
            CMD_OLD_GROUP_MESSAGES => Self::OldMessages(ThreadType::Group),
            CMD_OLD_USER_REACTIONS => Self::OldReactions(ThreadType::User),
            CMD_OLD_GROUP_REACTIONS => Self::OldReactions(ThreadType::Group),
            CMD_DUPLICATE_CONNECTION => Self::DuplicateConnection,
            _ => Self::Unknown,
        }
    }
}

/// Encoding applied to an envelope's `data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    /// Plain JSON.
    None,
    /// Base64 JSON.
    Base64,
    /// AES-GCM over gzip-compressed JSON.
    AesGcmCompressed,
    /// AES-GCM over raw JSON.
    AesGcmRaw,
}

impl EncryptionType {
    /// Whether a cipher key is required to decode this type.
    pub fn needs_key(self) -> bool {
        matches!(self, Self::AesGcmCompressed | Self::AesGcmRaw)
    }
}

impl TryFrom<u8> for EncryptionType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Base64),
            2 => Ok(Self::AesGcmCompressed),
            3 => Ok(Self::AesGcmRaw),
            other => Err(DecodeError::UnsupportedEncryption(other)),
        }
    }
}

impl From<EncryptionType> for u8 {
    fn from(value: EncryptionType) -> Self {
        match value {
            EncryptionType::None => 0,
            EncryptionType::Base64 => 1,
            EncryptionType::AesGcmCompressed => 2,
            EncryptionType::AesGcmRaw => 3,
        }
    }
}

/// Session-scoped symmetric key delivered by the server, base64 text.
///
/// Wiped from memory when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey(String);

impl CipherKey {
    /// Wrap a base64 key string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Base64 text as delivered.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw key bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DecodeError> {
        LENIENT_BASE64
            .decode(self.0.trim())
            .map_err(DecodeError::InvalidCipherKey)
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherKey(..)")
    }
}

fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Outer JSON wrapper of every inbound frame body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Key hint; carries the cipher key on `(1,1,1)` frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Raw encryption tag; see [`EncryptionType`].
    #[serde(default)]
    pub encrypt: u8,
    /// Server error code, `0` on success.
    #[serde(default)]
    pub error_code: i64,
    /// Server error message.
    #[serde(default, deserialize_with = "nullable_string")]
    pub error_message: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Build an unencrypted envelope around `data`.
    pub fn plain(data: serde_json::Value) -> Self {
        Self {
            key: None,
            encrypt: EncryptionType::None.into(),
            error_code: 0,
            error_message: String::new(),
            data,
        }
    }

    /// Parse a frame body as an envelope.
    pub fn parse(body: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(body).map_err(DecodeError::Envelope)
    }

    /// Typed view of the `encrypt` tag.
    pub fn encryption_type(&self) -> Result<EncryptionType, DecodeError> {
        EncryptionType::try_from(self.encrypt)
    }

    /// Decode `data` into `T` using `cipher_key` when the type requires it.
    pub fn decode_data<T: DeserializeOwned>(
        &self,
        cipher_key: Option<&CipherKey>,
    ) -> Result<T, DecodeError> {
        let encryption = self.encryption_type()?;
        if encryption == EncryptionType::None {
            return decode_plain(&self.data);
        }

        // Keyed envelopes fail before any other work when no key is held.
        let key = if encryption.needs_key() {
            Some(cipher_key.ok_or(DecodeError::MissingCipherKey)?.to_bytes()?)
        } else {
            None
        };

        let raw = self.data.as_str().ok_or(DecodeError::DataNotString)?;
        let bytes = match (encryption, key) {
            (EncryptionType::Base64, _) => LENIENT_BASE64.decode(raw.trim()).map_err(DecodeError::Base64)?,
            (_, Some(key)) => {
                let unescaped = urlencoding::decode(raw).map_err(DecodeError::UrlDecode)?;
                let buffer = LENIENT_BASE64
                    .decode(unescaped.trim())
                    .map_err(DecodeError::Base64)?;
                let plain = open_gcm(&key, &buffer)?;
                if encryption == EncryptionType::AesGcmCompressed {
                    gunzip(&plain).map_err(DecodeError::Decompress)?
                } else {
                    plain
                }
            }
            (_, None) => return Err(DecodeError::MissingCipherKey),
        };

        let text = String::from_utf8(bytes).map_err(DecodeError::Utf8)?;
        serde_json::from_str(&text).map_err(DecodeError::Json)
    }
}

/// Split an encrypted buffer and decrypt it.
fn open_gcm(key: &[u8], buffer: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if buffer.len() < MIN_ENCRYPTED_LEN {
        return Err(DecodeError::TooShort { len: buffer.len() });
    }
    let (iv, rest) = buffer.split_at(GCM_NONCE_SIZE);
    let (aad, ciphertext) = rest.split_at(GCM_AAD_LEN);
    aes_gcm_decrypt(key, iv, aad, ciphertext).map_err(DecodeError::Decrypt)
}

/// `data` is the body itself; a string is parsed as JSON only when `T`
/// cannot be read from it as-is.
fn decode_plain<T: DeserializeOwned>(data: &serde_json::Value) -> Result<T, DecodeError> {
    match T::deserialize(data) {
        Ok(value) => Ok(value),
        Err(err) => match data {
            serde_json::Value::String(text) => serde_json::from_str(text).map_err(DecodeError::Json),
            _ => Err(DecodeError::Json(err)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::aead::consts::U16;
    use aes_gcm::aead::{Aead, KeyInit, Payload};
    use aes_gcm::{AesGcm, Nonce};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;
    use std::io::Write;

    fn seal(key: &[u8], plaintext: &[u8], compress: bool) -> String {
        let body = if compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(plaintext).unwrap();
            encoder.finish().unwrap()
        } else {
            plaintext.to_vec()
        };
        let iv = [7u8; 16];
        let aad = [9u8; 16];
        let sealed = AesGcm::<aes::Aes256, U16>::new_from_slice(key)
            .unwrap()
            .encrypt(Nonce::<U16>::from_slice(&iv), Payload { msg: &body, aad: &aad })
            .unwrap();
        let mut buffer = iv.to_vec();
        buffer.extend_from_slice(&aad);
        buffer.extend_from_slice(&sealed);
        urlencoding::encode(&BASE64.encode(buffer)).into_owned()
    }

    #[test]
    fn test_header_encode_layout() {
        let frame = Frame::new(1, 501, 0, b"{}".to_vec());
        assert_eq!(frame.encode(), vec![1, 0xF5, 0x01, 0, b'{', b'}']);
    }

    #[test]
    fn test_decode_rejects_short_header() {
        assert!(matches!(Frame::decode(&[1, 2, 3]), Err(DecodeError::Header { len: 3 })));
    }

    #[test]
    fn test_plain_envelope_roundtrip() {
        let payloads = [
            json!({"msgs": []}),
            json!({"nested": {"a": [1, 2, 3], "b": null}}),
            json!("just a string"),
            json!(42),
            json!("42"),
            json!("true"),
            json!("null"),
            json!("{\"a\":1}"),
        ];
        for payload in payloads {
            let frame = Frame::json(1, 501, 0, &Envelope::plain(payload.clone())).unwrap();
            let decoded = Frame::decode(&frame.encode()).unwrap();
            assert_eq!(decoded, frame);

            let envelope = Envelope::parse(&decoded.body).unwrap();
            let data: serde_json::Value = envelope.decode_data(None).unwrap();
            assert_eq!(data, payload);
        }
    }

    #[test]
    fn test_plain_envelope_with_stringified_json() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Body {
            a: i64,
        }

        let envelope = Envelope::parse(br#"{"encrypt":0,"data":"{\"a\":1}"}"#).unwrap();
        let data: Body = envelope.decode_data(None).unwrap();
        assert_eq!(data, Body { a: 1 });
    }

    #[test]
    fn test_base64_envelope() {
        let data = BASE64.encode(br#"{"ok":true}"#);
        let envelope = Envelope::parse(json!({"encrypt": 1, "data": data}).to_string().as_bytes()).unwrap();
        let decoded: serde_json::Value = envelope.decode_data(None).unwrap();
        assert_eq!(decoded, json!({"ok": true}));
    }

    #[test]
    fn test_gcm_compressed_envelope() {
        let key = [0x33u8; 32];
        let cipher_key = CipherKey::new(BASE64.encode(key));
        let data = seal(&key, br#"{"data":{"msgs":[{"msgId":"1"}]}}"#, true);
        let envelope = Envelope::parse(json!({"encrypt": 2, "data": data}).to_string().as_bytes()).unwrap();

        let decoded: serde_json::Value = envelope.decode_data(Some(&cipher_key)).unwrap();
        assert_eq!(decoded["data"]["msgs"][0]["msgId"], "1");
    }

    #[test]
    fn test_gcm_raw_envelope() {
        let key = [0x44u8; 32];
        let cipher_key = CipherKey::new(BASE64.encode(key));
        let data = seal(&key, br#"{"x":1}"#, false);
        let envelope = Envelope::parse(json!({"encrypt": 3, "data": data}).to_string().as_bytes()).unwrap();
        let decoded: serde_json::Value = envelope.decode_data(Some(&cipher_key)).unwrap();
        assert_eq!(decoded, json!({"x": 1}));
    }

    #[test]
    fn test_keyed_envelope_without_key_is_hard_failure() {
        let envelope = Envelope::parse(br#"{"encrypt":2,"data":"garbage"}"#).unwrap();
        let err = envelope.decode_data::<serde_json::Value>(None).unwrap_err();
        assert!(matches!(err, DecodeError::MissingCipherKey));
    }

    #[test]
    fn test_undersized_encrypted_buffer() {
        let cipher_key = CipherKey::new(BASE64.encode([1u8; 32]));
        let data = BASE64.encode([0u8; 47]);
        let envelope = Envelope::parse(json!({"encrypt": 3, "data": data}).to_string().as_bytes()).unwrap();
        let err = envelope.decode_data::<serde_json::Value>(Some(&cipher_key)).unwrap_err();
        assert!(matches!(err, DecodeError::TooShort { len: 47 }));
    }

    #[test]
    fn test_wrong_key_fails_decrypt() {
        let data = seal(&[1u8; 32], b"{}", false);
        let wrong = CipherKey::new(BASE64.encode([2u8; 32]));
        let envelope = Envelope::parse(json!({"encrypt": 3, "data": data}).to_string().as_bytes()).unwrap();
        let err = envelope.decode_data::<serde_json::Value>(Some(&wrong)).unwrap_err();
        assert!(matches!(err, DecodeError::Decrypt(CryptoError::Authentication)));
    }

    #[test]
    fn test_compressed_tag_on_uncompressed_payload() {
        let key = [5u8; 32];
        let data = seal(&key, b"{}", false);
        let envelope = Envelope::parse(json!({"encrypt": 2, "data": data}).to_string().as_bytes()).unwrap();
        let err = envelope
            .decode_data::<serde_json::Value>(Some(&CipherKey::new(BASE64.encode(key))))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Decompress(_)));
    }

    #[test]
    fn test_non_utf8_payload() {
        let data = BASE64.encode([0xff, 0xfe, 0xfd]);
        let envelope = Envelope::parse(json!({"encrypt": 1, "data": data}).to_string().as_bytes()).unwrap();
        assert!(matches!(
            envelope.decode_data::<serde_json::Value>(None),
            Err(DecodeError::Utf8(_))
        ));
    }

    #[test]
    fn test_unsupported_encryption_type() {
        let envelope = Envelope::parse(br#"{"encrypt":9,"data":""}"#).unwrap();
        assert!(matches!(
            envelope.decode_data::<serde_json::Value>(None),
            Err(DecodeError::UnsupportedEncryption(9))
        ));
    }

    #[test]
    fn test_envelope_tolerates_null_error_message() {
        let envelope = Envelope::parse(br#"{"key":"abc","encrypt":0,"error_code":0,"error_message":null}"#).unwrap();
        assert_eq!(envelope.key.as_deref(), Some("abc"));
        assert!(envelope.error_message.is_empty());
    }

    #[test]
    fn test_frame_kind_routing() {
        assert_eq!(FrameKind::from_header(1, 1, 1), FrameKind::CipherKey);
        assert_eq!(FrameKind::from_header(1, 501, 0), FrameKind::Messages(ThreadType::User));
        assert_eq!(FrameKind::from_header(1, 521, 0), FrameKind::Messages(ThreadType::Group));
        assert_eq!(FrameKind::from_header(1, 511, 1), FrameKind::OldMessages(ThreadType::Group));
        assert_eq!(FrameKind::from_header(1, 3000, 0), FrameKind::DuplicateConnection);
        assert_eq!(FrameKind::from_header(2, 501, 0), FrameKind::Unknown);
        assert_eq!(FrameKind::from_header(1, 9999, 0), FrameKind::Unknown);
    }
}
