//! Time-keyed encryption envelope shared with the knowledge-base service.
//!
//! Every request and response body exchanged with the remote service carries
//! its payload as `{"data": "<base64 ciphertext>"}`. The key for one exchange
//! is derived from the shared secret and the `date` header of the request:
//!
//! ```text
//! at ──format──▶ "Sun, 15 Aug 2021 10:00:00 GMT" ──parse──▶ 1629021600000
//!                                                               │
//!                     secret ‖ "1629021600000" ──MD5──▶ 16-byte SM4 key
//! ```
//!
//! The timestamp goes through the formatted HTTP-date before it becomes key
//! material, so sub-second precision is dropped on both sides. Both peers
//! must format-then-parse identically or their keys diverge.
//!
//! The block cipher is SM4 in ECB mode with PKCS#7 padding. The mode is fixed
//! by the remote protocol; it provides no integrity protection, so everything
//! mode-specific stays inside this module.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use md5::{Digest, Md5};
use sm4::cipher::generic_array::GenericArray;
use sm4::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use sm4::Sm4;
use thiserror::Error;

/// SM4 block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// `strftime` pattern for the `date` header (RFC 7231 IMF-fixdate).
pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Raw SM4 key bytes.
pub type Key = [u8; 16];

/// Any failure inside the envelope. Callers never see partial output.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("cipher operation failed: invalid http date '{0}'")]
    Date(String),
    #[error("cipher operation failed: invalid base64 payload: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("cipher operation failed: ciphertext length {0} is not a positive multiple of 16")]
    Length(usize),
    #[error("cipher operation failed: pad length {0} out of range")]
    Padding(u8),
    #[error("cipher operation failed: invalid key length")]
    KeyLength,
    #[error("cipher operation failed: plaintext is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub type Result<T> = std::result::Result<T, CipherError>;

/// Formats `at` as the GMT HTTP-date sent in the `date` header.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format(HTTP_DATE_FORMAT).to_string()
}

/// Parses an HTTP-date back to epoch milliseconds.
pub fn http_date_millis(date: &str) -> Result<i64> {
    NaiveDateTime::parse_from_str(date, HTTP_DATE_FORMAT)
        .map(|naive| naive.and_utc().timestamp_millis())
        .map_err(|_| CipherError::Date(date.to_string()))
}

/// Derives the exchange key for a request sent at `at`.
pub fn derive_key(secret: &str, at: DateTime<Utc>) -> Result<Key> {
    derive_key_from_http_date(secret, &http_date(at))
}

/// Derives the exchange key from the `date` header value itself.
///
/// This is what the receiving side does; [`derive_key`] goes through the same
/// path so that both ends agree on the truncated timestamp.
pub fn derive_key_from_http_date(secret: &str, date: &str) -> Result<Key> {
    let millis = http_date_millis(date)?;
    let digest = Md5::digest(format!("{}{}", secret, millis).as_bytes());
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest);
    Ok(key)
}

/// Pads and encrypts `plaintext` block by block.
pub fn encrypt(key: &Key, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Sm4::new_from_slice(key).map_err(|_| CipherError::KeyLength)?;
    let mut buf = pad(plaintext);
    for block in buf.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(buf)
}

/// Decrypts `ciphertext` block by block and strips the padding.
pub fn decrypt(key: &Key, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CipherError::Length(ciphertext.len()));
    }
    let cipher = Sm4::new_from_slice(key).map_err(|_| CipherError::KeyLength)?;
    let mut buf = ciphertext.to_vec();
    for block in buf.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    unpad(buf)
}

/// Encrypts a UTF-8 payload and base64-encodes it for the `data` field.
pub fn seal_with_key(key: &Key, plaintext: &str) -> Result<String> {
    Ok(STANDARD.encode(encrypt(key, plaintext.as_bytes())?))
}

/// Reverses [`seal_with_key`].
pub fn open_with_key(key: &Key, data: &str) -> Result<String> {
    let raw = STANDARD.decode(data.trim())?;
    Ok(String::from_utf8(decrypt(key, &raw)?)?)
}

/// Encrypts `plaintext` under the key for (`secret`, `at`).
pub fn seal(secret: &str, at: DateTime<Utc>, plaintext: &str) -> Result<String> {
    seal_with_key(&derive_key(secret, at)?, plaintext)
}

/// Decrypts a `data` field under the key for (`secret`, `at`).
pub fn open(secret: &str, at: DateTime<Utc>, data: &str) -> Result<String> {
    open_with_key(&derive_key(secret, at)?, data)
}

fn pad(input: &[u8]) -> Vec<u8> {
    let pad_len = BLOCK_SIZE - input.len() % BLOCK_SIZE;
    let mut out = Vec::with_capacity(input.len() + pad_len);
    out.extend_from_slice(input);
    out.resize(input.len() + pad_len, pad_len as u8);
    out
}

// Only the last byte is consulted; the remaining pad bytes are not checked.
fn unpad(mut buf: Vec<u8>) -> Result<Vec<u8>> {
    let pad_len = *buf.last().ok_or(CipherError::Length(0))?;
    if pad_len == 0 || pad_len as usize > buf.len() {
        return Err(CipherError::Padding(pad_len));
    }
    buf.truncate(buf.len() - pad_len as usize);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 8, 15, 10, 0, 0).unwrap()
    }

    fn sample_key() -> Key {
        let mut key = [0u8; 16];
        hex::decode_to_slice("0af849552688174143656e52e940dc2d", &mut key).unwrap();
        key
    }

    #[test]
    fn test_http_date_format() {
        assert_eq!(http_date(sample_time()), "Sun, 15 Aug 2021 10:00:00 GMT");
    }

    #[test]
    fn test_http_date_millis_reparses() {
        let millis = http_date_millis("Sun, 15 Aug 2021 10:00:00 GMT").unwrap();
        assert_eq!(millis, 1_629_021_600_000);
    }

    #[test]
    fn test_invalid_http_date_rejected() {
        let err = derive_key_from_http_date("sk", "yesterday-ish").unwrap_err();
        assert!(matches!(err, CipherError::Date(_)));
        assert!(err.to_string().starts_with("cipher operation failed"));
    }

    #[test]
    fn test_known_key() {
        assert_eq!(derive_key("sk-test", sample_time()).unwrap(), sample_key());
    }

    #[test]
    fn test_key_determinism() {
        let a = derive_key_from_http_date("sk-test", "Sun, 15 Aug 2021 10:00:00 GMT").unwrap();
        let b = derive_key_from_http_date("sk-test", "Sun, 15 Aug 2021 10:00:00 GMT").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sub_second_truncation() {
        let base = sample_time();
        let later = base + chrono::Duration::milliseconds(999);
        assert_eq!(
            derive_key("sk-test", base).unwrap(),
            derive_key("sk-test", later).unwrap()
        );
        let next_second = base + chrono::Duration::seconds(1);
        assert_ne!(
            derive_key("sk-test", base).unwrap(),
            derive_key("sk-test", next_second).unwrap()
        );
    }

    #[test]
    fn test_different_secret_different_key() {
        assert_ne!(
            derive_key("sk-a", sample_time()).unwrap(),
            derive_key("sk-b", sample_time()).unwrap()
        );
    }

    #[test]
    fn test_sm4_standard_vector_first_block() {
        // GB/T 32907 example: key = plaintext = 0123456789abcdeffedcba9876543210
        let mut key = [0u8; 16];
        hex::decode_to_slice("0123456789abcdeffedcba9876543210", &mut key).unwrap();
        let out = encrypt(&key, &key).unwrap();
        assert_eq!(out.len(), 32);
        assert_eq!(hex::encode(&out[..16]), "681edf34d206965e86b3e94f536e4246");
    }

    #[test]
    fn test_known_envelopes() {
        let key = sample_key();
        assert_eq!(
            seal_with_key(&key, r#"{"token":"abc"}"#).unwrap(),
            "3ZqtWbHK354y5UeZhMuOeQ=="
        );
        assert_eq!(
            open_with_key(&key, "M4tD3OLzj1snYvBAV3eACw==").unwrap(),
            r#"{"id":"kb-42"}"#
        );
    }

    #[test]
    fn test_block_aligned_input_gains_full_block() {
        let key = sample_key();
        let plaintext = b"0123456789abcdef";
        let ciphertext = encrypt(&key, plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + BLOCK_SIZE);
        assert_eq!(
            STANDARD.encode(&ciphertext),
            "19KuC9uSk7kTnZLN64mVH2P3E2w8daKA0g1ZGnc2Rsk="
        );
        assert_eq!(decrypt(&key, &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn test_pad_lengths() {
        assert_eq!(pad(b"").len(), 16);
        assert_eq!(pad(b"abc").len(), 16);
        assert_eq!(*pad(b"abc").last().unwrap(), 13);
        assert_eq!(pad(&[7u8; 32]).len(), 48);
    }

    #[test]
    fn test_round_trip_various_lengths() {
        let at = Utc::now();
        for len in [0usize, 1, 15, 16, 17, 31, 32, 100] {
            let plaintext: String = "知识库x".chars().cycle().take(len).collect();
            let sealed = seal("secret", at, &plaintext).unwrap();
            assert_eq!(open("secret", at, &sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_wrong_key_does_not_round_trip() {
        let at = sample_time();
        let sealed = seal("secret-a", at, r#"{"token":"abc"}"#).unwrap();
        match open("secret-b", at, &sealed) {
            Ok(text) => assert_ne!(text, r#"{"token":"abc"}"#),
            Err(_) => {}
        }
    }

    #[test]
    fn test_bad_ciphertext_length() {
        let key = sample_key();
        assert!(matches!(decrypt(&key, &[1u8; 15]), Err(CipherError::Length(15))));
        assert!(matches!(decrypt(&key, &[]), Err(CipherError::Length(0))));
    }

    #[test]
    fn test_bad_base64() {
        assert!(matches!(
            open_with_key(&sample_key(), "not base64!!"),
            Err(CipherError::Decode(_))
        ));
    }

    #[test]
    fn test_unpad_out_of_range() {
        let mut block = vec![0u8; 16];
        assert!(matches!(unpad(block.clone()), Err(CipherError::Padding(0))));
        block[15] = 17;
        assert!(matches!(unpad(block), Err(CipherError::Padding(17))));
    }
}
