//! Key material helpers.
//!
//! Raw API keys are generated here, fingerprinted with SHA-256, and never
//! stored. Upstream channel keys are wrapped with AES-256-GCM when
//! `DATA_ENCRYPTION_KEY` is configured; without it they are stored as
//! plaintext and a warning is logged once at startup.

use aes_gcm::aead::{Aead, KeyInit, OsRng as AeadOsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config;

/// Prefix carried by every raw API key this gateway issues.
const KEY_PREFIX: &str = "mg-";
/// Marker distinguishing wrapped channel keys from plaintext ones.
const SEALED_MARKER: &str = "enc:v1:";

/// Hex-encoded SHA-256 of the raw key; this is the only stored identity.
pub fn sha256_hex(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Generate a raw API key plus its stored fingerprint `(raw, prefix, hash)`.
///
/// The raw key is returned exactly once, at creation.
pub fn generate_api_key() -> (String, String, String) {
    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    let mut suffix = String::with_capacity(48);
    for byte in bytes {
        suffix.push_str(&format!("{:02x}", byte));
    }
    let raw = format!("{}{}", KEY_PREFIX, suffix);
    let prefix = raw.chars().take(8).collect::<String>();
    let hash = sha256_hex(&raw);
    (raw, prefix, hash)
}

/// Wrap a channel API key for storage. Without an encryption key the value
/// passes through unchanged.
pub fn seal_secret(plaintext: &str) -> String {
    let Some(key_bytes) = config::env_config().data_encryption_key.as_ref() else {
        return plaintext.to_string();
    };
    let key = Key::<Aes256Gcm>::from_slice(key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
    match cipher.encrypt(&nonce, plaintext.as_bytes()) {
        Ok(ciphertext) => {
            let mut payload = nonce.to_vec();
            payload.extend_from_slice(&ciphertext);
            format!("{}{}", SEALED_MARKER, BASE64.encode(payload))
        }
        Err(_) => {
            crate::logger::error("crypto", "AES-GCM encryption failed; storing plaintext");
            plaintext.to_string()
        }
    }
}

/// Unwrap a stored channel API key. Plaintext values (legacy rows or no
/// encryption key configured) pass through unchanged.
pub fn open_secret(stored: &str) -> String {
    let Some(encoded) = stored.strip_prefix(SEALED_MARKER) else {
        return stored.to_string();
    };
    let Some(key_bytes) = config::env_config().data_encryption_key.as_ref() else {
        crate::logger::warn(
            "crypto",
            "Encrypted channel key present but DATA_ENCRYPTION_KEY is unset",
        );
        return String::new();
    };
    let Ok(payload) = BASE64.decode(encoded) else {
        return String::new();
    };
    if payload.len() < 12 {
        return String::new();
    }
    let (nonce_bytes, ciphertext) = payload.split_at(12);
    let key = Key::<Aes256Gcm>::from_slice(key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(nonce_bytes);
    match cipher.decrypt(nonce, ciphertext) {
        Ok(plaintext) => String::from_utf8(plaintext).unwrap_or_default(),
        Err(_) => {
            crate::logger::error("crypto", "AES-GCM decryption failed for stored channel key");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_matches_raw_key() {
        let (raw, prefix, hash) = generate_api_key();
        assert_eq!(prefix, raw.chars().take(8).collect::<String>());
        assert_eq!(hash, sha256_hex(&raw));
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn generated_keys_are_unique() {
        let (a, _, ha) = generate_api_key();
        let (b, _, hb) = generate_api_key();
        assert_ne!(a, b);
        assert_ne!(ha, hb);
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn plaintext_secret_passes_through() {
        // No DATA_ENCRYPTION_KEY in the test environment.
        assert_eq!(open_secret("sk-plain"), "sk-plain");
    }
}
