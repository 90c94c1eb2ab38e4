//! Secret handling.
//!
//! Source credentials are encrypted at rest with AES-256-GCM. Each
//! attribute is encrypted under its own freshly generated 96-bit IV,
//! so two configurations with the same plaintext never share a
//! ciphertext.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::anyhow;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use derivative::Derivative;
use lazy_static::lazy_static;
use rand::RngCore;
use regex::Regex;
use reqwest::Url;

use crate::error::{ErrorKind, ServerError, ServerResult};

/// Length of an encryption key in bytes.
pub const KEY_LENGTH: usize = 32;

/// Length of an IV in bytes.
pub const IV_LENGTH: usize = 12;

/// Maximum length of a credential attribute.
pub const MAX_ATTRIBUTE_LENGTH: usize = 255;

/// Replacement for scrubbed values.
pub const FILTERED: &str = "[FILTERED]";

lazy_static! {
    static ref SENSITIVE_PARAM_REGEX: Regex =
        Regex::new(r"(?i)token|password|passwd|secret|key|signature|credential|auth").unwrap();
}

/// A key for encrypting secrets at rest.
#[derive(Clone)]
pub struct EncryptionKey(Aes256Gcm);

/// An encrypted attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedValue {
    /// Base64-encoded ciphertext, including the authentication tag.
    pub ciphertext: String,

    /// Base64-encoded IV.
    pub iv: String,
}

/// Credentials of a source system, before encryption.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct NewConfiguration {
    /// Base URL of the source system.
    pub url: String,

    /// Access token for the source API.
    #[derivative(Debug = "ignore")]
    pub access_token: String,
}

impl EncryptionKey {
    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> ServerResult<Self> {
        if bytes.len() != KEY_LENGTH {
            return Err(ErrorKind::CryptoError(anyhow!(
                "Encryption key must be {} bytes, got {}",
                KEY_LENGTH,
                bytes.len()
            ))
            .into());
        }

        let key = Key::<Aes256Gcm>::from_slice(bytes);
        Ok(Self(Aes256Gcm::new(key)))
    }

    /// Creates a key from its Base64 encoding.
    pub fn from_base64(s: &str) -> ServerResult<Self> {
        let bytes = BASE64_STANDARD
            .decode(s.trim())
            .map_err(ServerError::crypto_error)?;

        Self::from_bytes(&bytes)
    }

    /// Encrypts a value under a fresh random IV.
    pub fn encrypt(&self, plaintext: &str) -> ServerResult<EncryptedValue> {
        let mut iv = [0u8; IV_LENGTH];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = self
            .0
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| ErrorKind::CryptoError(anyhow!("Failed to encrypt value")))?;

        Ok(EncryptedValue {
            ciphertext: BASE64_STANDARD.encode(ciphertext),
            iv: BASE64_STANDARD.encode(iv),
        })
    }

    /// Decrypts a value.
    pub fn decrypt(&self, ciphertext: &str, iv: &str) -> ServerResult<String> {
        let ciphertext = BASE64_STANDARD
            .decode(ciphertext)
            .map_err(ServerError::crypto_error)?;
        let iv = BASE64_STANDARD.decode(iv).map_err(ServerError::crypto_error)?;

        if iv.len() != IV_LENGTH {
            return Err(ErrorKind::CryptoError(anyhow!("Invalid IV length {}", iv.len())).into());
        }

        let plaintext = self
            .0
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| ErrorKind::CryptoError(anyhow!("Failed to decrypt value")))?;

        String::from_utf8(plaintext).map_err(ServerError::crypto_error)
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

impl NewConfiguration {
    pub fn new(url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            access_token: access_token.into(),
        }
    }

    /// Validates the credentials.
    pub fn validate(&self) -> ServerResult<()> {
        validate_attribute("url", &self.url)?;
        validate_attribute("access_token", &self.access_token)?;

        let url = Url::parse(&self.url)
            .map_err(|_| ServerError::validation_error("url is not a valid URL"))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ServerError::validation_error(
                "url must use the http or https scheme",
            ));
        }

        if url.host_str().is_none() {
            return Err(ServerError::validation_error("url must have a host"));
        }

        Ok(())
    }
}

fn validate_attribute(name: &str, value: &str) -> ServerResult<()> {
    if value.trim().is_empty() {
        return Err(ServerError::validation_error(format!("{} can't be blank", name)));
    }

    if value.chars().count() > MAX_ATTRIBUTE_LENGTH {
        return Err(ServerError::validation_error(format!(
            "{} is too long (maximum is {} characters)",
            name, MAX_ATTRIBUTE_LENGTH
        )));
    }

    Ok(())
}

/// Returns a version of a URL that is safe to log.
///
/// Userinfo and fragments are removed, sensitive query parameters are
/// replaced with `[FILTERED]`, and any remaining occurrence of the
/// access token is masked.
pub fn scrub_url(url: &str, access_token: &str) -> String {
    let scrubbed = match Url::parse(url) {
        Ok(mut parsed) => {
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            parsed.set_fragment(None);

            let pairs: Vec<(String, String)> = parsed
                .query_pairs()
                .map(|(k, v)| {
                    if SENSITIVE_PARAM_REGEX.is_match(&k) {
                        (k.into_owned(), FILTERED.to_string())
                    } else {
                        (k.into_owned(), v.into_owned())
                    }
                })
                .collect();

            if pairs.is_empty() {
                parsed.set_query(None);
            } else {
                parsed.query_pairs_mut().clear().extend_pairs(pairs);
            }

            parsed.to_string()
        }
        Err(_) => return FILTERED.to_string(),
    };

    if access_token.is_empty() {
        scrubbed
    } else {
        scrubbed.replace(access_token, FILTERED)
    }
}
