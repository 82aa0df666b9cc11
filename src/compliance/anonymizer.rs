//! Anonymisation of detected PII.
//!
//! Mask, hash and generalise are one-way. Pseudonymisation encrypts the
//! value with AES-256-GCM under the deployment key and embeds the nonce and
//! ciphertext in a `TOKEN_` string, so only this service can reverse it.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use rand::{rngs::OsRng, RngCore};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hashing::compute_hash;
use crate::log_warn;
use crate::logging::structured::LogContext;

use super::pii::{detect, substitute, PiiMatch, PiiType, RiskLevel};

pub const TOKEN_PREFIX: &str = "TOKEN_";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

lazy_static! {
    static ref TOKEN_PATTERN: Regex = Regex::new(r"TOKEN_[A-Za-z0-9_-]+").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnonymizationMethod {
    Mask,
    Hash,
    Generalize,
    Pseudonymize,
}

impl AnonymizationMethod {
    pub fn is_reversible(&self) -> bool {
        matches!(self, AnonymizationMethod::Pseudonymize)
    }
}

/// Redaction applied at ingest to agents without `encrypt_at_rest`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedactionPolicy {
    #[default]
    Mask,
    Hash,
    None,
}

impl RedactionPolicy {
    pub fn method(&self) -> Option<AnonymizationMethod> {
        match self {
            RedactionPolicy::Mask => Some(AnonymizationMethod::Mask),
            RedactionPolicy::Hash => Some(AnonymizationMethod::Hash),
            RedactionPolicy::None => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnonymizedText {
    pub text: String,
    pub method: AnonymizationMethod,
    pub matches: Vec<PiiMatch>,
    pub risk_level: RiskLevel,
}

#[derive(Clone)]
pub struct Anonymizer {
    cipher: Aes256Gcm,
    salt: String,
}

impl fmt::Debug for Anonymizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Anonymizer").finish_non_exhaustive()
    }
}

impl Anonymizer {
    /// Build from a 32-byte key and the service-wide hashing salt.
    pub fn new(key: &[u8], salt: &str) -> Result<Self> {
        if key.len() != 32 {
            return Err(Error::Config(format!(
                "anonymizer key must be 32 bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::Config(format!("invalid anonymizer key: {}", e)))?;
        Ok(Self {
            cipher,
            salt: salt.to_string(),
        })
    }

    /// Build from a hex-encoded key.
    pub fn from_hex_key(key_hex: &str, salt: &str) -> Result<Self> {
        let key = hex::decode(key_hex.trim())
            .map_err(|e| Error::Config(format!("anonymizer key is not hex: {}", e)))?;
        Self::new(&key, salt)
    }

    /// Fresh random key; tokens do not survive a restart.
    pub fn ephemeral(salt: &str) -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        log_warn!(
            LogContext::for_task("anonymizer"),
            "ANONYMIZER_EPHEMERAL_KEY",
            tokens_valid_until = "restart"
        );
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
            salt: salt.to_string(),
        }
    }

    pub fn salt(&self) -> &str {
        &self.salt
    }

    /// Detect PII in `text` and replace every match.
    pub fn anonymize(&self, text: &str, method: AnonymizationMethod) -> Result<AnonymizedText> {
        let detection = detect(text);
        let mut failure: Option<Error> = None;
        let replaced = substitute(text, &detection.matches, |m| {
            match self.render(m, method) {
                Ok(rendered) => rendered,
                Err(err) => {
                    failure.get_or_insert(err);
                    String::new()
                }
            }
        });
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(AnonymizedText {
            text: replaced,
            method,
            matches: detection.matches,
            risk_level: detection.risk_level,
        })
    }

    fn render(&self, m: &PiiMatch, method: AnonymizationMethod) -> Result<String> {
        Ok(match method {
            AnonymizationMethod::Mask => m.masked.clone(),
            AnonymizationMethod::Hash => self.hash_value(&m.value),
            AnonymizationMethod::Generalize => generalize_value(m.pii_type, &m.value),
            AnonymizationMethod::Pseudonymize => self.pseudonymize_value(&m.value)?,
        })
    }

    /// `REDACTED_` plus the first 16 hex chars of SHA-256(value + salt).
    pub fn hash_value(&self, value: &str) -> String {
        let digest = compute_hash(&format!("{}{}", value, self.salt));
        format!("REDACTED_{}", &digest[..16])
    }

    pub fn pseudonymize_value(&self, value: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), value.as_bytes())
            .map_err(|_| Error::Crypto("pseudonymisation failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(format!(
            "{}{}",
            TOKEN_PREFIX,
            general_purpose::URL_SAFE_NO_PAD.encode(blob)
        ))
    }

    /// Decrypt a single `TOKEN_...` string.
    pub fn decrypt_token(&self, token: &str) -> Result<String> {
        let body = token
            .strip_prefix(TOKEN_PREFIX)
            .ok_or_else(|| Error::InvalidArgument("not a pseudonym token".to_string()))?;
        let blob = general_purpose::URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|e| Error::InvalidArgument(format!("token decode: {}", e)))?;
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::InvalidArgument("token too short".to_string()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Integrity("pseudonym token failed authentication".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|e| Error::Integrity(format!("token plaintext not utf-8: {}", e)))
    }

    /// Replace every pseudonym token in `text` with its original value.
    ///
    /// A token that runs into adjacent token-alphabet characters is retried
    /// with shorter bodies until one authenticates.
    pub fn depseudonymize(&self, text: &str) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for found in TOKEN_PATTERN.find_iter(text) {
            if found.start() < cursor {
                continue;
            }
            let candidate = found.as_str();
            let (plain, used) = self.decrypt_prefix(candidate)?;
            out.push_str(&text[cursor..found.start()]);
            out.push_str(&plain);
            cursor = found.start() + used;
        }
        out.push_str(&text[cursor..]);
        Ok(out)
    }

    fn decrypt_prefix(&self, candidate: &str) -> Result<(String, usize)> {
        let min_len = TOKEN_PREFIX.len() + ((NONCE_LEN + TAG_LEN) * 4).div_ceil(3);
        let mut last_err = Error::InvalidArgument("no pseudonym token".to_string());
        let mut len = candidate.len();
        while len >= min_len {
            match self.decrypt_token(&candidate[..len]) {
                Ok(plain) => return Ok((plain, len)),
                Err(err) => last_err = err,
            }
            len -= 1;
        }
        Err(last_err)
    }
}

/// Category-preserving generic for a value.
pub fn generalize_value(pii_type: PiiType, value: &str) -> String {
    match pii_type {
        PiiType::IpAddress => "*.*.0.0/16".to_string(),
        PiiType::Email => match value.split_once('@') {
            Some((_, domain)) => format!("*@{}", domain),
            None => "*@*".to_string(),
        },
        other => format!("[{}]", other.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn anonymizer() -> Anonymizer {
        Anonymizer::new(&[7u8; 32], "pepper").unwrap()
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(matches!(
            Anonymizer::new(&[0u8; 16], "s"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_hash_is_deterministic_with_salt() {
        let a = anonymizer();
        let first = a
            .anonymize("Contact john.doe@example.com", AnonymizationMethod::Hash)
            .unwrap();
        let second = a
            .anonymize("Contact john.doe@example.com", AnonymizationMethod::Hash)
            .unwrap();
        assert_eq!(first.text, second.text);
        assert!(first.text.starts_with("Contact REDACTED_"));
        assert_eq!(first.text.len(), "Contact REDACTED_".len() + 16);

        let other_salt = Anonymizer::new(&[7u8; 32], "salt2").unwrap();
        assert_ne!(
            other_salt.hash_value("john.doe@example.com"),
            a.hash_value("john.doe@example.com")
        );
    }

    #[test]
    fn test_generalize() {
        let out = anonymizer()
            .anonymize(
                "from 10.2.3.4 by ops@corp.example ssn 123-45-6789",
                AnonymizationMethod::Generalize,
            )
            .unwrap();
        assert_eq!(out.text, "from *.*.0.0/16 by *@corp.example ssn [ssn]");
    }

    #[test]
    fn test_pseudonymize_round_trip() {
        let a = anonymizer();
        let text = "alice@example.com paid with 4111 1111 1111 1111 from 172.16.0.9";
        let out = a.anonymize(text, AnonymizationMethod::Pseudonymize).unwrap();
        assert_eq!(out.matches.len(), 3);
        assert!(!out.text.contains("alice@example.com"));
        assert_eq!(out.text.matches(TOKEN_PREFIX).count(), 3);
        assert_eq!(a.depseudonymize(&out.text).unwrap(), text);
    }

    #[test]
    fn test_token_adjacent_to_word_chars() {
        let a = anonymizer();
        let token = a.pseudonymize_value("10.0.0.1").unwrap();
        let text = format!("{}-tail", token);
        assert_eq!(a.depseudonymize(&text).unwrap(), "10.0.0.1-tail");
    }

    #[test]
    fn test_foreign_key_cannot_reverse() {
        let token = anonymizer().pseudonymize_value("bob@example.com").unwrap();
        let other = Anonymizer::new(&[9u8; 32], "pepper").unwrap();
        assert!(other.decrypt_token(&token).is_err());
    }

    #[test]
    fn test_one_way_methods_are_not_reversible() {
        assert!(!AnonymizationMethod::Mask.is_reversible());
        assert!(!AnonymizationMethod::Hash.is_reversible());
        assert!(!AnonymizationMethod::Generalize.is_reversible());
        let a = anonymizer();
        let out = a
            .anonymize("mail carol@example.net", AnonymizationMethod::Mask)
            .unwrap();
        // Nothing to reverse: masked text carries no tokens.
        assert_eq!(a.depseudonymize(&out.text).unwrap(), out.text);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]
        #[test]
        fn prop_pseudonymize_round_trip(
            prefix in "[a-z ]{0,12}",
            local in "[a-z]{1,8}",
            domain in "[a-z]{2,8}",
            suffix in "[a-z ]{0,12}",
        ) {
            let a = anonymizer();
            let text = format!("{} {}@{}.org {}", prefix, local, domain, suffix);
            let out = a.anonymize(&text, AnonymizationMethod::Pseudonymize).unwrap();
            prop_assert_eq!(a.depseudonymize(&out.text).unwrap(), text);
        }
    }
}
