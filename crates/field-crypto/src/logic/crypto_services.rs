use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, Payload},
};
use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, trace};

use crate::error::FieldCryptoError;
use crate::logic::envelope::{CryptoEnvelope, IV_LEN, TAG_LEN};
use crate::logic::mask::{MaskOptions, mask_value};
use crate::logic::provider::{
    Aad, DecryptRequest, EncryptRequest, EncryptResult, FieldCryptoProvider, HashRequest,
    MaskRequest,
};

/// Key material for one kid: a 256-bit AES key and an independent HMAC key.
#[derive(Clone, zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct FieldKeyMaterial {
    kid: String,
    encryption_key: Vec<u8>,
    hash_key: Vec<u8>,
}

impl std::fmt::Debug for FieldKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldKeyMaterial")
            .field("kid", &self.kid)
            .field("encryption_key", &"****")
            .field("hash_key", &"****")
            .finish()
    }
}

impl FieldKeyMaterial {
    pub fn new(
        kid: impl Into<String>,
        encryption_key: Vec<u8>,
        hash_key: Vec<u8>,
    ) -> Result<Self, FieldCryptoError> {
        let kid = kid.into();
        if kid.trim().is_empty() {
            return Err(FieldCryptoError::config("key id must not be blank"));
        }
        if encryption_key.len() != 32 {
            return Err(FieldCryptoError::config(format!(
                "invalid encryption key length for {kid}: expected 32 bytes for AES-256, got {}",
                encryption_key.len()
            )));
        }
        if hash_key.is_empty() {
            return Err(FieldCryptoError::config(format!(
                "hash key for {kid} must not be empty"
            )));
        }
        Ok(Self {
            kid,
            encryption_key,
            hash_key,
        })
    }

    /// Builds key material from standard base64 strings.
    pub fn from_base64(
        kid: impl Into<String>,
        encryption_key_b64: &str,
        hash_key_b64: &str,
    ) -> Result<Self, FieldCryptoError> {
        let kid = kid.into();
        let decode = |name: &str, value: &str| {
            base64::engine::general_purpose::STANDARD
                .decode(value.trim())
                .map_err(|e| {
                    FieldCryptoError::config(format!("{name} for {kid} is not valid base64: {e}"))
                })
        };
        let encryption_key = decode("encryption key", encryption_key_b64)?;
        let hash_key = decode("hash key", hash_key_b64)?;
        Self::new(kid, encryption_key, hash_key)
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }
}

/// Reference provider: AES-256-GCM envelopes and HMAC-SHA256 lookup hashes.
pub struct AesGcmFieldCryptoProvider {
    keys: HashMap<String, FieldKeyMaterial>,
    default_kid: String,
    hash_kid: String,
    mask_options: MaskOptions,
    ciphers: DashMap<String, Arc<Aes256Gcm>>,
}

impl std::fmt::Debug for AesGcmFieldCryptoProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kids: Vec<&String> = self.keys.keys().collect();
        kids.sort();
        f.debug_struct("AesGcmFieldCryptoProvider")
            .field("kids", &kids)
            .field("default_kid", &self.default_kid)
            .field("hash_kid", &self.hash_kid)
            .finish()
    }
}

impl AesGcmFieldCryptoProvider {
    pub fn new(
        keys: Vec<FieldKeyMaterial>,
        default_kid: impl Into<String>,
    ) -> Result<Self, FieldCryptoError> {
        let default_kid = default_kid.into();
        let mut by_kid = HashMap::with_capacity(keys.len());
        for key in keys {
            if by_kid.contains_key(key.kid()) {
                return Err(FieldCryptoError::config(format!(
                    "duplicate key id {}",
                    key.kid()
                )));
            }
            by_kid.insert(key.kid().to_string(), key);
        }
        if !by_kid.contains_key(&default_kid) {
            return Err(FieldCryptoError::config(format!(
                "default key id {default_kid} has no key material"
            )));
        }
        Ok(Self {
            keys: by_kid,
            hash_kid: default_kid.clone(),
            default_kid,
            mask_options: MaskOptions::default(),
            ciphers: DashMap::new(),
        })
    }

    /// Pins lookup hashes to `hash_kid` so they stay stable while the
    /// encryption key rotates.
    pub fn with_hash_kid(mut self, hash_kid: impl Into<String>) -> Result<Self, FieldCryptoError> {
        let hash_kid = hash_kid.into();
        if !self.keys.contains_key(&hash_kid) {
            return Err(FieldCryptoError::config(format!(
                "hash key id {hash_kid} has no key material"
            )));
        }
        self.hash_kid = hash_kid;
        Ok(self)
    }

    pub fn with_mask_options(mut self, mask_options: MaskOptions) -> Self {
        self.mask_options = mask_options;
        self
    }

    pub fn default_kid(&self) -> &str {
        &self.default_kid
    }

    pub fn hash_kid(&self) -> &str {
        &self.hash_kid
    }

    fn cipher(&self, kid: &str) -> Option<Arc<Aes256Gcm>> {
        if let Some(cipher) = self.ciphers.get(kid) {
            return Some(cipher.clone());
        }
        let key = self.keys.get(kid)?;
        let cipher = Arc::new(Aes256Gcm::new_from_slice(&key.encryption_key).ok()?);
        trace!(kid, "initialised AES-GCM cipher");
        self.ciphers.insert(kid.to_string(), cipher.clone());
        Some(cipher)
    }
}

/// Deterministic AAD bytes: the field path followed by the sorted AAD map.
fn aad_bytes(path: &str, aad: &Aad) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&(path, aad))
}

#[async_trait]
impl FieldCryptoProvider for AesGcmFieldCryptoProvider {
    async fn encrypt(
        &self,
        request: EncryptRequest<'_>,
    ) -> Result<EncryptResult, FieldCryptoError> {
        let kid = request.kid.unwrap_or(&self.default_kid);
        let encrypt_error = |message: String, source: Option<shared::error::DynError>| {
            FieldCryptoError::Encrypt {
                message,
                path: Some(request.path.to_string()),
                kid: Some(kid.to_string()),
                source,
            }
        };

        let cipher = self
            .cipher(kid)
            .ok_or_else(|| encrypt_error(format!("no key material for kid {kid}"), None))?;
        let aad = aad_bytes(request.path, request.aad)
            .map_err(|e| encrypt_error("failed to serialize aad".to_string(), Some(e.into())))?;

        let mut nonce_bytes = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut sealed = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: request.value.as_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|e| encrypt_error(format!("encryption failed: {e}"), None))?;

        // aes-gcm appends the tag to the ciphertext
        let tag = sealed.split_off(sealed.len() - TAG_LEN);
        let envelope = CryptoEnvelope::seal(kid, &nonce_bytes, &tag, &sealed);
        let ciphertext = envelope.encode().map_err(|e| with_path(e, request.path))?;

        Ok(EncryptResult {
            ciphertext,
            kid: kid.to_string(),
        })
    }

    async fn decrypt(&self, request: DecryptRequest<'_>) -> Result<String, FieldCryptoError> {
        let envelope =
            CryptoEnvelope::decode(request.ciphertext).map_err(|e| with_path(e, request.path))?;
        let parts = envelope.parts().map_err(|e| with_path(e, request.path))?;
        let aad = aad_bytes(request.path, request.aad).map_err(|e| FieldCryptoError::Decrypt {
            message: "failed to serialize aad".to_string(),
            path: Some(request.path.to_string()),
            kid: Some(envelope.kid.clone()),
            source: Some(e.into()),
        })?;

        let candidates: Vec<&str> = if request.candidate_kids.is_empty() {
            vec![envelope.kid.as_str()]
        } else {
            request.candidate_kids.iter().map(String::as_str).collect()
        };

        let mut sealed = Vec::with_capacity(parts.ct.len() + TAG_LEN);
        sealed.extend_from_slice(&parts.ct);
        sealed.extend_from_slice(&parts.tag);
        let nonce = Nonce::from_slice(&parts.iv);

        let mut last_failure = String::from("no candidate key ids");
        for kid in candidates {
            let Some(cipher) = self.cipher(kid) else {
                last_failure = format!("no key material for kid {kid}");
                continue;
            };
            match cipher.decrypt(
                nonce,
                Payload {
                    msg: &sealed,
                    aad: &aad,
                },
            ) {
                Ok(plaintext) => {
                    return String::from_utf8(plaintext).map_err(|e| FieldCryptoError::Decrypt {
                        message: "decrypted value is not valid UTF-8".to_string(),
                        path: Some(request.path.to_string()),
                        kid: Some(kid.to_string()),
                        source: Some(e.into()),
                    });
                }
                Err(e) => {
                    debug!(kid, path = request.path, "candidate key failed to decrypt");
                    last_failure = format!("decryption with kid {kid} failed: {e}");
                }
            }
        }

        Err(FieldCryptoError::Decrypt {
            message: "all candidate keys failed to decrypt".to_string(),
            path: Some(request.path.to_string()),
            kid: Some(envelope.kid.clone()),
            source: Some(last_failure.into()),
        })
    }

    async fn hash(&self, request: HashRequest<'_>) -> Result<String, FieldCryptoError> {
        let kid = request.kid.unwrap_or(&self.hash_kid);
        let key = self.keys.get(kid).ok_or_else(|| FieldCryptoError::Hash {
            message: format!("no hash key for kid {kid}"),
            path: Some(request.path.to_string()),
            kid: Some(kid.to_string()),
        })?;

        let mut mac =
            <Hmac<Sha256> as Mac>::new_from_slice(&key.hash_key).map_err(|e| {
                FieldCryptoError::Hash {
                    message: format!("invalid hash key: {e}"),
                    path: Some(request.path.to_string()),
                    kid: Some(kid.to_string()),
                }
            })?;
        mac.update(request.value.as_bytes());
        Ok(format!("{:x}", mac.finalize().into_bytes()))
    }

    fn mask(&self, request: MaskRequest<'_>) -> Option<String> {
        Some(mask_value(request.value, &self.mask_options))
    }
}

fn with_path(error: FieldCryptoError, field_path: &str) -> FieldCryptoError {
    match error {
        FieldCryptoError::Encrypt {
            message,
            path: None,
            kid,
            source,
        } => FieldCryptoError::Encrypt {
            message,
            path: Some(field_path.to_string()),
            kid,
            source,
        },
        FieldCryptoError::Decrypt {
            message,
            path: None,
            kid,
            source,
        } => FieldCryptoError::Decrypt {
            message,
            path: Some(field_path.to_string()),
            kid,
            source,
        },
        other => other,
    }
}

#[cfg(all(test, feature = "unit_test"))]
pub(crate) mod unit_test {
    use super::*;
    use crate::error::FieldCryptoErrorKind;

    pub(crate) fn test_key(kid: &str, seed: u8) -> FieldKeyMaterial {
        FieldKeyMaterial::new(kid, vec![seed; 32], vec![seed.wrapping_add(100); 32]).unwrap()
    }

    pub(crate) fn test_provider() -> AesGcmFieldCryptoProvider {
        AesGcmFieldCryptoProvider::new(vec![test_key("k1", 1), test_key("k2", 2)], "k1").unwrap()
    }

    fn aad() -> Aad {
        Aad::from([
            ("tenant_id".to_string(), "tenant-a".to_string()),
            ("message_id".to_string(), "msg-123".to_string()),
        ])
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_round_trip() {
        shared::setup_test!();

        let provider = test_provider();
        let aad = aad();
        let encrypted = provider
            .encrypt(EncryptRequest {
                value: "01012345678",
                aad: &aad,
                path: "to",
                kid: None,
            })
            .await
            .unwrap();
        assert_eq!(encrypted.kid, "k1");
        assert!(!encrypted.ciphertext.contains("01012345678"));

        let decrypted = provider
            .decrypt(DecryptRequest {
                ciphertext: &encrypted.ciphertext,
                aad: &aad,
                path: "to",
                candidate_kids: &[],
            })
            .await
            .unwrap();
        assert_eq!(decrypted, "01012345678");

        // a fresh iv every call
        let again = provider
            .encrypt(EncryptRequest {
                value: "01012345678",
                aad: &aad,
                path: "to",
                kid: None,
            })
            .await
            .unwrap();
        assert_ne!(again.ciphertext, encrypted.ciphertext);
    }

    #[tokio::test]
    async fn test_decrypt_with_wrong_aad_fails() {
        shared::setup_test!();

        let provider = test_provider();
        let aad = aad();
        let encrypted = provider
            .encrypt(EncryptRequest {
                value: "hello",
                aad: &aad,
                path: "metadata.note",
                kid: Some("k2"),
            })
            .await
            .unwrap();

        let mut other_aad = aad.clone();
        other_aad.insert("tenant_id".to_string(), "tenant-b".to_string());
        let err = provider
            .decrypt(DecryptRequest {
                ciphertext: &encrypted.ciphertext,
                aad: &other_aad,
                path: "metadata.note",
                candidate_kids: &[],
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FieldCryptoErrorKind::Decrypt);
        assert_eq!(err.path(), Some("metadata.note"));

        // same aad, different path
        let err = provider
            .decrypt(DecryptRequest {
                ciphertext: &encrypted.ciphertext,
                aad: &aad,
                path: "metadata.other",
                candidate_kids: &[],
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FieldCryptoErrorKind::Decrypt);
    }

    #[tokio::test]
    async fn test_decrypt_tries_candidates_in_order() {
        shared::setup_test!();

        let provider = test_provider();
        let aad = aad();
        let encrypted = provider
            .encrypt(EncryptRequest {
                value: "hello",
                aad: &aad,
                path: "from",
                kid: Some("k2"),
            })
            .await
            .unwrap();

        let candidates = vec!["k1".to_string(), "unknown".to_string(), "k2".to_string()];
        let decrypted = provider
            .decrypt(DecryptRequest {
                ciphertext: &encrypted.ciphertext,
                aad: &aad,
                path: "from",
                candidate_kids: &candidates,
            })
            .await
            .unwrap();
        assert_eq!(decrypted, "hello");

        let unrelated = vec!["k1".to_string(), "k9".to_string()];
        let err = provider
            .decrypt(DecryptRequest {
                ciphertext: &encrypted.ciphertext,
                aad: &aad,
                path: "from",
                candidate_kids: &unrelated,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FieldCryptoErrorKind::Decrypt);
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("no key material for kid k9"));
    }

    #[tokio::test]
    async fn test_hash_is_keyed_and_stable() {
        shared::setup_test!();

        let provider = test_provider().with_hash_kid("k2").unwrap();
        let first = provider
            .hash(HashRequest {
                value: "01012345678",
                path: "to",
                kid: None,
            })
            .await
            .unwrap();
        let second = provider
            .hash(HashRequest {
                value: "01012345678",
                path: "from",
                kid: Some("k2"),
            })
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let other = provider
            .hash(HashRequest {
                value: "01012345678",
                path: "to",
                kid: Some("k1"),
            })
            .await
            .unwrap();
        assert_ne!(first, other);

        let err = provider
            .hash(HashRequest {
                value: "x",
                path: "to",
                kid: Some("missing"),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FieldCryptoErrorKind::Hash);
    }

    #[test]
    fn test_key_material_validation() {
        assert!(FieldKeyMaterial::new("k1", vec![0; 16], vec![1; 32]).is_err());
        assert!(FieldKeyMaterial::new(" ", vec![0; 32], vec![1; 32]).is_err());
        assert!(FieldKeyMaterial::from_base64("k1", "not base64!", "AAAA").is_err());

        let enc = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        let key = FieldKeyMaterial::from_base64("k1", &enc, &enc).unwrap();
        assert!(!format!("{key:?}").contains(&enc));

        assert!(AesGcmFieldCryptoProvider::new(vec![test_key("k1", 1)], "k2").is_err());
        assert!(
            AesGcmFieldCryptoProvider::new(vec![test_key("k1", 1), test_key("k1", 2)], "k1")
                .is_err()
        );
    }
}
