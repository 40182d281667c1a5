// Stored ciphertext format for protected fields.
// A field value is a compact JSON object `{v, alg, kid, iv, tag, ct}` whose
// binary members are unpadded base64url.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::FieldCryptoError;

pub const ENVELOPE_VERSION: u32 = 1;
pub const ENVELOPE_ALG: &str = "A256GCM";

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CryptoEnvelope {
    pub v: u32,
    pub alg: String,
    pub kid: String,
    pub iv: String,
    pub tag: String,
    pub ct: String,
}

impl std::fmt::Debug for CryptoEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEnvelope")
            .field("v", &self.v)
            .field("alg", &self.alg)
            .field("kid", &self.kid)
            .field("ct", &"****")
            .finish()
    }
}

/// Raw parts of an envelope after base64 decoding.
pub struct EnvelopeParts {
    pub iv: Vec<u8>,
    pub tag: Vec<u8>,
    pub ct: Vec<u8>,
}

impl CryptoEnvelope {
    pub fn seal(kid: &str, iv: &[u8], tag: &[u8], ct: &[u8]) -> Self {
        Self {
            v: ENVELOPE_VERSION,
            alg: ENVELOPE_ALG.to_string(),
            kid: kid.to_string(),
            iv: URL_SAFE_NO_PAD.encode(iv),
            tag: URL_SAFE_NO_PAD.encode(tag),
            ct: URL_SAFE_NO_PAD.encode(ct),
        }
    }

    pub fn encode(&self) -> Result<String, FieldCryptoError> {
        serde_json::to_string(self).map_err(|e| FieldCryptoError::Encrypt {
            message: format!("failed to serialize envelope: {e}"),
            path: None,
            kid: Some(self.kid.clone()),
            source: Some(e.into()),
        })
    }

    pub fn decode(stored: &str) -> Result<Self, FieldCryptoError> {
        let envelope: CryptoEnvelope =
            serde_json::from_str(stored).map_err(|e| FieldCryptoError::Decrypt {
                message: "stored value is not a crypto envelope".to_string(),
                path: None,
                kid: None,
                source: Some(e.into()),
            })?;

        if envelope.v != ENVELOPE_VERSION || envelope.alg != ENVELOPE_ALG {
            return Err(FieldCryptoError::Decrypt {
                message: format!(
                    "unsupported envelope v={} alg={}",
                    envelope.v, envelope.alg
                ),
                path: None,
                kid: Some(envelope.kid),
                source: None,
            });
        }
        if envelope.kid.trim().is_empty() {
            return Err(FieldCryptoError::Decrypt {
                message: "envelope kid is empty".to_string(),
                path: None,
                kid: None,
                source: None,
            });
        }
        Ok(envelope)
    }

    pub fn parts(&self) -> Result<EnvelopeParts, FieldCryptoError> {
        let decode = |name: &str, value: &str| {
            URL_SAFE_NO_PAD
                .decode(value)
                .map_err(|e| FieldCryptoError::Decrypt {
                    message: format!("envelope {name} is not base64url"),
                    path: None,
                    kid: Some(self.kid.clone()),
                    source: Some(e.into()),
                })
        };
        let parts = EnvelopeParts {
            iv: decode("iv", &self.iv)?,
            tag: decode("tag", &self.tag)?,
            ct: decode("ct", &self.ct)?,
        };
        if parts.iv.len() != IV_LEN || parts.tag.len() != TAG_LEN {
            return Err(FieldCryptoError::Decrypt {
                message: format!(
                    "envelope iv/tag length mismatch: iv={} tag={}",
                    parts.iv.len(),
                    parts.tag.len()
                ),
                path: None,
                kid: Some(self.kid.clone()),
                source: None,
            });
        }
        Ok(parts)
    }
}

/// Whether `stored` is an envelope this version can open.
pub fn is_envelope(stored: &str) -> bool {
    let trimmed = stored.trim_start();
    trimmed.starts_with('{') && CryptoEnvelope::decode(trimmed).is_ok()
}

/// Whether `stored` has the members of an envelope, whatever its `v` or `alg`.
/// Such a value is ciphertext from some writer and never legacy plaintext.
pub fn has_envelope_shape(stored: &str) -> bool {
    let trimmed = stored.trim_start();
    if !trimmed.starts_with('{') {
        return false;
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Object(members)) => ["v", "alg", "kid", "ct"]
            .iter()
            .all(|key| members.contains_key(*key)),
        _ => false,
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let envelope = CryptoEnvelope::seal("k1", &[1u8; IV_LEN], &[2u8; TAG_LEN], b"cipher");
        let encoded = envelope.encode().unwrap();
        assert!(encoded.contains("\"alg\":\"A256GCM\""));
        assert!(!encoded.contains('='));

        let decoded = CryptoEnvelope::decode(&encoded).unwrap();
        assert_eq!(decoded, envelope);
        let parts = decoded.parts().unwrap();
        assert_eq!(parts.ct, b"cipher");
        assert!(is_envelope(&encoded));
    }

    #[test]
    fn test_foreign_version_keeps_envelope_shape() {
        let mut envelope = CryptoEnvelope::seal("k1", &[1u8; IV_LEN], &[2u8; TAG_LEN], b"cipher");
        envelope.v = 2;
        envelope.alg = "XC20P".to_string();
        let encoded = envelope.encode().unwrap();
        assert!(!is_envelope(&encoded));
        assert!(has_envelope_shape(&encoded));

        let err = CryptoEnvelope::decode(&encoded).unwrap_err();
        assert!(err.to_string().contains("unsupported envelope v=2 alg=XC20P"));

        assert!(!has_envelope_shape("{\"hello\":\"world\"}"));
        assert!(!has_envelope_shape("01012345678"));
        assert!(!has_envelope_shape("{not json"));
    }

    #[test]
    fn test_plaintext_is_not_an_envelope() {
        assert!(!is_envelope("01012345678"));
        assert!(!is_envelope("{\"hello\":\"world\"}"));
        let err = CryptoEnvelope::decode("01012345678").unwrap_err();
        assert_eq!(err.kind(), crate::error::FieldCryptoErrorKind::Decrypt);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut envelope = CryptoEnvelope::seal("k1", &[0u8; IV_LEN], &[0u8; TAG_LEN], b"x");
        envelope.v = 2;
        let encoded = serde_json::to_string(&envelope).unwrap();
        assert!(CryptoEnvelope::decode(&encoded).is_err());
    }

    #[test]
    fn test_debug_hides_ciphertext() {
        let envelope = CryptoEnvelope::seal("k1", &[0u8; IV_LEN], &[0u8; TAG_LEN], b"secret");
        let rendered = format!("{envelope:?}");
        assert!(rendered.contains("k1"));
        assert!(!rendered.contains(&envelope.ct));
    }
}
