use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::FieldCryptoError;
use crate::logic::envelope::{CryptoEnvelope, has_envelope_shape};
use crate::logic::key_resolver::{KeyResolutionContext, decrypt_candidate_kids};
use crate::logic::mask::{MaskOptions, mask_value, normalize_phone_for_hash};
use crate::logic::policy::{
    FailMode, FieldCryptoConfig, FieldCryptoMode, LOOKUP_FIELDS, OpenFallback, ValidationOptions,
    assert_field_crypto_config, resolve_field_mode,
};
use crate::logic::provider::{
    Aad, DecryptRequest, EncryptRequest, FieldCryptoProvider, HashRequest, MaskRequest,
};

/// What to store for one field value.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct ProtectedValue {
    pub mode: FieldCryptoMode,
    /// Envelope, mask or plaintext depending on `mode`; `None` when a fail-open
    /// degradation chose to store nothing.
    pub stored: Option<String>,
    pub hash: Option<String>,
    pub kid: Option<String>,
    /// Set when encryption failed and the open fallback was used instead.
    pub degraded: bool,
}

impl std::fmt::Debug for ProtectedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectedValue")
            .field("mode", &self.mode)
            .field("stored", &self.stored.as_ref().map(|_| "****"))
            .field("hash", &self.hash)
            .field("kid", &self.kid)
            .field("degraded", &self.degraded)
            .finish()
    }
}

/// Runtime entry point for reading and writing protected fields under a
/// validated [`FieldCryptoConfig`].
#[derive(Debug, Clone)]
pub struct FieldCrypto {
    config: FieldCryptoConfig,
}

fn is_lookup_field(path: &str) -> bool {
    LOOKUP_FIELDS.contains(&path)
}

impl FieldCrypto {
    pub fn new(
        config: FieldCryptoConfig,
        options: ValidationOptions,
    ) -> Result<Self, FieldCryptoError> {
        assert_field_crypto_config(&config, options)?;
        info!(
            enabled = config.enabled,
            fields = config.fields.len(),
            fail_mode = ?config.fail_mode,
            "field crypto configured"
        );
        Ok(Self { config })
    }

    pub fn config(&self) -> &FieldCryptoConfig {
        &self.config
    }

    pub fn mode_for(&self, path: &str) -> FieldCryptoMode {
        resolve_field_mode(&self.config, path, FieldCryptoMode::Plain)
    }

    /// AAD built from the configured `aad_fields`; keys absent from `ctx` are
    /// left out.
    pub fn build_aad(&self, ctx: &KeyResolutionContext) -> Aad {
        let mut aad = Aad::new();
        if let Some(fields) = &self.config.aad_fields {
            for key in fields {
                if let Some(value) = ctx.get(key) {
                    aad.insert(key.clone(), value.to_string());
                }
            }
        }
        aad
    }

    fn provider(&self, path: &str) -> Result<&Arc<dyn FieldCryptoProvider>, FieldCryptoError> {
        self.config.provider.as_ref().ok_or_else(|| {
            FieldCryptoError::policy(
                format!("field {path} requires a crypto provider but none is configured"),
                Some(path),
            )
        })
    }

    fn mask(&self, path: &str, value: &str) -> String {
        self.config
            .provider
            .as_ref()
            .and_then(|p| p.mask(MaskRequest { value, path }))
            .unwrap_or_else(|| mask_value(value, &MaskOptions::default()))
    }

    fn hash_input(path: &str, value: &str) -> String {
        if is_lookup_field(path) {
            normalize_phone_for_hash(value)
        } else {
            value.to_string()
        }
    }

    /// Protects `value` for storage, applying the open fallback on crypto
    /// failure when `fail_mode` is open.
    pub async fn protect(
        &self,
        path: &str,
        value: &str,
        ctx: &KeyResolutionContext,
    ) -> Result<ProtectedValue, FieldCryptoError> {
        let mode = self.mode_for(path);
        match self.protect_with_mode(path, value, ctx, mode).await {
            Ok(protected) => Ok(protected),
            Err(e) if e.kind() == crate::error::FieldCryptoErrorKind::Policy => Err(e),
            Err(e) => match (self.config.fail_mode, self.config.open_fallback) {
                (FailMode::Closed, _) => Err(e),
                (FailMode::Open, fallback) => {
                    warn!(path, error = %e, ?fallback, "field crypto degraded to open fallback");
                    let stored = match fallback {
                        Some(OpenFallback::Masked) => Some(self.mask(path, value)),
                        Some(OpenFallback::Plaintext) => Some(value.to_string()),
                        None => None,
                    };
                    Ok(ProtectedValue {
                        mode,
                        stored,
                        hash: None,
                        kid: None,
                        degraded: true,
                    })
                }
            },
        }
    }

    /// Protects `value` with `mode`, surfacing every failure. Used by the
    /// backfill, which records failures instead of degrading.
    pub async fn protect_with_mode(
        &self,
        path: &str,
        value: &str,
        ctx: &KeyResolutionContext,
        mode: FieldCryptoMode,
    ) -> Result<ProtectedValue, FieldCryptoError> {
        match mode {
            FieldCryptoMode::Plain => Ok(ProtectedValue {
                mode,
                stored: Some(value.to_string()),
                hash: None,
                kid: None,
                degraded: false,
            }),
            FieldCryptoMode::Mask => Ok(ProtectedValue {
                mode,
                stored: Some(self.mask(path, value)),
                hash: None,
                kid: None,
                degraded: false,
            }),
            FieldCryptoMode::Encrypt | FieldCryptoMode::EncryptHash => {
                let provider = self.provider(path)?;
                let kid = match &self.config.key_resolver {
                    Some(resolver) => Some(resolver.resolve_encrypt_key(ctx).await?.kid),
                    None => None,
                };
                let aad = self.build_aad(ctx);
                let encrypted = provider
                    .encrypt(EncryptRequest {
                        value,
                        aad: &aad,
                        path,
                        kid: kid.as_deref(),
                    })
                    .await?;

                let hash = if mode.hashes() {
                    let input = Self::hash_input(path, value);
                    Some(
                        provider
                            .hash(HashRequest {
                                value: &input,
                                path,
                                kid: None,
                            })
                            .await?,
                    )
                } else {
                    None
                };

                Ok(ProtectedValue {
                    mode,
                    stored: Some(encrypted.ciphertext),
                    hash,
                    kid: Some(encrypted.kid),
                    degraded: false,
                })
            }
        }
    }

    /// Opens a stored value. Legacy plaintext (anything without the envelope
    /// shape) is returned unchanged. An envelope of an unsupported version or
    /// algorithm is a decrypt failure. Returns `None` when decryption failed
    /// under fail-open.
    pub async fn reveal(
        &self,
        path: &str,
        stored: &str,
        ctx: &KeyResolutionContext,
    ) -> Result<Option<String>, FieldCryptoError> {
        if !has_envelope_shape(stored) {
            return Ok(Some(stored.to_string()));
        }

        match self.open_envelope(path, stored, ctx).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == crate::error::FieldCryptoErrorKind::Policy => Err(e),
            Err(e) => match self.config.fail_mode {
                FailMode::Closed => Err(e),
                FailMode::Open => {
                    warn!(path, error = %e, "field decrypt failed, value withheld");
                    Ok(None)
                }
            },
        }
    }

    async fn open_envelope(
        &self,
        path: &str,
        stored: &str,
        ctx: &KeyResolutionContext,
    ) -> Result<String, FieldCryptoError> {
        let provider = self.provider(path)?;
        let envelope = CryptoEnvelope::decode(stored)?;
        let resolver_kids = match &self.config.key_resolver {
            Some(resolver) => {
                let ctx = ctx.clone().with_ciphertext(stored);
                resolver.resolve_decrypt_keys(&ctx).await?
            }
            None => Vec::new(),
        };
        let candidates = decrypt_candidate_kids(&envelope.kid, &resolver_kids);
        let aad = self.build_aad(ctx);
        provider
            .decrypt(DecryptRequest {
                ciphertext: stored,
                aad: &aad,
                path,
                candidate_kids: &candidates,
            })
            .await
    }

    /// Hashes to match against the stored hash column. Lookup fields are
    /// normalised first; the raw trimmed value is included when it differs so
    /// rows hashed before normalisation still match.
    pub async fn lookup_hashes(
        &self,
        path: &str,
        value: &str,
    ) -> Result<Vec<String>, FieldCryptoError> {
        let provider = self.provider(path)?;
        let mut inputs = vec![Self::hash_input(path, value)];
        let raw = value.trim();
        if !inputs.iter().any(|i| i == raw) {
            inputs.push(raw.to_string());
        }

        let mut hashes = Vec::with_capacity(inputs.len());
        for input in &inputs {
            hashes.push(
                provider
                    .hash(HashRequest {
                        value: input,
                        path,
                        kid: None,
                    })
                    .await?,
            );
        }
        Ok(hashes)
    }
}
