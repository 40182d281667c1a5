use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::FieldCryptoError;

/// Additional authenticated data bound into a field ciphertext.
pub type Aad = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy)]
pub struct EncryptRequest<'a> {
    pub value: &'a str,
    pub aad: &'a Aad,
    pub path: &'a str,
    /// Key to encrypt with; the provider's default key when absent.
    pub kid: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptResult {
    pub ciphertext: String,
    pub kid: String,
}

#[derive(Debug, Clone, Copy)]
pub struct DecryptRequest<'a> {
    pub ciphertext: &'a str,
    pub aad: &'a Aad,
    pub path: &'a str,
    /// Ordered keys to try. Empty means "the key named by the envelope".
    pub candidate_kids: &'a [String],
}

#[derive(Debug, Clone, Copy)]
pub struct HashRequest<'a> {
    pub value: &'a str,
    pub path: &'a str,
    pub kid: Option<&'a str>,
}

#[derive(Debug, Clone, Copy)]
pub struct MaskRequest<'a> {
    pub value: &'a str,
    pub path: &'a str,
}

#[async_trait]
pub trait FieldCryptoProvider: Send + Sync {
    async fn encrypt(&self, request: EncryptRequest<'_>) -> Result<EncryptResult, FieldCryptoError>;

    async fn decrypt(&self, request: DecryptRequest<'_>) -> Result<String, FieldCryptoError>;

    async fn hash(&self, request: HashRequest<'_>) -> Result<String, FieldCryptoError>;

    /// Display-only masking. Providers without a mask return `None`.
    fn mask(&self, _request: MaskRequest<'_>) -> Option<String> {
        None
    }
}
