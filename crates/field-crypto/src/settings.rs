use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shared::{env::required_env_var, error::CommonError};
use tracing::info;

use crate::error::FieldCryptoError;
use crate::logic::crypto_services::{AesGcmFieldCryptoProvider, FieldKeyMaterial};
use crate::logic::field_crypto::FieldCrypto;
use crate::logic::key_resolver::{
    DEFAULT_REFRESH_TTL, KeyResolver, KeySetProvider, RefreshableKeyResolver, StaticKeyResolver,
    merge_kids,
};
use crate::logic::mask::MaskOptions;
use crate::logic::policy::{
    FailMode, FieldCryptoConfig, OpenFallback, ValidationOptions,
};
use crate::logic::provider::FieldCryptoProvider;
use crate::logic::rollout::{ActiveKidRolloutPolicy, RollingKeyResolver, get_rollout_known_kids};
use crate::sql::{LibsqlSqlClient, connect_libsql_client};

fn default_true() -> bool {
    true
}

fn default_refresh_ttl_secs() -> u64 {
    DEFAULT_REFRESH_TTL.as_secs()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PolicySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub fail_mode: FailMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_fallback: Option<OpenFallback>,
    #[serde(default)]
    pub unsafe_allow_plaintext_storage: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aad_fields: Option<Vec<String>>,
    #[serde(default)]
    pub secure_mode: bool,
    #[serde(default)]
    pub compat_plain_columns: bool,
}

/// Names the environment variables holding one key's material. The material
/// itself never lives in the settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct KeyEntrySettings {
    pub kid: String,
    /// Base64 of the 32-byte AES-256 key.
    pub encryption_key_env: String,
    /// Base64 of the HMAC key.
    pub hash_key_env: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct KeySettings {
    pub active_kid: String,
    #[serde(default)]
    pub decrypt_kids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_kid: Option<String>,
    pub entries: Vec<KeyEntrySettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FieldCryptoSettings {
    pub policy: PolicySettings,
    pub keys: KeySettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<ActiveKidRolloutPolicy>,
    #[serde(default = "default_refresh_ttl_secs")]
    pub refresh_ttl_secs: u64,
    #[serde(default)]
    pub mask: MaskOptions,
    /// `libsql://<path>?mode=local` for the migration engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

impl FieldCryptoSettings {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, CommonError> {
        let path = path.as_ref();
        let yaml_str = std::fs::read_to_string(path).map_err(|e| {
            CommonError::Unknown(anyhow::anyhow!(
                "Failed to read field crypto settings {}: {e:?}",
                path.display()
            ))
        })?;
        Self::from_yaml_str(&yaml_str)
    }

    pub fn from_yaml_str(yaml_str: &str) -> Result<Self, CommonError> {
        Ok(serde_yaml::from_str(yaml_str)?)
    }

    pub fn to_yaml(&self) -> Result<String, CommonError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validation_options(&self) -> ValidationOptions {
        ValidationOptions {
            secure_mode: self.policy.secure_mode,
            compat_plain_columns: self.policy.compat_plain_columns,
        }
    }

    /// Reads every key entry's material from the environment.
    pub fn build_provider(&self) -> Result<AesGcmFieldCryptoProvider, CommonError> {
        let mut keys = Vec::with_capacity(self.keys.entries.len());
        for entry in &self.keys.entries {
            let encryption_key = required_env_var(&entry.encryption_key_env)?;
            let hash_key = required_env_var(&entry.hash_key_env)?;
            keys.push(FieldKeyMaterial::from_base64(
                &entry.kid,
                &encryption_key,
                &hash_key,
            )?);
        }

        let mut provider = AesGcmFieldCryptoProvider::new(keys, &self.keys.active_kid)?
            .with_mask_options(self.mask.clone());
        if let Some(hash_kid) = &self.keys.hash_kid {
            provider = provider.with_hash_kid(hash_kid)?;
        }
        Ok(provider)
    }

    /// Static resolver over the configured kids, or a refreshable one when an
    /// external key-set provider is supplied. Wrapped in a rolling resolver when
    /// a rollout policy is configured.
    pub fn build_key_resolver(
        &self,
        key_set_provider: Option<Arc<dyn KeySetProvider>>,
    ) -> Result<Arc<dyn KeyResolver>, CommonError> {
        let configured = self
            .keys
            .entries
            .iter()
            .map(|e| e.kid.as_str())
            .collect::<Vec<_>>();
        let referenced = merge_kids(
            std::iter::once(self.keys.active_kid.as_str())
                .chain(self.keys.decrypt_kids.iter().map(String::as_str)),
        )
        .into_iter()
        .chain(self.rollout.iter().flat_map(get_rollout_known_kids));
        for kid in referenced {
            if !configured.contains(&kid.as_str()) {
                return Err(FieldCryptoError::config(format!(
                    "key id {kid} is referenced but has no key entry"
                ))
                .into());
            }
        }

        let base: Arc<dyn KeyResolver> = match key_set_provider {
            Some(provider) => Arc::new(
                RefreshableKeyResolver::new(provider)
                    .with_ttl(Duration::from_secs(self.refresh_ttl_secs))
                    .with_fallback_decrypt_kids(self.keys.decrypt_kids.clone()),
            ),
            None => Arc::new(StaticKeyResolver::new(
                &self.keys.active_kid,
                &self.keys.decrypt_kids,
            )?),
        };

        Ok(match &self.rollout {
            Some(policy) => Arc::new(RollingKeyResolver::new(base, policy.clone())),
            None => base,
        })
    }

    pub fn build_config(
        &self,
        provider: Arc<dyn FieldCryptoProvider>,
        key_resolver: Option<Arc<dyn KeyResolver>>,
    ) -> FieldCryptoConfig {
        FieldCryptoConfig {
            enabled: self.policy.enabled,
            fields: self.policy.fields.clone(),
            fail_mode: self.policy.fail_mode,
            open_fallback: self.policy.open_fallback,
            unsafe_allow_plaintext_storage: self.policy.unsafe_allow_plaintext_storage,
            aad_fields: self.policy.aad_fields.clone(),
            key_resolver,
            provider: Some(provider),
        }
    }

    /// Provider, resolver and validated runtime in one step.
    pub fn build_field_crypto(
        &self,
        key_set_provider: Option<Arc<dyn KeySetProvider>>,
    ) -> Result<FieldCrypto, CommonError> {
        let provider = Arc::new(self.build_provider()?);
        let resolver = self.build_key_resolver(key_set_provider)?;
        let config = self.build_config(provider, Some(resolver));
        Ok(FieldCrypto::new(config, self.validation_options())?)
    }

    pub async fn open_sql_client(
        &self,
    ) -> Result<(libsql::Database, LibsqlSqlClient), CommonError> {
        let database_url = self
            .database_url
            .as_deref()
            .ok_or_else(|| CommonError::InvalidRequest {
                msg: "database_url is not configured".to_string(),
                source: None,
            })?;
        info!("opening field crypto migration database");
        connect_libsql_client(database_url).await
    }
}
