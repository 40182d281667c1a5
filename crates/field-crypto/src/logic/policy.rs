use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::FieldCryptoError;
use crate::logic::key_resolver::KeyResolver;
use crate::logic::provider::FieldCryptoProvider;

/// Fields used for equality lookups; never allowed as plain in secure mode.
pub const LOOKUP_FIELDS: [&str; 2] = ["to", "from"];

const METADATA_PREFIX: &str = "metadata.";
const METADATA_WILDCARD: &str = "metadata.*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldCryptoMode {
    #[serde(rename = "plain")]
    Plain,
    #[serde(rename = "encrypt")]
    Encrypt,
    #[serde(rename = "encrypt+hash")]
    EncryptHash,
    #[serde(rename = "mask")]
    Mask,
}

impl FieldCryptoMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldCryptoMode::Plain => "plain",
            FieldCryptoMode::Encrypt => "encrypt",
            FieldCryptoMode::EncryptHash => "encrypt+hash",
            FieldCryptoMode::Mask => "mask",
        }
    }

    pub fn encrypts(&self) -> bool {
        matches!(self, FieldCryptoMode::Encrypt | FieldCryptoMode::EncryptHash)
    }

    pub fn hashes(&self) -> bool {
        matches!(self, FieldCryptoMode::EncryptHash)
    }
}

impl FromStr for FieldCryptoMode {
    type Err = FieldCryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(FieldCryptoMode::Plain),
            "encrypt" => Ok(FieldCryptoMode::Encrypt),
            "encrypt+hash" => Ok(FieldCryptoMode::EncryptHash),
            "mask" => Ok(FieldCryptoMode::Mask),
            _ => Err(FieldCryptoError::config(format!(
                "invalid field crypto mode: {s}"
            ))),
        }
    }
}

impl std::fmt::Display for FieldCryptoMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    #[default]
    Closed,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenFallback {
    Masked,
    Plaintext,
}

/// Field protection policy plus the provider and resolver that enforce it.
/// Field modes are kept as the raw configured strings so validation can
/// report unknown values.
#[derive(Clone, Default)]
pub struct FieldCryptoConfig {
    pub enabled: bool,
    pub fields: BTreeMap<String, String>,
    pub fail_mode: FailMode,
    pub open_fallback: Option<OpenFallback>,
    pub unsafe_allow_plaintext_storage: bool,
    pub aad_fields: Option<Vec<String>>,
    pub key_resolver: Option<Arc<dyn KeyResolver>>,
    pub provider: Option<Arc<dyn FieldCryptoProvider>>,
}

impl std::fmt::Debug for FieldCryptoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCryptoConfig")
            .field("enabled", &self.enabled)
            .field("fields", &self.fields)
            .field("fail_mode", &self.fail_mode)
            .field("open_fallback", &self.open_fallback)
            .field(
                "unsafe_allow_plaintext_storage",
                &self.unsafe_allow_plaintext_storage,
            )
            .field("aad_fields", &self.aad_fields)
            .field("key_resolver", &self.key_resolver.is_some())
            .field("provider", &self.provider.is_some())
            .finish()
    }
}

impl FieldCryptoConfig {
    pub fn new(provider: Arc<dyn FieldCryptoProvider>) -> Self {
        Self {
            enabled: true,
            provider: Some(provider),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, path: impl Into<String>, mode: impl Into<String>) -> Self {
        self.fields.insert(path.into(), mode.into());
        self
    }

    pub fn with_key_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.key_resolver = Some(resolver);
        self
    }

    pub fn with_aad_fields(mut self, fields: Vec<String>) -> Self {
        self.aad_fields = Some(fields);
        self
    }

    pub fn with_fail_open(mut self, fallback: OpenFallback) -> Self {
        self.fail_mode = FailMode::Open;
        self.open_fallback = Some(fallback);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOptions {
    pub secure_mode: bool,
    pub compat_plain_columns: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldCryptoPolicyIssue {
    pub rule: &'static str,
    pub message: String,
    pub path: Option<String>,
    pub hint: Option<String>,
}

pub mod rules {
    pub const PROVIDER_REQUIRED: &str = "fieldCrypto.provider.required";
    pub const FIELDS_NON_EMPTY: &str = "fieldCrypto.fields.non_empty";
    pub const FIELDS_MODE_INVALID: &str = "fieldCrypto.fields.mode_invalid";
    pub const FAIL_MODE_UNSAFE_PLAINTEXT: &str = "fieldCrypto.fail_mode.unsafe_plaintext";
    pub const AAD_FIELDS_NON_EMPTY: &str = "fieldCrypto.aad_fields.non_empty";
    pub const AAD_FIELDS_BLANK_KEY: &str = "fieldCrypto.aad_fields.blank_key";
    pub const SECURE_MODE_PLAIN_LOOKUP: &str = "fieldCrypto.secure_mode.plain_lookup_field";
}

/// Collects every policy problem in `config` without failing.
pub fn validate_field_crypto_config(
    config: &FieldCryptoConfig,
    options: ValidationOptions,
) -> Vec<FieldCryptoPolicyIssue> {
    let mut issues = Vec::new();

    if config.provider.is_none() {
        issues.push(FieldCryptoPolicyIssue {
            rule: rules::PROVIDER_REQUIRED,
            message: "no field crypto provider is configured".to_string(),
            path: Some("provider".to_string()),
            hint: Some("configure a provider with encrypt, decrypt and hash".to_string()),
        });
    }

    if config.fields.is_empty() {
        issues.push(FieldCryptoPolicyIssue {
            rule: rules::FIELDS_NON_EMPTY,
            message: "fields must name at least one protected field".to_string(),
            path: Some("fields".to_string()),
            hint: Some("e.g. fields: { to: encrypt+hash }".to_string()),
        });
    }

    for (path, mode) in &config.fields {
        if FieldCryptoMode::from_str(mode).is_err() {
            issues.push(FieldCryptoPolicyIssue {
                rule: rules::FIELDS_MODE_INVALID,
                message: format!("field {path} has invalid mode {mode:?}"),
                path: Some(format!("fields.{path}")),
                hint: Some("use one of plain, encrypt, encrypt+hash, mask".to_string()),
            });
        }
    }

    if config.fail_mode == FailMode::Open
        && config.open_fallback == Some(OpenFallback::Plaintext)
        && !config.unsafe_allow_plaintext_storage
    {
        issues.push(FieldCryptoPolicyIssue {
            rule: rules::FAIL_MODE_UNSAFE_PLAINTEXT,
            message: "fail_mode=open with open_fallback=plaintext requires unsafe_allow_plaintext_storage=true".to_string(),
            path: Some("open_fallback".to_string()),
            hint: Some("prefer open_fallback=masked or fail_mode=closed".to_string()),
        });
    }

    if let Some(aad_fields) = &config.aad_fields {
        if aad_fields.is_empty() {
            issues.push(FieldCryptoPolicyIssue {
                rule: rules::AAD_FIELDS_NON_EMPTY,
                message: "aad_fields must not be empty when present".to_string(),
                path: Some("aad_fields".to_string()),
                hint: Some("omit aad_fields or list context keys such as tenant_id".to_string()),
            });
        }
        for (i, key) in aad_fields.iter().enumerate() {
            if key.trim().is_empty() {
                issues.push(FieldCryptoPolicyIssue {
                    rule: rules::AAD_FIELDS_BLANK_KEY,
                    message: format!("aad_fields[{i}] is blank"),
                    path: Some(format!("aad_fields[{i}]")),
                    hint: None,
                });
            }
        }
    }

    if options.secure_mode && !options.compat_plain_columns {
        for lookup in LOOKUP_FIELDS {
            let is_plain = config
                .fields
                .get(lookup)
                .and_then(|mode| FieldCryptoMode::from_str(mode).ok())
                == Some(FieldCryptoMode::Plain);
            if is_plain {
                issues.push(FieldCryptoPolicyIssue {
                    rule: rules::SECURE_MODE_PLAIN_LOOKUP,
                    message: format!(
                        "lookup field {lookup} cannot be plain in secure mode"
                    ),
                    path: Some(format!("fields.{lookup}")),
                    hint: Some(format!(
                        "set {lookup} to encrypt+hash or enable compat_plain_columns"
                    )),
                });
            }
        }
    }

    issues
}

/// Fails with the first policy issue, if any.
pub fn assert_field_crypto_config(
    config: &FieldCryptoConfig,
    options: ValidationOptions,
) -> Result<(), FieldCryptoError> {
    match validate_field_crypto_config(config, options).into_iter().next() {
        None => Ok(()),
        Some(issue) => Err(FieldCryptoError::Config {
            message: issue.message,
            rule: Some(issue.rule.to_string()),
            path: issue.path,
        }),
    }
}

/// Mode for `path`: an exact entry, then the `metadata.*` wildcard for nested
/// metadata, then `fallback`. A disabled config is always plain.
pub fn resolve_field_mode(
    config: &FieldCryptoConfig,
    path: &str,
    fallback: FieldCryptoMode,
) -> FieldCryptoMode {
    if !config.enabled {
        return FieldCryptoMode::Plain;
    }
    if let Some(mode) = config
        .fields
        .get(path)
        .and_then(|m| FieldCryptoMode::from_str(m).ok())
    {
        return mode;
    }
    if path.starts_with(METADATA_PREFIX) && path != METADATA_WILDCARD {
        if let Some(mode) = config
            .fields
            .get(METADATA_WILDCARD)
            .and_then(|m| FieldCryptoMode::from_str(m).ok())
        {
            return mode;
        }
    }
    fallback
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use crate::error::FieldCryptoErrorKind;
    use crate::logic::crypto_services::unit_test::test_provider;

    fn base_config() -> FieldCryptoConfig {
        FieldCryptoConfig::new(Arc::new(test_provider()))
            .with_field("to", "encrypt+hash")
            .with_field("from", "encrypt+hash")
    }

    #[test]
    fn test_valid_config_has_no_issues() {
        let config = base_config().with_aad_fields(vec!["tenant_id".to_string()]);
        let options = ValidationOptions {
            secure_mode: true,
            compat_plain_columns: false,
        };
        assert!(validate_field_crypto_config(&config, options).is_empty());
        assert!(assert_field_crypto_config(&config, options).is_ok());
    }

    #[test]
    fn test_empty_fields_rejected() {
        let config = FieldCryptoConfig::new(Arc::new(test_provider()));
        let issues = validate_field_crypto_config(&config, ValidationOptions::default());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].rule, "fieldCrypto.fields.non_empty");
    }

    #[test]
    fn test_missing_provider_and_invalid_mode() {
        let config = FieldCryptoConfig {
            enabled: true,
            ..Default::default()
        }
        .with_field("to", "rot13");
        let found: Vec<_> = validate_field_crypto_config(&config, ValidationOptions::default())
            .into_iter()
            .map(|i| i.rule)
            .collect();
        assert_eq!(
            found,
            vec![rules::PROVIDER_REQUIRED, rules::FIELDS_MODE_INVALID]
        );
    }

    #[test]
    fn test_disabled_config_still_requires_provider() {
        let config = FieldCryptoConfig {
            enabled: false,
            ..Default::default()
        }
        .with_field("to", "encrypt");
        let issues = validate_field_crypto_config(&config, ValidationOptions::default());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].rule, rules::PROVIDER_REQUIRED);
        assert_eq!(issues[0].path.as_deref(), Some("provider"));

        let mut disabled = base_config();
        disabled.enabled = false;
        assert!(validate_field_crypto_config(&disabled, ValidationOptions::default()).is_empty());
    }

    #[test]
    fn test_open_plaintext_requires_unsafe_flag() {
        let config = base_config().with_fail_open(OpenFallback::Plaintext);
        let err = assert_field_crypto_config(&config, ValidationOptions::default()).unwrap_err();
        assert_eq!(err.kind(), FieldCryptoErrorKind::Config);
        assert!(err.to_string().contains("unsafe_allow_plaintext_storage=true"));

        let mut config = config;
        config.unsafe_allow_plaintext_storage = true;
        assert!(assert_field_crypto_config(&config, ValidationOptions::default()).is_ok());

        let masked = base_config().with_fail_open(OpenFallback::Masked);
        assert!(assert_field_crypto_config(&masked, ValidationOptions::default()).is_ok());
    }

    #[test]
    fn test_aad_field_rules() {
        let config = base_config().with_aad_fields(vec![]);
        let issues = validate_field_crypto_config(&config, ValidationOptions::default());
        assert_eq!(issues[0].rule, rules::AAD_FIELDS_NON_EMPTY);

        let config = base_config().with_aad_fields(vec!["tenant_id".to_string(), "  ".to_string()]);
        let issues = validate_field_crypto_config(&config, ValidationOptions::default());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].rule, rules::AAD_FIELDS_BLANK_KEY);
        assert_eq!(issues[0].path.as_deref(), Some("aad_fields[1]"));
    }

    #[test]
    fn test_secure_mode_rejects_plain_lookup_field() {
        let config = base_config().with_field("to", "plain");
        let secure = ValidationOptions {
            secure_mode: true,
            compat_plain_columns: false,
        };
        let err = assert_field_crypto_config(&config, secure).unwrap_err();
        assert!(err.to_string().contains("to"));
        assert_eq!(err.path(), Some("fields.to"));

        let compat = ValidationOptions {
            secure_mode: true,
            compat_plain_columns: true,
        };
        assert!(assert_field_crypto_config(&config, compat).is_ok());
        assert!(assert_field_crypto_config(&config, ValidationOptions::default()).is_ok());
    }

    #[test]
    fn test_resolve_field_mode_with_metadata_wildcard() {
        let config = base_config()
            .with_field("metadata.*", "encrypt")
            .with_field("metadata.order_id", "plain");
        assert_eq!(
            resolve_field_mode(&config, "to", FieldCryptoMode::Plain),
            FieldCryptoMode::EncryptHash
        );
        assert_eq!(
            resolve_field_mode(&config, "metadata.note", FieldCryptoMode::Plain),
            FieldCryptoMode::Encrypt
        );
        assert_eq!(
            resolve_field_mode(&config, "metadata.order_id", FieldCryptoMode::Encrypt),
            FieldCryptoMode::Plain
        );
        assert_eq!(
            resolve_field_mode(&config, "subject", FieldCryptoMode::Mask),
            FieldCryptoMode::Mask
        );

        let mut disabled = config.clone();
        disabled.enabled = false;
        assert_eq!(
            resolve_field_mode(&disabled, "to", FieldCryptoMode::Encrypt),
            FieldCryptoMode::Plain
        );
    }
}
