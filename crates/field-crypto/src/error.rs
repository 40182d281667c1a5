use serde::Serialize;
use shared::error::{CommonError, DynError};
use thiserror::Error;

/// Coarse classification of a [`FieldCryptoError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCryptoErrorKind {
    Config,
    Encrypt,
    Decrypt,
    Hash,
    Policy,
}

impl FieldCryptoErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldCryptoErrorKind::Config => "config",
            FieldCryptoErrorKind::Encrypt => "encrypt",
            FieldCryptoErrorKind::Decrypt => "decrypt",
            FieldCryptoErrorKind::Hash => "hash",
            FieldCryptoErrorKind::Policy => "policy",
        }
    }
}

impl std::fmt::Display for FieldCryptoErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum FieldCryptoError {
    #[error("field crypto config error: {message}")]
    Config {
        message: String,
        rule: Option<String>,
        path: Option<String>,
    },
    #[error("field crypto encrypt error: {message}")]
    Encrypt {
        message: String,
        path: Option<String>,
        kid: Option<String>,
        #[source]
        source: Option<DynError>,
    },
    #[error("field crypto decrypt error: {message}")]
    Decrypt {
        message: String,
        path: Option<String>,
        kid: Option<String>,
        #[source]
        source: Option<DynError>,
    },
    #[error("field crypto hash error: {message}")]
    Hash {
        message: String,
        path: Option<String>,
        kid: Option<String>,
    },
    #[error("field crypto policy error: {message}")]
    Policy {
        message: String,
        path: Option<String>,
    },
}

impl FieldCryptoError {
    pub fn kind(&self) -> FieldCryptoErrorKind {
        match self {
            FieldCryptoError::Config { .. } => FieldCryptoErrorKind::Config,
            FieldCryptoError::Encrypt { .. } => FieldCryptoErrorKind::Encrypt,
            FieldCryptoError::Decrypt { .. } => FieldCryptoErrorKind::Decrypt,
            FieldCryptoError::Hash { .. } => FieldCryptoErrorKind::Hash,
            FieldCryptoError::Policy { .. } => FieldCryptoErrorKind::Policy,
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            FieldCryptoError::Config { path, .. }
            | FieldCryptoError::Encrypt { path, .. }
            | FieldCryptoError::Decrypt { path, .. }
            | FieldCryptoError::Hash { path, .. }
            | FieldCryptoError::Policy { path, .. } => path.as_deref(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        FieldCryptoError::Config {
            message: message.into(),
            rule: None,
            path: None,
        }
    }

    pub fn policy(message: impl Into<String>, path: Option<&str>) -> Self {
        FieldCryptoError::Policy {
            message: message.into(),
            path: path.map(str::to_string),
        }
    }
}

impl From<FieldCryptoError> for CommonError {
    fn from(e: FieldCryptoError) -> Self {
        match e.kind() {
            FieldCryptoErrorKind::Config | FieldCryptoErrorKind::Policy => {
                CommonError::InvalidRequest {
                    msg: e.to_string(),
                    source: Some(e.into()),
                }
            }
            _ => CommonError::Unknown(anyhow::Error::new(e)),
        }
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;

    #[test]
    fn test_kind_and_common_error_mapping() {
        let err = FieldCryptoError::config("fields must not be empty");
        assert_eq!(err.kind(), FieldCryptoErrorKind::Config);
        let common: CommonError = err.into();
        assert!(matches!(common, CommonError::InvalidRequest { .. }));

        let err = FieldCryptoError::Decrypt {
            message: "all candidate keys failed".to_string(),
            path: Some("to".to_string()),
            kid: Some("k1".to_string()),
            source: None,
        };
        assert_eq!(err.kind().as_str(), "decrypt");
        assert_eq!(err.path(), Some("to"));
        let common: CommonError = err.into();
        assert!(matches!(common, CommonError::Unknown(_)));
    }
}
