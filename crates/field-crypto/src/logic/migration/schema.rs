use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use shared::error::CommonError;

use crate::logic::field_crypto::FieldCrypto;
use crate::logic::policy::FieldCryptoMode;
use crate::sql::{ColumnTypeStrategy, SqlDialect};

pub const PLAN_ID_PREFIX: &str = "fcmig_";
const PLAN_ID_HASH_LEN: usize = 20;

fn default_id_column() -> String {
    "message_id".to_string()
}

fn default_requested_at_column() -> String {
    "requested_at".to_string()
}

/// Where one protected field lives in the target table: the legacy plaintext
/// column it is read from and the columns the backfill writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldCryptoMigrationField {
    pub path: String,
    pub plain_column: String,
    #[serde(default)]
    pub cipher_column: Option<String>,
    #[serde(default)]
    pub hash_column: Option<String>,
    #[serde(default)]
    pub mask_column: Option<String>,
}

impl FieldCryptoMigrationField {
    pub fn new(path: impl Into<String>, plain_column: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            plain_column: plain_column.into(),
            cipher_column: None,
            hash_column: None,
            mask_column: None,
        }
    }

    pub fn with_cipher_column(mut self, column: impl Into<String>) -> Self {
        self.cipher_column = Some(column.into());
        self
    }

    pub fn with_hash_column(mut self, column: impl Into<String>) -> Self {
        self.hash_column = Some(column.into());
        self
    }

    pub fn with_mask_column(mut self, column: impl Into<String>) -> Self {
        self.mask_column = Some(column.into());
        self
    }

    /// Columns the backfill writes for `mode`.
    pub(crate) fn target_columns(&self, mode: FieldCryptoMode) -> Vec<&str> {
        let columns = match mode {
            FieldCryptoMode::Plain => vec![],
            FieldCryptoMode::Encrypt => vec![&self.cipher_column],
            FieldCryptoMode::EncryptHash => vec![&self.cipher_column, &self.hash_column],
            FieldCryptoMode::Mask => vec![&self.mask_column],
        };
        columns.into_iter().flatten().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldCryptoMigrationSchema {
    pub table_name: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_requested_at_column")]
    pub requested_at_column: String,
    pub fields: Vec<FieldCryptoMigrationField>,
    /// Resolution/AAD context key -> column holding its value.
    #[serde(default)]
    pub context_columns: BTreeMap<String, String>,
    #[serde(default)]
    pub type_strategy: ColumnTypeStrategy,
    /// Null the plaintext column once its ciphertext column is populated.
    #[serde(default)]
    pub clear_plain_columns: bool,
}

impl FieldCryptoMigrationSchema {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            id_column: default_id_column(),
            requested_at_column: default_requested_at_column(),
            fields: Vec::new(),
            context_columns: BTreeMap::new(),
            type_strategy: ColumnTypeStrategy::default(),
            clear_plain_columns: false,
        }
    }

    pub fn with_field(mut self, field: FieldCryptoMigrationField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_context_column(
        mut self,
        key: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        self.context_columns.insert(key.into(), column.into());
        self
    }

    pub fn with_type_strategy(mut self, type_strategy: ColumnTypeStrategy) -> Self {
        self.type_strategy = type_strategy;
        self
    }

    pub fn with_clear_plain_columns(mut self, clear: bool) -> Self {
        self.clear_plain_columns = clear;
        self
    }

    /// Every column the backfill reads, in a stable order and without repeats.
    pub(crate) fn select_columns(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        let mut columns = Vec::new();
        let all = [self.id_column.as_str(), self.requested_at_column.as_str()]
            .into_iter()
            .chain(self.fields.iter().flat_map(|f| {
                std::iter::once(f.plain_column.as_str())
                    .chain(f.cipher_column.as_deref())
                    .chain(f.hash_column.as_deref())
                    .chain(f.mask_column.as_deref())
            }))
            .chain(self.context_columns.values().map(String::as_str));
        for column in all {
            if seen.insert(column) {
                columns.push(column);
            }
        }
        columns
    }
}

fn invalid(msg: impl Into<String>) -> CommonError {
    CommonError::InvalidRequest {
        msg: msg.into(),
        source: None,
    }
}

fn check_column(dialect: SqlDialect, column: &str, what: &str) -> Result<(), CommonError> {
    if column.contains('.') {
        return Err(invalid(format!(
            "{what} must be a bare column name, got {column}"
        )));
    }
    dialect.quote_identifier(column).map(|_| ())
}

/// Checks identifiers and that each field has the columns its resolved mode
/// writes to.
pub fn validate_migration_schema(
    schema: &FieldCryptoMigrationSchema,
    crypto: &FieldCrypto,
    dialect: SqlDialect,
) -> Result<(), CommonError> {
    dialect.quote_identifier(&schema.table_name)?;
    check_column(dialect, &schema.id_column, "id_column")?;
    check_column(dialect, &schema.requested_at_column, "requested_at_column")?;
    for (key, column) in &schema.context_columns {
        if key.trim().is_empty() {
            return Err(invalid("context_columns keys must not be blank"));
        }
        check_column(dialect, column, "context column")?;
    }

    if schema.fields.is_empty() {
        return Err(invalid("migration schema needs at least one field"));
    }

    let mut paths = BTreeSet::new();
    for field in &schema.fields {
        if !paths.insert(field.path.as_str()) {
            return Err(invalid(format!("field {} is listed twice", field.path)));
        }
        check_column(dialect, &field.plain_column, "plain_column")?;
        for column in [&field.cipher_column, &field.hash_column, &field.mask_column]
            .into_iter()
            .flatten()
        {
            check_column(dialect, column, "target column")?;
        }

        let mode = crypto.mode_for(&field.path);
        let missing = match mode {
            FieldCryptoMode::Plain => {
                return Err(invalid(format!(
                    "field {} resolves to plain; nothing to migrate",
                    field.path
                )));
            }
            FieldCryptoMode::Encrypt => field.cipher_column.is_none().then_some("cipher_column"),
            FieldCryptoMode::EncryptHash => {
                if field.cipher_column.is_none() {
                    Some("cipher_column")
                } else if field.hash_column.is_none() {
                    Some("hash_column")
                } else {
                    None
                }
            }
            FieldCryptoMode::Mask => field.mask_column.is_none().then_some("mask_column"),
        };
        if let Some(column) = missing {
            return Err(invalid(format!(
                "field {} uses mode {mode} and needs {column}",
                field.path
            )));
        }
    }
    Ok(())
}

/// SHA-256 over the column layout, type strategy and the crypto settings that
/// decide what gets written. Any change yields a different plan.
pub fn schema_fingerprint(schema: &FieldCryptoMigrationSchema, crypto: &FieldCrypto) -> String {
    let fields = schema
        .fields
        .iter()
        .map(|f| {
            json!({
                "path": f.path,
                "mode": crypto.mode_for(&f.path).as_str(),
                "plain_column": f.plain_column,
                "cipher_column": f.cipher_column,
                "hash_column": f.hash_column,
                "mask_column": f.mask_column,
            })
        })
        .collect::<Vec<_>>();
    let canonical = json!({
        "table_name": schema.table_name,
        "id_column": schema.id_column,
        "requested_at_column": schema.requested_at_column,
        "fields": fields,
        "context_columns": schema.context_columns,
        "type_strategy": schema.type_strategy.as_str(),
        "clear_plain_columns": schema.clear_plain_columns,
        "aad_fields": crypto.config().aad_fields,
    });
    format!("{:x}", Sha256::digest(canonical.to_string().as_bytes()))
}

pub fn migration_plan_id(table_name: &str, chunk_size: i64, fingerprint: &str) -> String {
    let digest = format!(
        "{:x}",
        Sha256::digest(format!("{table_name}|{chunk_size}|{fingerprint}").as_bytes())
    );
    format!("{PLAN_ID_PREFIX}{}", &digest[..PLAN_ID_HASH_LEN])
}
