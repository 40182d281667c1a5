// Generic SQL client contract used by the migration engine.
// Backends only need to run a statement with positional parameters; dialect
// differences are limited to identifier quoting, placeholders and upsert syntax.

mod libsql_client;

pub use libsql_client::{LibsqlSqlClient, connect_libsql_client};

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::error::CommonError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::Real(f) => Some(*f as i64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            SqlValue::Null => None,
        }
    }

    /// Renders the value the way it would appear in an AAD map or context lookup.
    pub fn to_context_string(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Integer(i) => Some(i.to_string()),
            SqlValue::Real(f) => Some(f.to_string()),
            SqlValue::Text(s) => Some(s.clone()),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        SqlValue::Integer(i64::from(value))
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => SqlValue::Null,
        }
    }
}

/// A result row keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlRow(pub BTreeMap<String, SqlValue>);

impl SqlRow {
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.0.get(column)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(SqlValue::as_str)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(SqlValue::as_i64)
    }

    pub fn require(&self, column: &str) -> Result<&SqlValue, CommonError> {
        self.get(column).ok_or_else(|| CommonError::Repository {
            msg: format!("missing column {column} in result row"),
            source: None,
        })
    }

    pub fn require_str(&self, column: &str) -> Result<String, CommonError> {
        self.get_str(column)
            .map(str::to_string)
            .ok_or_else(|| CommonError::Repository {
                msg: format!("column {column} is not a text value"),
                source: None,
            })
    }

    pub fn require_i64(&self, column: &str) -> Result<i64, CommonError> {
        self.get_i64(column).ok_or_else(|| CommonError::Repository {
            msg: format!("column {column} is not an integer value"),
            source: None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlQueryResult {
    pub rows: Vec<SqlRow>,
    /// Rows changed by a write statement, when the backend reports it.
    pub row_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SqlStatement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

#[async_trait]
pub trait SqlClient: Send + Sync {
    fn dialect(&self) -> SqlDialect;

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<SqlQueryResult, CommonError>;

    /// Runs the statements atomically when the backend supports it. The default
    /// runs them one after another and stops at the first failure.
    async fn transaction(
        &self,
        statements: Vec<SqlStatement>,
    ) -> Result<Vec<SqlQueryResult>, CommonError> {
        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            results.push(self.query(&statement.sql, &statement.params).await?);
        }
        Ok(results)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlDialect {
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
    Sqlite,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnTypeStrategy {
    /// Every non-numeric column is plain text.
    #[default]
    Text,
    /// Use the backend's native timestamp and JSON types.
    Native,
}

impl ColumnTypeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnTypeStrategy::Text => "text",
            ColumnTypeStrategy::Native => "native",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Text used in a primary key.
    Key,
    Text,
    Integer,
    Timestamp,
    Json,
}

fn is_valid_identifier_part(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl SqlDialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlDialect::Postgres => "postgres",
            SqlDialect::MySql => "mysql",
            SqlDialect::Sqlite => "sqlite",
        }
    }

    /// Quotes a (possibly schema-qualified) identifier. Only ASCII letters, digits
    /// and underscores are accepted in each dotted part.
    pub fn quote_identifier(&self, identifier: &str) -> Result<String, CommonError> {
        let mut quoted = Vec::new();
        for part in identifier.split('.') {
            if !is_valid_identifier_part(part) {
                return Err(CommonError::InvalidRequest {
                    msg: format!("invalid SQL identifier: {identifier:?}"),
                    source: None,
                });
            }
            quoted.push(match self {
                SqlDialect::MySql => format!("`{part}`"),
                SqlDialect::Postgres | SqlDialect::Sqlite => format!("\"{part}\""),
            });
        }
        Ok(quoted.join("."))
    }

    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${index}"),
            SqlDialect::MySql | SqlDialect::Sqlite => "?".to_string(),
        }
    }

    pub fn column_type(&self, kind: ColumnKind, strategy: ColumnTypeStrategy) -> &'static str {
        match (kind, self) {
            (ColumnKind::Integer, SqlDialect::Sqlite) => "INTEGER",
            (ColumnKind::Integer, _) => "BIGINT",
            (ColumnKind::Key, SqlDialect::MySql) => "VARCHAR(191)",
            (ColumnKind::Key, _) => "TEXT",
            (ColumnKind::Text, _) => "TEXT",
            (ColumnKind::Timestamp, _) | (ColumnKind::Json, _)
                if strategy == ColumnTypeStrategy::Text =>
            {
                "TEXT"
            }
            (ColumnKind::Timestamp, SqlDialect::Postgres) => "TIMESTAMPTZ",
            (ColumnKind::Timestamp, SqlDialect::MySql) => "DATETIME(6)",
            (ColumnKind::Timestamp, SqlDialect::Sqlite) => "TEXT",
            (ColumnKind::Json, SqlDialect::Postgres) => "JSONB",
            (ColumnKind::Json, SqlDialect::MySql) => "JSON",
            (ColumnKind::Json, SqlDialect::Sqlite) => "TEXT",
        }
    }

    /// Builds `INSERT INTO table (cols) VALUES (...)` followed by the dialect's
    /// conflict clause. Returns the statement text; parameters are bound in
    /// column order.
    pub fn insert_statement(
        &self,
        table: &str,
        columns: &[&str],
        on_conflict: OnConflict<'_>,
    ) -> Result<String, CommonError> {
        let table = self.quote_identifier(table)?;
        let quoted_columns = columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect::<Result<Vec<_>, _>>()?;
        let placeholders = (1..=columns.len())
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ");

        let insert_keyword = match (self, &on_conflict) {
            (SqlDialect::MySql, OnConflict::DoNothing { .. }) => "INSERT IGNORE INTO",
            _ => "INSERT INTO",
        };
        let mut sql = format!(
            "{insert_keyword} {table} ({}) VALUES ({placeholders})",
            quoted_columns.join(", ")
        );

        match on_conflict {
            OnConflict::Error => {}
            OnConflict::DoNothing { conflict_columns } => {
                if *self != SqlDialect::MySql {
                    sql.push_str(&format!(
                        " ON CONFLICT ({}) DO NOTHING",
                        self.quote_list(conflict_columns)?
                    ));
                }
            }
            OnConflict::Update {
                conflict_columns,
                update_columns,
            } => {
                let assignments = update_columns
                    .iter()
                    .map(|c| {
                        let q = self.quote_identifier(c)?;
                        Ok(match self {
                            SqlDialect::MySql => format!("{q} = VALUES({q})"),
                            SqlDialect::Postgres | SqlDialect::Sqlite => {
                                format!("{q} = excluded.{q}")
                            }
                        })
                    })
                    .collect::<Result<Vec<_>, CommonError>>()?
                    .join(", ");
                match self {
                    SqlDialect::MySql => {
                        sql.push_str(&format!(" ON DUPLICATE KEY UPDATE {assignments}"))
                    }
                    SqlDialect::Postgres | SqlDialect::Sqlite => sql.push_str(&format!(
                        " ON CONFLICT ({}) DO UPDATE SET {assignments}",
                        self.quote_list(conflict_columns)?
                    )),
                }
            }
        }
        Ok(sql)
    }

    fn quote_list(&self, columns: &[&str]) -> Result<String, CommonError> {
        Ok(columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect::<Result<Vec<_>, _>>()?
            .join(", "))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum OnConflict<'a> {
    Error,
    DoNothing {
        conflict_columns: &'a [&'a str],
    },
    Update {
        conflict_columns: &'a [&'a str],
        update_columns: &'a [&'a str],
    },
}

/// Collects positional parameters while a statement is assembled and hands out
/// the matching placeholder for each.
#[derive(Debug)]
pub struct ParamBuilder {
    dialect: SqlDialect,
    values: Vec<SqlValue>,
}

impl ParamBuilder {
    pub fn new(dialect: SqlDialect) -> Self {
        Self {
            dialect,
            values: Vec::new(),
        }
    }

    pub fn push(&mut self, value: impl Into<SqlValue>) -> String {
        self.values.push(value.into());
        self.dialect.placeholder(self.values.len())
    }

    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }
}
