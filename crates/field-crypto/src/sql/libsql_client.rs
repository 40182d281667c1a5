use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use libsql::params::Params;
use shared::error::CommonError;
use shared::libsql::{Connection, establish_db_connection};
use tracing::trace;
use url::Url;

use super::{SqlClient, SqlDialect, SqlQueryResult, SqlRow, SqlStatement, SqlValue};

/// [`SqlClient`] backed by a local libsql (SQLite) connection.
#[derive(Debug, Clone)]
pub struct LibsqlSqlClient {
    conn: Connection,
}

impl LibsqlSqlClient {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }
}

/// Opens the database named by a `libsql://<path>?mode=local` url. The returned
/// [`libsql::Database`] must outlive the client.
pub async fn connect_libsql_client(
    database_url: &str,
) -> Result<(libsql::Database, LibsqlSqlClient), CommonError> {
    let url = Url::parse(database_url)?;
    let (db, conn) = establish_db_connection(&url).await?;
    Ok((db, LibsqlSqlClient::new(conn)))
}

impl From<&SqlValue> for libsql::Value {
    fn from(value: &SqlValue) -> Self {
        match value {
            SqlValue::Null => libsql::Value::Null,
            SqlValue::Integer(i) => libsql::Value::Integer(*i),
            SqlValue::Real(f) => libsql::Value::Real(*f),
            SqlValue::Text(s) => libsql::Value::Text(s.clone()),
        }
    }
}

impl From<libsql::Value> for SqlValue {
    fn from(value: libsql::Value) -> Self {
        match value {
            libsql::Value::Null => SqlValue::Null,
            libsql::Value::Integer(i) => SqlValue::Integer(i),
            libsql::Value::Real(f) => SqlValue::Real(f),
            libsql::Value::Text(s) => SqlValue::Text(s),
            libsql::Value::Blob(b) => {
                SqlValue::Text(base64::engine::general_purpose::STANDARD.encode(b))
            }
        }
    }
}

fn to_params(params: &[SqlValue]) -> Params {
    Params::Positional(params.iter().map(libsql::Value::from).collect())
}

fn returns_rows(sql: &str) -> bool {
    let keyword = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(
        keyword.as_str(),
        "SELECT" | "WITH" | "PRAGMA" | "VALUES" | "EXPLAIN"
    ) || sql
        .split(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | ','))
        .any(|token| token.eq_ignore_ascii_case("RETURNING"))
}

async fn collect_rows(mut rows: libsql::Rows) -> Result<Vec<SqlRow>, CommonError> {
    let column_count = rows.column_count();
    let columns = (0..column_count)
        .map(|i| rows.column_name(i).unwrap_or_default().to_string())
        .collect::<Vec<_>>();

    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        let mut values = BTreeMap::new();
        for (i, name) in columns.iter().enumerate() {
            values.insert(name.clone(), SqlValue::from(row.get_value(i as i32)?));
        }
        out.push(SqlRow(values));
    }
    Ok(out)
}

async fn run_on(
    conn: &libsql::Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<SqlQueryResult, CommonError> {
    trace!(sql, params = params.len(), "libsql statement in transaction");
    if returns_rows(sql) {
        let rows = conn.query(sql, to_params(params)).await?;
        Ok(SqlQueryResult {
            rows: collect_rows(rows).await?,
            row_count: None,
        })
    } else {
        let changed = conn.execute(sql, to_params(params)).await?;
        Ok(SqlQueryResult {
            rows: Vec::new(),
            row_count: Some(changed),
        })
    }
}

#[async_trait]
impl SqlClient for LibsqlSqlClient {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<SqlQueryResult, CommonError> {
        if returns_rows(sql) {
            let rows = self.conn.query(sql, to_params(params)).await?;
            Ok(SqlQueryResult {
                rows: collect_rows(rows).await?,
                row_count: None,
            })
        } else {
            let changed = self.conn.execute(sql, to_params(params)).await?;
            Ok(SqlQueryResult {
                rows: Vec::new(),
                row_count: Some(changed),
            })
        }
    }

    async fn transaction(
        &self,
        statements: Vec<SqlStatement>,
    ) -> Result<Vec<SqlQueryResult>, CommonError> {
        let tx = self.conn.0.transaction().await?;
        let mut results = Vec::with_capacity(statements.len());
        for statement in &statements {
            match run_on(&tx, &statement.sql, &statement.params).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        tracing::warn!("rollback failed: {rollback_err}");
                    }
                    return Err(e);
                }
            }
        }
        tx.commit().await?;
        Ok(results)
    }
}
