use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use shared::{error::CommonError, primitives::WrappedChronoDateTime};
use tracing::trace;

use crate::repository::{
    FieldCryptoMigrationChunkRecord, FieldCryptoMigrationChunkStatus,
    FieldCryptoMigrationRepositoryLike, FieldCryptoMigrationRunRecord,
    FieldCryptoMigrationRunStatus,
};
use crate::sql::{
    ColumnKind, ColumnTypeStrategy, OnConflict, ParamBuilder, SqlClient, SqlDialect, SqlRow,
    SqlValue,
};

pub const RUNS_TABLE: &str = "field_crypto_migration_runs";
pub const CHUNKS_TABLE: &str = "field_crypto_migration_chunks";

const RUN_COLUMNS: [&str; 15] = [
    "plan_id",
    "table_name",
    "chunk_size",
    "schema_fingerprint",
    "status",
    "total_rows",
    "total_chunks",
    "processed_rows",
    "processed_chunks",
    "failed_chunks",
    "cursor_requested_at",
    "cursor_message_id",
    "last_error",
    "created_at",
    "updated_at",
];

// Everything but the key and created_at.
const RUN_UPDATE_COLUMNS: [&str; 13] = [
    "table_name",
    "chunk_size",
    "schema_fingerprint",
    "status",
    "total_rows",
    "total_chunks",
    "processed_rows",
    "processed_chunks",
    "failed_chunks",
    "cursor_requested_at",
    "cursor_message_id",
    "last_error",
    "updated_at",
];

const CHUNK_COLUMNS: [&str; 13] = [
    "plan_id",
    "chunk_no",
    "start_requested_at",
    "start_message_id",
    "end_requested_at",
    "end_message_id",
    "row_ids",
    "row_count",
    "attempts",
    "status",
    "last_error",
    "created_at",
    "updated_at",
];

/// Migration state store over any [`SqlClient`]. Both tables live next to the
/// data being migrated and are created on first use. Cursor values and row ids
/// are stored as JSON text whatever type strategy the migrated table uses.
#[derive(Clone)]
pub struct Repository {
    client: Arc<dyn SqlClient>,
}

impl Repository {
    pub fn new(client: Arc<dyn SqlClient>) -> Self {
        Self { client }
    }

    fn dialect(&self) -> SqlDialect {
        self.client.dialect()
    }

    fn column_list(&self, columns: &[&str]) -> Result<String, CommonError> {
        Ok(columns
            .iter()
            .map(|c| self.dialect().quote_identifier(c))
            .collect::<Result<Vec<_>, _>>()?
            .join(", "))
    }

    fn runs_ddl(&self) -> Result<String, CommonError> {
        let d = self.dialect();
        let t = |kind| d.column_type(kind, ColumnTypeStrategy::Text);
        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {table} (
    plan_id {key} PRIMARY KEY,
    table_name {text} NOT NULL,
    chunk_size {int} NOT NULL,
    schema_fingerprint {text} NOT NULL,
    status {key} NOT NULL,
    total_rows {int} NOT NULL DEFAULT 0,
    total_chunks {int} NOT NULL DEFAULT 0,
    processed_rows {int} NOT NULL DEFAULT 0,
    processed_chunks {int} NOT NULL DEFAULT 0,
    failed_chunks {int} NOT NULL DEFAULT 0,
    cursor_requested_at {json} NULL,
    cursor_message_id {json} NULL,
    last_error {text} NULL,
    created_at {ts} NOT NULL,
    updated_at {ts} NOT NULL
)",
            table = d.quote_identifier(RUNS_TABLE)?,
            key = t(ColumnKind::Key),
            text = t(ColumnKind::Text),
            int = t(ColumnKind::Integer),
            json = t(ColumnKind::Json),
            ts = t(ColumnKind::Timestamp),
        ))
    }

    fn chunks_ddl(&self) -> Result<String, CommonError> {
        let d = self.dialect();
        let t = |kind| d.column_type(kind, ColumnTypeStrategy::Text);
        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {table} (
    plan_id {key} NOT NULL,
    chunk_no {int} NOT NULL,
    start_requested_at {json} NULL,
    start_message_id {json} NULL,
    end_requested_at {json} NULL,
    end_message_id {json} NULL,
    row_ids {json} NOT NULL,
    row_count {int} NOT NULL,
    attempts {int} NOT NULL,
    status {key} NOT NULL,
    last_error {text} NULL,
    created_at {ts} NOT NULL,
    updated_at {ts} NOT NULL,
    PRIMARY KEY (plan_id, chunk_no)
)",
            table = d.quote_identifier(CHUNKS_TABLE)?,
            key = t(ColumnKind::Key),
            text = t(ColumnKind::Text),
            int = t(ColumnKind::Integer),
            json = t(ColumnKind::Json),
            ts = t(ColumnKind::Timestamp),
        ))
    }
}

fn repository_error(e: anyhow::Error) -> CommonError {
    CommonError::Repository {
        msg: e.to_string(),
        source: Some(e),
    }
}

fn encode_json(value: Option<&SqlValue>) -> Result<SqlValue, CommonError> {
    match value {
        None => Ok(SqlValue::Null),
        Some(v) => Ok(SqlValue::Text(serde_json::to_string(v)?)),
    }
}

fn decode_json(row: &SqlRow, column: &str) -> Result<Option<SqlValue>, CommonError> {
    match row.get(column) {
        None | Some(SqlValue::Null) => Ok(None),
        Some(SqlValue::Text(s)) => Ok(Some(
            serde_json::from_str(s)
                .with_context(|| format!("column {column} does not hold a JSON value"))
                .map_err(repository_error)?,
        )),
        Some(other) => Ok(Some(other.clone())),
    }
}

fn decode_timestamp(row: &SqlRow, column: &str) -> Result<WrappedChronoDateTime, CommonError> {
    let raw = row.require_str(column)?;
    WrappedChronoDateTime::try_from(raw.as_str())
        .with_context(|| format!("column {column} is not a timestamp"))
        .map_err(repository_error)
}

fn timestamp(value: &WrappedChronoDateTime) -> SqlValue {
    SqlValue::Text(value.to_string())
}

fn run_params(run: &FieldCryptoMigrationRunRecord) -> Result<Vec<SqlValue>, CommonError> {
    Ok(vec![
        run.plan_id.clone().into(),
        run.table_name.clone().into(),
        run.chunk_size.into(),
        run.schema_fingerprint.clone().into(),
        run.status.into(),
        run.total_rows.into(),
        run.total_chunks.into(),
        run.processed_rows.into(),
        run.processed_chunks.into(),
        run.failed_chunks.into(),
        encode_json(run.cursor_requested_at.as_ref())?,
        encode_json(run.cursor_message_id.as_ref())?,
        run.last_error.clone().into(),
        timestamp(&run.created_at),
        timestamp(&run.updated_at),
    ])
}

fn run_from_row(row: &SqlRow) -> Result<FieldCryptoMigrationRunRecord, CommonError> {
    Ok(FieldCryptoMigrationRunRecord {
        plan_id: row.require_str("plan_id")?,
        table_name: row.require_str("table_name")?,
        chunk_size: row.require_i64("chunk_size")?,
        schema_fingerprint: row.require_str("schema_fingerprint")?,
        status: FieldCryptoMigrationRunStatus::from_str(&row.require_str("status")?)?,
        total_rows: row.require_i64("total_rows")?,
        total_chunks: row.require_i64("total_chunks")?,
        processed_rows: row.require_i64("processed_rows")?,
        processed_chunks: row.require_i64("processed_chunks")?,
        failed_chunks: row.require_i64("failed_chunks")?,
        cursor_requested_at: decode_json(row, "cursor_requested_at")?,
        cursor_message_id: decode_json(row, "cursor_message_id")?,
        last_error: row.get_str("last_error").map(str::to_string),
        created_at: decode_timestamp(row, "created_at")?,
        updated_at: decode_timestamp(row, "updated_at")?,
    })
}

fn chunk_params(chunk: &FieldCryptoMigrationChunkRecord) -> Result<Vec<SqlValue>, CommonError> {
    Ok(vec![
        chunk.plan_id.clone().into(),
        chunk.chunk_no.into(),
        encode_json(chunk.start_requested_at.as_ref())?,
        encode_json(chunk.start_message_id.as_ref())?,
        encode_json(chunk.end_requested_at.as_ref())?,
        encode_json(chunk.end_message_id.as_ref())?,
        SqlValue::Text(serde_json::to_string(&chunk.row_ids)?),
        chunk.row_count.into(),
        chunk.attempts.into(),
        chunk.status.into(),
        chunk.last_error.clone().into(),
        timestamp(&chunk.created_at),
        timestamp(&chunk.updated_at),
    ])
}

fn chunk_from_row(row: &SqlRow) -> Result<FieldCryptoMigrationChunkRecord, CommonError> {
    let row_ids: Vec<SqlValue> = serde_json::from_str(&row.require_str("row_ids")?)
        .context("row_ids is not a JSON array")
        .map_err(repository_error)?;
    Ok(FieldCryptoMigrationChunkRecord {
        plan_id: row.require_str("plan_id")?,
        chunk_no: row.require_i64("chunk_no")?,
        start_requested_at: decode_json(row, "start_requested_at")?,
        start_message_id: decode_json(row, "start_message_id")?,
        end_requested_at: decode_json(row, "end_requested_at")?,
        end_message_id: decode_json(row, "end_message_id")?,
        row_ids,
        row_count: row.require_i64("row_count")?,
        attempts: row.require_i64("attempts")?,
        status: FieldCryptoMigrationChunkStatus::from_str(&row.require_str("status")?)?,
        last_error: row.get_str("last_error").map(str::to_string),
        created_at: decode_timestamp(row, "created_at")?,
        updated_at: decode_timestamp(row, "updated_at")?,
    })
}

#[async_trait::async_trait]
impl FieldCryptoMigrationRepositoryLike for Repository {
    async fn ensure_schema(&self) -> Result<(), CommonError> {
        for ddl in [self.runs_ddl()?, self.chunks_ddl()?] {
            trace!(ddl = %ddl, "ensuring migration state table");
            self.client.query(&ddl, &[]).await?;
        }
        Ok(())
    }

    async fn create_run_if_absent(
        &self,
        run: &FieldCryptoMigrationRunRecord,
    ) -> Result<bool, CommonError> {
        let sql = self.dialect().insert_statement(
            RUNS_TABLE,
            &RUN_COLUMNS,
            OnConflict::DoNothing {
                conflict_columns: &["plan_id"],
            },
        )?;
        let result = self.client.query(&sql, &run_params(run)?).await?;
        Ok(result.row_count != Some(0))
    }

    async fn get_run(
        &self,
        plan_id: &str,
    ) -> Result<Option<FieldCryptoMigrationRunRecord>, CommonError> {
        let d = self.dialect();
        let mut params = ParamBuilder::new(d);
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = {}",
            self.column_list(&RUN_COLUMNS)?,
            d.quote_identifier(RUNS_TABLE)?,
            d.quote_identifier("plan_id")?,
            params.push(plan_id),
        );
        let result = self.client.query(&sql, &params.into_values()).await?;
        result.rows.first().map(run_from_row).transpose()
    }

    async fn upsert_run(&self, run: &FieldCryptoMigrationRunRecord) -> Result<(), CommonError> {
        let sql = self.dialect().insert_statement(
            RUNS_TABLE,
            &RUN_COLUMNS,
            OnConflict::Update {
                conflict_columns: &["plan_id"],
                update_columns: &RUN_UPDATE_COLUMNS,
            },
        )?;
        self.client.query(&sql, &run_params(run)?).await?;
        Ok(())
    }

    async fn upsert_chunk(
        &self,
        chunk: &FieldCryptoMigrationChunkRecord,
    ) -> Result<(), CommonError> {
        let sql = self.dialect().insert_statement(
            CHUNKS_TABLE,
            &CHUNK_COLUMNS,
            OnConflict::Update {
                conflict_columns: &["plan_id", "chunk_no"],
                update_columns: &[
                    "start_requested_at",
                    "start_message_id",
                    "end_requested_at",
                    "end_message_id",
                    "row_ids",
                    "row_count",
                    "attempts",
                    "status",
                    "last_error",
                    "updated_at",
                ],
            },
        )?;
        self.client.query(&sql, &chunk_params(chunk)?).await?;
        Ok(())
    }

    async fn get_chunk(
        &self,
        plan_id: &str,
        chunk_no: i64,
    ) -> Result<Option<FieldCryptoMigrationChunkRecord>, CommonError> {
        let d = self.dialect();
        let mut params = ParamBuilder::new(d);
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = {} AND {} = {}",
            self.column_list(&CHUNK_COLUMNS)?,
            d.quote_identifier(CHUNKS_TABLE)?,
            d.quote_identifier("plan_id")?,
            params.push(plan_id),
            d.quote_identifier("chunk_no")?,
            params.push(chunk_no),
        );
        let result = self.client.query(&sql, &params.into_values()).await?;
        result.rows.first().map(chunk_from_row).transpose()
    }

    async fn next_chunk_no(&self, plan_id: &str) -> Result<i64, CommonError> {
        let d = self.dialect();
        let mut params = ParamBuilder::new(d);
        let sql = format!(
            "SELECT COALESCE(MAX({}), 0) AS max_chunk_no FROM {} WHERE {} = {}",
            d.quote_identifier("chunk_no")?,
            d.quote_identifier(CHUNKS_TABLE)?,
            d.quote_identifier("plan_id")?,
            params.push(plan_id),
        );
        let result = self.client.query(&sql, &params.into_values()).await?;
        let max = match result.rows.first() {
            Some(row) => row.get_i64("max_chunk_no").unwrap_or(0),
            None => 0,
        };
        Ok(max + 1)
    }

    async fn list_chunks_by_status(
        &self,
        plan_id: &str,
        status: FieldCryptoMigrationChunkStatus,
        limit: i64,
    ) -> Result<Vec<FieldCryptoMigrationChunkRecord>, CommonError> {
        let d = self.dialect();
        let mut params = ParamBuilder::new(d);
        let chunk_no = d.quote_identifier("chunk_no")?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = {} AND {} = {} ORDER BY {chunk_no} ASC LIMIT {}",
            self.column_list(&CHUNK_COLUMNS)?,
            d.quote_identifier(CHUNKS_TABLE)?,
            d.quote_identifier("plan_id")?,
            params.push(plan_id),
            d.quote_identifier("status")?,
            params.push(status),
            params.push(limit),
        );
        let result = self.client.query(&sql, &params.into_values()).await?;
        result.rows.iter().map(chunk_from_row).collect()
    }

    async fn count_chunks_by_status(
        &self,
        plan_id: &str,
    ) -> Result<BTreeMap<FieldCryptoMigrationChunkStatus, i64>, CommonError> {
        let d = self.dialect();
        let mut params = ParamBuilder::new(d);
        let status = d.quote_identifier("status")?;
        let sql = format!(
            "SELECT {status} AS status, COUNT(*) AS total FROM {} WHERE {} = {} GROUP BY {status}",
            d.quote_identifier(CHUNKS_TABLE)?,
            d.quote_identifier("plan_id")?,
            params.push(plan_id),
        );
        let result = self.client.query(&sql, &params.into_values()).await?;

        let mut counts = BTreeMap::new();
        for row in &result.rows {
            let status = FieldCryptoMigrationChunkStatus::from_str(&row.require_str("status")?)?;
            counts.insert(status, row.require_i64("total")?);
        }
        Ok(counts)
    }
}
