use serde::{Deserialize, Serialize};
use shared::{error::CommonError, primitives::WrappedChronoDateTime};
use tracing::{debug, info, warn};

use crate::logic::field_crypto::FieldCrypto;
use crate::logic::key_resolver::KeyResolutionContext;
use crate::logic::migration::schema::FieldCryptoMigrationSchema;
use crate::logic::migration::{FieldCryptoMigrationProgress, load_run_for_schema};
use crate::logic::policy::FieldCryptoMode;
use crate::repository::{
    FieldCryptoMigrationChunkRecord, FieldCryptoMigrationChunkStatus,
    FieldCryptoMigrationRepositoryLike, FieldCryptoMigrationRunRecord,
    FieldCryptoMigrationRunStatus,
};
use crate::sql::{
    ColumnTypeStrategy, ParamBuilder, SqlClient, SqlDialect, SqlRow, SqlStatement, SqlValue,
};

pub const DEFAULT_MAX_CHUNKS: u32 = 1;

fn default_max_chunks() -> u32 {
    DEFAULT_MAX_CHUNKS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyFieldCryptoMigrationParams {
    pub plan_id: String,
    /// Must fingerprint the same as the schema the plan was made with.
    pub schema: FieldCryptoMigrationSchema,
    #[serde(default = "default_max_chunks")]
    pub max_chunks: u32,
}

pub type ApplyFieldCryptoMigrationResponse = FieldCryptoMigrationProgress;
pub type RetryFieldCryptoMigrationParams = ApplyFieldCryptoMigrationParams;
pub type RetryFieldCryptoMigrationResponse = FieldCryptoMigrationProgress;

struct MigrationRow {
    id: SqlValue,
    requested_at: SqlValue,
    values: SqlRow,
}

fn migration_rows(
    schema: &FieldCryptoMigrationSchema,
    rows: Vec<SqlRow>,
) -> Result<Vec<MigrationRow>, CommonError> {
    rows.into_iter()
        .map(|values| {
            Ok(MigrationRow {
                id: values.require(&schema.id_column)?.clone(),
                requested_at: values.require(&schema.requested_at_column)?.clone(),
                values,
            })
        })
        .collect()
}

fn select_list(
    dialect: SqlDialect,
    schema: &FieldCryptoMigrationSchema,
) -> Result<String, CommonError> {
    Ok(schema
        .select_columns()
        .into_iter()
        .map(|c| dialect.quote_identifier(c))
        .collect::<Result<Vec<_>, _>>()?
        .join(", "))
}

/// Next page in `(requested_at, id)` order strictly after `cursor`.
async fn select_next_rows(
    target: &dyn SqlClient,
    schema: &FieldCryptoMigrationSchema,
    cursor: Option<(&SqlValue, &SqlValue)>,
    limit: i64,
) -> Result<Vec<MigrationRow>, CommonError> {
    let d = target.dialect();
    let req = d.quote_identifier(&schema.requested_at_column)?;
    let id = d.quote_identifier(&schema.id_column)?;
    let mut params = ParamBuilder::new(d);

    let mut sql = format!(
        "SELECT {} FROM {} WHERE {req} IS NOT NULL",
        select_list(d, schema)?,
        d.quote_identifier(&schema.table_name)?,
    );
    if let Some((cursor_requested_at, cursor_id)) = cursor {
        sql.push_str(&format!(
            " AND ({req} > {} OR ({req} = {} AND {id} > {}))",
            params.push(cursor_requested_at.clone()),
            params.push(cursor_requested_at.clone()),
            params.push(cursor_id.clone()),
        ));
    }
    sql.push_str(&format!(
        " ORDER BY {req} ASC, {id} ASC LIMIT {}",
        params.push(limit)
    ));

    let result = target.query(&sql, &params.into_values()).await?;
    migration_rows(schema, result.rows)
}

/// Re-reads exactly the rows a chunk recorded.
async fn select_rows_by_id(
    target: &dyn SqlClient,
    schema: &FieldCryptoMigrationSchema,
    ids: &[SqlValue],
) -> Result<Vec<MigrationRow>, CommonError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let d = target.dialect();
    let req = d.quote_identifier(&schema.requested_at_column)?;
    let id = d.quote_identifier(&schema.id_column)?;
    let mut params = ParamBuilder::new(d);
    let placeholders = ids
        .iter()
        .map(|v| params.push(v.clone()))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {} FROM {} WHERE {id} IN ({placeholders}) ORDER BY {req} ASC, {id} ASC",
        select_list(d, schema)?,
        d.quote_identifier(&schema.table_name)?,
    );
    let result = target.query(&sql, &params.into_values()).await?;
    migration_rows(schema, result.rows)
}

fn row_context(schema: &FieldCryptoMigrationSchema, row: &MigrationRow) -> KeyResolutionContext {
    let mut ctx = KeyResolutionContext::new();
    if let Some(id) = row.id.to_context_string() {
        ctx.insert("message_id", id);
    }
    for (key, column) in &schema.context_columns {
        if let Some(value) = row.values.get(column).and_then(SqlValue::to_context_string) {
            ctx.insert(key.clone(), value);
        }
    }
    ctx
}

/// Envelopes go into JSON-typed columns under the native type strategy.
fn cipher_placeholder(
    dialect: SqlDialect,
    strategy: ColumnTypeStrategy,
    placeholder: String,
) -> String {
    match (strategy, dialect) {
        (ColumnTypeStrategy::Native, SqlDialect::Postgres) => {
            format!("CAST({placeholder} AS JSONB)")
        }
        (ColumnTypeStrategy::Native, SqlDialect::MySql) => format!("CAST({placeholder} AS JSON)"),
        _ => placeholder,
    }
}

/// Builds the UPDATE for one row. Every target column is written through
/// COALESCE so a populated column is never overwritten and replaying a chunk
/// changes nothing.
async fn backfill_statement(
    target: &dyn SqlClient,
    crypto: &FieldCrypto,
    schema: &FieldCryptoMigrationSchema,
    row: &MigrationRow,
) -> Result<Option<SqlStatement>, CommonError> {
    let d = target.dialect();
    let ctx = row_context(schema, row);
    let mut params = ParamBuilder::new(d);
    let mut assignments = Vec::new();

    for field in &schema.fields {
        let Some(plain) = row
            .values
            .get(&field.plain_column)
            .and_then(SqlValue::to_context_string)
        else {
            continue;
        };
        let mode = crypto.mode_for(&field.path);
        let pending = field
            .target_columns(mode)
            .iter()
            .any(|c| row.values.get(c).is_none_or(SqlValue::is_null));

        let mut new_cipher = SqlValue::Null;
        if pending {
            let protected = crypto
                .protect_with_mode(&field.path, &plain, &ctx, mode)
                .await?;
            let mut writes: Vec<(&str, SqlValue, bool)> = Vec::new();
            match mode {
                FieldCryptoMode::Encrypt | FieldCryptoMode::EncryptHash => {
                    new_cipher = protected.stored.clone().into();
                    if let Some(column) = &field.cipher_column {
                        writes.push((column.as_str(), new_cipher.clone(), true));
                    }
                    if let (FieldCryptoMode::EncryptHash, Some(column)) =
                        (mode, &field.hash_column)
                    {
                        writes.push((column.as_str(), protected.hash.clone().into(), false));
                    }
                }
                FieldCryptoMode::Mask => {
                    if let Some(column) = &field.mask_column {
                        writes.push((column.as_str(), protected.stored.clone().into(), false));
                    }
                }
                FieldCryptoMode::Plain => {}
            }
            for (column, value, is_cipher) in writes {
                let q = d.quote_identifier(column)?;
                let p = params.push(value);
                let p = if is_cipher {
                    cipher_placeholder(d, schema.type_strategy, p)
                } else {
                    p
                };
                assignments.push(format!("{q} = COALESCE({q}, {p})"));
            }
        }

        if schema.clear_plain_columns && mode.encrypts() {
            if let Some(cipher_column) = &field.cipher_column {
                let plain_q = d.quote_identifier(&field.plain_column)?;
                let cipher_q = d.quote_identifier(cipher_column)?;
                let p = cipher_placeholder(d, schema.type_strategy, params.push(new_cipher));
                assignments.push(format!(
                    "{plain_q} = CASE WHEN COALESCE({cipher_q}, {p}) IS NOT NULL THEN NULL ELSE {plain_q} END"
                ));
            }
        }
    }

    if assignments.is_empty() {
        return Ok(None);
    }
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = {}",
        d.quote_identifier(&schema.table_name)?,
        assignments.join(", "),
        d.quote_identifier(&schema.id_column)?,
        params.push(row.id.clone()),
    );
    Ok(Some(SqlStatement::new(sql, params.into_values())))
}

/// Protects every row of a chunk and writes them in one transaction.
async fn backfill_rows(
    target: &dyn SqlClient,
    crypto: &FieldCrypto,
    schema: &FieldCryptoMigrationSchema,
    rows: &[MigrationRow],
) -> Result<(), CommonError> {
    let mut statements = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(statement) = backfill_statement(target, crypto, schema, row).await? {
            statements.push(statement);
        }
    }
    if !statements.is_empty() {
        target.transaction(statements).await?;
    }
    Ok(())
}

async fn reprocess_chunk(
    target: &dyn SqlClient,
    crypto: &FieldCrypto,
    schema: &FieldCryptoMigrationSchema,
    row_ids: &[SqlValue],
) -> Result<i64, CommonError> {
    let rows = select_rows_by_id(target, schema, row_ids).await?;
    backfill_rows(target, crypto, schema, &rows).await?;
    Ok(rows.len() as i64)
}

fn new_chunk(
    plan_id: &str,
    chunk_no: i64,
    rows: &[MigrationRow],
) -> FieldCryptoMigrationChunkRecord {
    let now = WrappedChronoDateTime::now();
    let first = rows.first();
    let last = rows.last();
    FieldCryptoMigrationChunkRecord {
        plan_id: plan_id.to_string(),
        chunk_no,
        start_requested_at: first.map(|r| r.requested_at.clone()),
        start_message_id: first.map(|r| r.id.clone()),
        end_requested_at: last.map(|r| r.requested_at.clone()),
        end_message_id: last.map(|r| r.id.clone()),
        row_ids: rows.iter().map(|r| r.id.clone()).collect(),
        row_count: rows.len() as i64,
        attempts: 1,
        status: FieldCryptoMigrationChunkStatus::Processing,
        last_error: None,
        created_at: now,
        updated_at: now,
    }
}

/// The table is exhausted: completed unless failed chunks are outstanding.
fn finish_run(run: &mut FieldCryptoMigrationRunRecord) {
    run.status = if run.failed_chunks == 0 {
        FieldCryptoMigrationRunStatus::Completed
    } else {
        FieldCryptoMigrationRunStatus::Failed
    };
}

/// Processes up to `max_chunks` chunks after the run's cursor. Stops at the
/// first failing chunk, leaving the cursor before it.
pub async fn apply_field_crypto_migration<R>(
    repo: &R,
    target: &dyn SqlClient,
    crypto: &FieldCrypto,
    params: ApplyFieldCryptoMigrationParams,
) -> Result<ApplyFieldCryptoMigrationResponse, CommonError>
where
    R: FieldCryptoMigrationRepositoryLike + ?Sized,
{
    let ApplyFieldCryptoMigrationParams {
        plan_id,
        schema,
        max_chunks,
    } = params;
    let run = load_run_for_schema(repo, target, crypto, &plan_id, &schema).await?;
    if run.status == FieldCryptoMigrationRunStatus::Completed {
        info!(plan_id = %plan_id, "field crypto migration already completed");
        return Ok(FieldCryptoMigrationProgress::new(run));
    }

    let mut progress = FieldCryptoMigrationProgress::new(run);
    let run = &mut progress.run;
    run.status = FieldCryptoMigrationRunStatus::Running;
    run.updated_at = WrappedChronoDateTime::now();
    repo.upsert_run(run).await?;
    info!(
        plan_id = %plan_id,
        max_chunks,
        processed_rows = run.processed_rows,
        "applying field crypto migration"
    );

    while progress.chunks_attempted < max_chunks {
        let cursor = match (&run.cursor_requested_at, &run.cursor_message_id) {
            (Some(requested_at), Some(id)) => Some((requested_at, id)),
            _ => None,
        };
        let rows = select_next_rows(target, &schema, cursor, run.chunk_size).await?;
        if rows.is_empty() {
            finish_run(run);
            break;
        }

        progress.chunks_attempted += 1;
        let chunk_no = repo.next_chunk_no(&plan_id).await?;
        let mut chunk = new_chunk(&plan_id, chunk_no, &rows);
        repo.upsert_chunk(&chunk).await?;
        debug!(plan_id = %plan_id, chunk_no, rows = rows.len(), "processing migration chunk");

        match backfill_rows(target, crypto, &schema, &rows).await {
            Ok(()) => {
                chunk.status = FieldCryptoMigrationChunkStatus::Completed;
                chunk.updated_at = WrappedChronoDateTime::now();
                repo.upsert_chunk(&chunk).await?;

                let row_count = rows.len() as i64;
                run.processed_rows += row_count;
                run.processed_chunks += 1;
                if let Some(last) = rows.last() {
                    run.cursor_requested_at = Some(last.requested_at.clone());
                    run.cursor_message_id = Some(last.id.clone());
                }
                progress.chunks_succeeded += 1;
                if row_count < run.chunk_size {
                    finish_run(run);
                }
            }
            Err(e) => {
                let message = e.to_string();
                warn!(
                    plan_id = %plan_id,
                    chunk_no,
                    error = %message,
                    "field crypto migration chunk failed"
                );
                chunk.status = FieldCryptoMigrationChunkStatus::Failed;
                chunk.last_error = Some(message.clone());
                chunk.updated_at = WrappedChronoDateTime::now();
                repo.upsert_chunk(&chunk).await?;

                run.failed_chunks += 1;
                run.status = FieldCryptoMigrationRunStatus::Failed;
                run.last_error = Some(message);
                progress.chunks_failed += 1;
            }
        }

        run.updated_at = WrappedChronoDateTime::now();
        repo.upsert_run(run).await?;
        if run.status != FieldCryptoMigrationRunStatus::Running {
            break;
        }
    }

    run.updated_at = WrappedChronoDateTime::now();
    repo.upsert_run(run).await?;
    info!(
        plan_id = %plan_id,
        status = run.status.as_str(),
        processed_rows = run.processed_rows,
        chunks_attempted = progress.chunks_attempted,
        "field crypto migration apply finished"
    );
    Ok(progress)
}

/// Re-attempts up to `max_chunks` failed chunks using their recorded row ids.
/// Once no failed chunk remains a failed run goes back to running.
pub async fn retry_field_crypto_migration<R>(
    repo: &R,
    target: &dyn SqlClient,
    crypto: &FieldCrypto,
    params: RetryFieldCryptoMigrationParams,
) -> Result<RetryFieldCryptoMigrationResponse, CommonError>
where
    R: FieldCryptoMigrationRepositoryLike + ?Sized,
{
    let ApplyFieldCryptoMigrationParams {
        plan_id,
        schema,
        max_chunks,
    } = params;
    let run = load_run_for_schema(repo, target, crypto, &plan_id, &schema).await?;
    let failed = repo
        .list_chunks_by_status(
            &plan_id,
            FieldCryptoMigrationChunkStatus::Failed,
            i64::from(max_chunks),
        )
        .await?;
    info!(
        plan_id = %plan_id,
        failed_chunks = failed.len(),
        "retrying field crypto migration chunks"
    );

    let mut progress = FieldCryptoMigrationProgress::new(run);
    let run = &mut progress.run;
    for mut chunk in failed {
        progress.chunks_attempted += 1;
        chunk.attempts += 1;
        chunk.status = FieldCryptoMigrationChunkStatus::Processing;
        chunk.last_error = None;
        chunk.updated_at = WrappedChronoDateTime::now();
        repo.upsert_chunk(&chunk).await?;

        match reprocess_chunk(target, crypto, &schema, &chunk.row_ids).await {
            Ok(row_count) => {
                debug!(
                    plan_id = %plan_id,
                    chunk_no = chunk.chunk_no,
                    attempts = chunk.attempts,
                    "migration chunk recovered"
                );
                chunk.status = FieldCryptoMigrationChunkStatus::Completed;
                run.failed_chunks = (run.failed_chunks - 1).max(0);
                run.processed_rows += row_count;
                run.processed_chunks += 1;
                progress.chunks_succeeded += 1;
            }
            Err(e) => {
                let message = e.to_string();
                warn!(
                    plan_id = %plan_id,
                    chunk_no = chunk.chunk_no,
                    attempts = chunk.attempts,
                    error = %message,
                    "migration chunk retry failed"
                );
                chunk.status = FieldCryptoMigrationChunkStatus::Failed;
                chunk.last_error = Some(message.clone());
                run.last_error = Some(message);
                progress.chunks_failed += 1;
            }
        }
        chunk.updated_at = WrappedChronoDateTime::now();
        repo.upsert_chunk(&chunk).await?;
    }

    if run.failed_chunks == 0 && run.status == FieldCryptoMigrationRunStatus::Failed {
        run.status = FieldCryptoMigrationRunStatus::Running;
        run.last_error = None;
    }
    run.updated_at = WrappedChronoDateTime::now();
    repo.upsert_run(run).await?;
    Ok(progress)
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::logic::crypto_services::unit_test::test_provider;
    use crate::logic::envelope::{CryptoEnvelope, is_envelope};
    use crate::logic::key_resolver::StaticKeyResolver;
    use crate::logic::migration::{
        FieldCryptoMigrationField, PlanFieldCryptoMigrationParams, plan_field_crypto_migration,
        status_field_crypto_migration,
    };
    use crate::logic::policy::{FieldCryptoConfig, ValidationOptions};
    use crate::repository::Repository;
    use crate::sql::unit_test::RecordingSqlClient;
    use crate::sql::{LibsqlSqlClient, SqlQueryResult};
    use shared::test_utils::repository::setup_in_memory_database;

    const MESSAGES_DDL: &str = "CREATE TABLE messages (
        message_id TEXT PRIMARY KEY,
        requested_at TEXT,
        tenant_id TEXT,
        to_number TEXT,
        to_cipher TEXT,
        to_hash TEXT,
        body TEXT,
        body_mask TEXT
    );";

    /// Fails the next `failures` write transactions.
    struct FlakyClient {
        inner: LibsqlSqlClient,
        failures: AtomicU32,
    }

    #[async_trait]
    impl SqlClient for FlakyClient {
        fn dialect(&self) -> SqlDialect {
            self.inner.dialect()
        }

        async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<SqlQueryResult, CommonError> {
            self.inner.query(sql, params).await
        }

        async fn transaction(
            &self,
            statements: Vec<SqlStatement>,
        ) -> Result<Vec<SqlQueryResult>, CommonError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(CommonError::Unknown(anyhow::anyhow!("injected write failure")));
            }
            self.inner.transaction(statements).await
        }
    }

    fn seed_messages(rows: usize) -> String {
        // requested_at repeats every 7 rows so the id tie-break is exercised
        format!(
            "WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < {rows})
            INSERT INTO messages (message_id, requested_at, tenant_id, to_number, body)
            SELECT printf('msg-%05d', n), printf('2024-01-01T00:00:%02dZ', n % 7), 'tenant-a',
                   printf('010-%04d-%04d', n, n), 'hello message ' || n
            FROM seq;
            INSERT INTO messages (message_id, requested_at, tenant_id, to_number)
            VALUES ('orphan-1', NULL, 'tenant-a', '010-0000-0000');"
        )
    }

    async fn setup(rows: usize) -> (libsql::Database, Arc<LibsqlSqlClient>, Repository) {
        shared::setup_test!();
        let seed = seed_messages(rows);
        let (db, conn) = setup_in_memory_database(&[MESSAGES_DDL, &seed]).await.unwrap();
        let client = Arc::new(LibsqlSqlClient::new(conn));
        let repo = Repository::new(client.clone());
        (db, client, repo)
    }

    fn crypto() -> FieldCrypto {
        let config = FieldCryptoConfig::new(Arc::new(test_provider()))
            .with_field("to", "encrypt+hash")
            .with_field("body", "mask")
            .with_aad_fields(vec!["tenant_id".to_string()]);
        FieldCrypto::new(config, ValidationOptions::default()).unwrap()
    }

    fn schema() -> FieldCryptoMigrationSchema {
        FieldCryptoMigrationSchema::new("messages")
            .with_field(
                FieldCryptoMigrationField::new("to", "to_number")
                    .with_cipher_column("to_cipher")
                    .with_hash_column("to_hash"),
            )
            .with_field(FieldCryptoMigrationField::new("body", "body").with_mask_column("body_mask"))
            .with_context_column("tenant_id", "tenant_id")
    }

    fn apply_params(plan_id: &str, schema: FieldCryptoMigrationSchema, max_chunks: u32) -> ApplyFieldCryptoMigrationParams {
        ApplyFieldCryptoMigrationParams {
            plan_id: plan_id.to_string(),
            schema,
            max_chunks,
        }
    }

    async fn plan(
        repo: &Repository,
        client: &dyn SqlClient,
        crypto: &FieldCrypto,
        schema: FieldCryptoMigrationSchema,
        chunk_size: i64,
    ) -> FieldCryptoMigrationRunRecord {
        plan_field_crypto_migration(
            repo,
            client,
            crypto,
            PlanFieldCryptoMigrationParams { schema, chunk_size },
        )
        .await
        .unwrap()
    }

    async fn count(client: &dyn SqlClient, sql: &str) -> i64 {
        client.query(sql, &[]).await.unwrap().rows[0].require_i64("n").unwrap()
    }

    async fn unmigrated(client: &dyn SqlClient) -> i64 {
        count(
            client,
            "SELECT COUNT(*) AS n FROM messages WHERE requested_at IS NOT NULL
             AND (to_cipher IS NULL OR to_hash IS NULL OR body_mask IS NULL)",
        )
        .await
    }

    /// One unmigrated row as the keyset walk would return it.
    fn pending_row(schema: &FieldCryptoMigrationSchema) -> MigrationRow {
        let values = SqlRow(
            [
                ("message_id", SqlValue::from("msg-00001")),
                ("requested_at", SqlValue::from("2024-01-01T00:00:01Z")),
                ("tenant_id", SqlValue::from("tenant-a")),
                ("to_number", SqlValue::from("010-1234-5678")),
                ("to_cipher", SqlValue::Null),
                ("to_hash", SqlValue::Null),
                ("body", SqlValue::from("hello message 1")),
                ("body_mask", SqlValue::Null),
            ]
            .into_iter()
            .map(|(column, value)| (column.to_string(), value))
            .collect(),
        );
        migration_rows(schema, vec![values]).unwrap().remove(0)
    }

    const SELECT_LIST_PG: &str = "\"message_id\", \"requested_at\", \"to_number\", \"to_cipher\", \"to_hash\", \"body\", \"body_mask\", \"tenant_id\"";

    #[tokio::test]
    async fn test_postgres_select_numbers_placeholders() {
        shared::setup_test!();
        let client = RecordingSqlClient::new(SqlDialect::Postgres);
        let cursor_at = SqlValue::from("2024-01-01T00:00:03Z");
        let cursor_id = SqlValue::from("msg-00010");

        let rows = select_next_rows(&client, &schema(), Some((&cursor_at, &cursor_id)), 500)
            .await
            .unwrap();
        assert!(rows.is_empty());

        let ids = [SqlValue::from("msg-00001"), SqlValue::from("msg-00002")];
        select_rows_by_id(&client, &schema(), &ids).await.unwrap();

        let recorded = client.recorded();
        assert_eq!(recorded.len(), 2);
        assert_eq!(
            recorded[0].sql,
            format!(
                "SELECT {SELECT_LIST_PG} FROM \"messages\" WHERE \"requested_at\" IS NOT NULL \
                 AND (\"requested_at\" > $1 OR (\"requested_at\" = $2 AND \"message_id\" > $3)) \
                 ORDER BY \"requested_at\" ASC, \"message_id\" ASC LIMIT $4"
            )
        );
        assert_eq!(
            recorded[0].params,
            vec![cursor_at.clone(), cursor_at, cursor_id, SqlValue::Integer(500)]
        );
        assert_eq!(
            recorded[1].sql,
            format!(
                "SELECT {SELECT_LIST_PG} FROM \"messages\" WHERE \"message_id\" IN ($1, $2) \
                 ORDER BY \"requested_at\" ASC, \"message_id\" ASC"
            )
        );
        assert_eq!(recorded[1].params, ids.to_vec());
    }

    #[tokio::test]
    async fn test_mysql_first_page_select() {
        shared::setup_test!();
        let client = RecordingSqlClient::new(SqlDialect::MySql);
        select_next_rows(&client, &schema(), None, 2).await.unwrap();

        let recorded = client.recorded();
        assert!(recorded[0].sql.starts_with("SELECT `message_id`, `requested_at`, `to_number`"));
        assert!(recorded[0].sql.ends_with(
            "FROM `messages` WHERE `requested_at` IS NOT NULL \
             ORDER BY `requested_at` ASC, `message_id` ASC LIMIT ?"
        ));
        assert_eq!(recorded[0].params, vec![SqlValue::Integer(2)]);
    }

    #[tokio::test]
    async fn test_postgres_native_backfill_casts_cipher_params() {
        shared::setup_test!();
        let client = RecordingSqlClient::new(SqlDialect::Postgres);
        let schema = schema()
            .with_type_strategy(ColumnTypeStrategy::Native)
            .with_clear_plain_columns(true);

        let statement = backfill_statement(&client, &crypto(), &schema, &pending_row(&schema))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            statement.sql,
            "UPDATE \"messages\" SET \
             \"to_cipher\" = COALESCE(\"to_cipher\", CAST($1 AS JSONB)), \
             \"to_hash\" = COALESCE(\"to_hash\", $2), \
             \"to_number\" = CASE WHEN COALESCE(\"to_cipher\", CAST($3 AS JSONB)) IS NOT NULL \
             THEN NULL ELSE \"to_number\" END, \
             \"body_mask\" = COALESCE(\"body_mask\", $4) \
             WHERE \"message_id\" = $5"
        );
        let params = &statement.params;
        assert_eq!(params.len(), 5);
        // the CASE sees the same envelope the cipher column is written with
        assert_eq!(params[0], params[2]);
        assert!(is_envelope(params[0].as_str().unwrap()));
        assert_eq!(params[1].as_str().map(str::len), Some(64));
        assert!(params[3].as_str().unwrap().contains('*'));
        assert_eq!(params[4], SqlValue::from("msg-00001"));
        assert!(client.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_mysql_native_backfill_statement() {
        shared::setup_test!();
        let client = RecordingSqlClient::new(SqlDialect::MySql);
        let schema = schema().with_type_strategy(ColumnTypeStrategy::Native);

        let statement = backfill_statement(&client, &crypto(), &schema, &pending_row(&schema))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            statement.sql,
            "UPDATE `messages` SET `to_cipher` = COALESCE(`to_cipher`, CAST(? AS JSON)), \
             `to_hash` = COALESCE(`to_hash`, ?), `body_mask` = COALESCE(`body_mask`, ?) \
             WHERE `message_id` = ?"
        );
        assert_eq!(statement.params.len(), 4);
        assert_eq!(statement.params[3], SqlValue::from("msg-00001"));
    }

    #[tokio::test]
    async fn test_plan_with_oversized_chunk_size() {
        let (_db, client, repo) = setup(3).await;
        let planned = plan(&repo, &*client, &crypto(), schema(), i64::MAX).await;
        assert_eq!(planned.total_rows, 3);
        assert_eq!(planned.total_chunks, 1);

        let done = apply_field_crypto_migration(
            &repo,
            &*client,
            &crypto(),
            apply_params(&planned.plan_id, schema(), 1),
        )
        .await
        .unwrap();
        assert_eq!(done.run.status, FieldCryptoMigrationRunStatus::Completed);
        assert_eq!(done.run.processed_rows, 3);
    }

    #[tokio::test]
    async fn test_bounded_applies_reach_completion() {
        let (_db, client, repo) = setup(2500).await;
        let crypto = crypto();

        let planned = plan(&repo, &*client, &crypto, schema(), 1000).await;
        assert_eq!(planned.status, FieldCryptoMigrationRunStatus::Planned);
        assert_eq!(planned.total_rows, 2500);
        assert_eq!(planned.total_chunks, 3);
        let replanned = plan(&repo, &*client, &crypto, schema(), 1000).await;
        assert_eq!(replanned.plan_id, planned.plan_id);

        let first = apply_field_crypto_migration(&repo, &*client, &crypto, apply_params(&planned.plan_id, schema(), 1))
            .await
            .unwrap();
        assert_eq!(first.chunks_attempted, 1);
        assert_eq!(first.run.processed_rows, 1000);
        assert_eq!(first.run.status, FieldCryptoMigrationRunStatus::Running);
        assert_eq!(unmigrated(&*client).await, 1500);

        let second = apply_field_crypto_migration(&repo, &*client, &crypto, apply_params(&planned.plan_id, schema(), 10))
            .await
            .unwrap();
        assert_eq!(second.chunks_attempted, 2);
        assert_eq!(second.run.processed_rows, 2500);
        assert_eq!(second.run.processed_chunks, 3);
        assert_eq!(second.run.failed_chunks, 0);
        assert_eq!(second.run.status, FieldCryptoMigrationRunStatus::Completed);
        assert_eq!(unmigrated(&*client).await, 0);

        // rows outside the keyset walk are left alone
        assert_eq!(
            count(&*client, "SELECT COUNT(*) AS n FROM messages WHERE message_id = 'orphan-1' AND to_cipher IS NULL").await,
            1
        );

        let rows = client
            .query("SELECT to_cipher, to_hash, body_mask FROM messages WHERE message_id = 'msg-00042'", &[])
            .await
            .unwrap()
            .rows;
        let row = &rows[0];
        let ctx = KeyResolutionContext::new().with("tenant_id", "tenant-a");
        let revealed = crypto
            .reveal("to", &row.require_str("to_cipher").unwrap(), &ctx)
            .await
            .unwrap();
        assert_eq!(revealed.as_deref(), Some("010-0042-0042"));
        let hashes = crypto.lookup_hashes("to", "010-0042-0042").await.unwrap();
        assert_eq!(row.require_str("to_hash").unwrap(), hashes[0]);
        assert_eq!(row.require_str("body_mask").unwrap(), "hel*********e 42");

        let status = status_field_crypto_migration(&repo, &planned.plan_id).await.unwrap();
        assert_eq!(status.run.status, FieldCryptoMigrationRunStatus::Completed);
        assert_eq!(status.chunk_counts.get(&FieldCryptoMigrationChunkStatus::Completed), Some(&3));

        let again = apply_field_crypto_migration(&repo, &*client, &crypto, apply_params(&planned.plan_id, schema(), 10))
            .await
            .unwrap();
        assert_eq!(again.chunks_attempted, 0);
        assert_eq!(again.run.processed_rows, 2500);
    }

    #[tokio::test]
    async fn test_failed_chunk_is_recorded_and_retried() {
        let (_db, client, repo) = setup(250).await;
        let crypto = crypto();
        let flaky = FlakyClient {
            inner: (*client).clone(),
            failures: AtomicU32::new(1),
        };

        let planned = plan(&repo, &flaky, &crypto, schema(), 100).await;
        let failed = apply_field_crypto_migration(&repo, &flaky, &crypto, apply_params(&planned.plan_id, schema(), 10))
            .await
            .unwrap();
        assert_eq!(failed.chunks_attempted, 1);
        assert_eq!(failed.chunks_failed, 1);
        assert_eq!(failed.run.status, FieldCryptoMigrationRunStatus::Failed);
        assert_eq!(failed.run.failed_chunks, 1);
        assert_eq!(failed.run.processed_rows, 0);
        assert!(failed.run.cursor_message_id.is_none());
        assert!(failed.run.last_error.as_deref().unwrap().contains("injected"));

        let chunk = repo.get_chunk(&planned.plan_id, 1).await.unwrap().unwrap();
        assert_eq!(chunk.status, FieldCryptoMigrationChunkStatus::Failed);
        assert_eq!(chunk.row_ids.len(), 100);
        assert_eq!(chunk.start_message_id, Some(SqlValue::from("msg-00007")));

        let retried = retry_field_crypto_migration(&repo, &flaky, &crypto, apply_params(&planned.plan_id, schema(), 10))
            .await
            .unwrap();
        assert_eq!(retried.chunks_succeeded, 1);
        assert_eq!(retried.run.failed_chunks, 0);
        assert_eq!(retried.run.status, FieldCryptoMigrationRunStatus::Running);
        assert!(retried.run.last_error.is_none());
        let chunk = repo.get_chunk(&planned.plan_id, 1).await.unwrap().unwrap();
        assert_eq!(chunk.status, FieldCryptoMigrationChunkStatus::Completed);
        assert_eq!(chunk.attempts, 2);

        // the cursor never moved past the failed chunk, so apply walks it again
        let done = apply_field_crypto_migration(&repo, &flaky, &crypto, apply_params(&planned.plan_id, schema(), 10))
            .await
            .unwrap();
        assert_eq!(done.run.status, FieldCryptoMigrationRunStatus::Completed);
        assert_eq!(done.run.processed_rows, 350);
        assert_eq!(unmigrated(&*client).await, 0);

        let status = status_field_crypto_migration(&repo, &planned.plan_id).await.unwrap();
        assert_eq!(status.chunk_counts.get(&FieldCryptoMigrationChunkStatus::Completed), Some(&4));
        assert_eq!(status.chunk_counts.get(&FieldCryptoMigrationChunkStatus::Failed), None);
    }

    #[tokio::test]
    async fn test_backfill_never_overwrites_populated_columns() {
        let (_db, client, repo) = setup(20).await;
        let crypto = crypto();
        let planned = plan(&repo, &*client, &crypto, schema(), 5).await;
        apply_field_crypto_migration(&repo, &*client, &crypto, apply_params(&planned.plan_id, schema(), 10))
            .await
            .unwrap();

        let before = client
            .query("SELECT to_cipher FROM messages WHERE message_id = 'msg-00003'", &[])
            .await
            .unwrap()
            .rows[0]
            .require_str("to_cipher")
            .unwrap();
        client
            .query("UPDATE messages SET to_hash = NULL WHERE message_id = 'msg-00003'", &[])
            .await
            .unwrap();

        let replanned = plan(&repo, &*client, &crypto, schema(), 7).await;
        assert_ne!(replanned.plan_id, planned.plan_id);
        apply_field_crypto_migration(&repo, &*client, &crypto, apply_params(&replanned.plan_id, schema(), 10))
            .await
            .unwrap();

        let rows = client
            .query("SELECT to_cipher, to_hash FROM messages WHERE message_id = 'msg-00003'", &[])
            .await
            .unwrap()
            .rows;
        let row = &rows[0];
        assert_eq!(row.require_str("to_cipher").unwrap(), before);
        assert!(row.get_str("to_hash").is_some());
    }

    #[tokio::test]
    async fn test_clear_plain_columns_and_resolver_kid() {
        let (_db, client, repo) = setup(10).await;
        let config = FieldCryptoConfig::new(Arc::new(test_provider()))
            .with_field("to", "encrypt+hash")
            .with_field("body", "mask")
            .with_key_resolver(Arc::new(StaticKeyResolver::new("k2", &[]).unwrap()));
        let crypto = FieldCrypto::new(config, ValidationOptions::default()).unwrap();
        let schema = schema().with_clear_plain_columns(true);

        let planned = plan(&repo, &*client, &crypto, schema.clone(), 4).await;
        let done = apply_field_crypto_migration(&repo, &*client, &crypto, apply_params(&planned.plan_id, schema, 10))
            .await
            .unwrap();
        assert_eq!(done.run.status, FieldCryptoMigrationRunStatus::Completed);
        assert_eq!(done.chunks_attempted, 3);

        assert_eq!(
            count(&*client, "SELECT COUNT(*) AS n FROM messages WHERE requested_at IS NOT NULL AND to_number IS NOT NULL").await,
            0
        );
        // masked fields keep their plaintext column
        assert_eq!(
            count(&*client, "SELECT COUNT(*) AS n FROM messages WHERE body IS NOT NULL").await,
            10
        );

        let cipher = client
            .query("SELECT to_cipher FROM messages WHERE message_id = 'msg-00001'", &[])
            .await
            .unwrap()
            .rows[0]
            .require_str("to_cipher")
            .unwrap();
        assert_eq!(CryptoEnvelope::decode(&cipher).unwrap().kid, "k2");
    }

    #[tokio::test]
    async fn test_apply_guards() {
        let (_db, client, repo) = setup(10).await;
        let crypto = crypto();

        let err = plan_field_crypto_migration(
            &repo,
            &*client,
            &crypto,
            PlanFieldCryptoMigrationParams {
                schema: schema(),
                chunk_size: 0,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommonError::InvalidRequest { .. }));

        let err = apply_field_crypto_migration(&repo, &*client, &crypto, apply_params("fcmig_missing", schema(), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CommonError::NotFound { .. }));

        let planned = plan(&repo, &*client, &crypto, schema(), 4).await;
        let changed = schema().with_clear_plain_columns(true);
        let err = apply_field_crypto_migration(&repo, &*client, &crypto, apply_params(&planned.plan_id, changed.clone(), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CommonError::InvalidRequest { .. }));
        let err = retry_field_crypto_migration(&repo, &*client, &crypto, apply_params(&planned.plan_id, changed, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CommonError::InvalidRequest { .. }));

        // nothing was touched
        assert_eq!(unmigrated(&*client).await, 10);
        let status = status_field_crypto_migration(&repo, &planned.plan_id).await.unwrap();
        assert_eq!(status.run.status, FieldCryptoMigrationRunStatus::Planned);
        assert!(status.chunk_counts.is_empty());
    }
}
