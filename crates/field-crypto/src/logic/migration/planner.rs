use serde::{Deserialize, Serialize};
use shared::{error::CommonError, primitives::WrappedChronoDateTime};
use tracing::info;

use crate::logic::field_crypto::FieldCrypto;
use crate::logic::migration::schema::{
    FieldCryptoMigrationSchema, migration_plan_id, schema_fingerprint, validate_migration_schema,
};
use crate::repository::{
    FieldCryptoMigrationRepositoryLike, FieldCryptoMigrationRunRecord,
    FieldCryptoMigrationRunStatus,
};
use crate::sql::SqlClient;

pub const DEFAULT_CHUNK_SIZE: i64 = 1000;

fn default_chunk_size() -> i64 {
    DEFAULT_CHUNK_SIZE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFieldCryptoMigrationParams {
    pub schema: FieldCryptoMigrationSchema,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: i64,
}

pub type PlanFieldCryptoMigrationResponse = FieldCryptoMigrationRunRecord;

/// Rows with a NULL `requested_at` are never visited by the keyset walk, so
/// they are not counted either.
async fn count_rows(
    target: &dyn SqlClient,
    schema: &FieldCryptoMigrationSchema,
) -> Result<i64, CommonError> {
    let d = target.dialect();
    let sql = format!(
        "SELECT COUNT(*) AS total FROM {} WHERE {} IS NOT NULL",
        d.quote_identifier(&schema.table_name)?,
        d.quote_identifier(&schema.requested_at_column)?,
    );
    let result = target.query(&sql, &[]).await?;
    match result.rows.first() {
        Some(row) => row.require_i64("total"),
        None => Ok(0),
    }
}

/// Creates the run record for backfilling `schema.table_name`, or returns the
/// existing one when the same table, chunk size and schema were planned before.
pub async fn plan_field_crypto_migration<R>(
    repo: &R,
    target: &dyn SqlClient,
    crypto: &FieldCrypto,
    params: PlanFieldCryptoMigrationParams,
) -> Result<PlanFieldCryptoMigrationResponse, CommonError>
where
    R: FieldCryptoMigrationRepositoryLike + ?Sized,
{
    let PlanFieldCryptoMigrationParams { schema, chunk_size } = params;
    if chunk_size <= 0 {
        return Err(CommonError::InvalidRequest {
            msg: format!("chunk_size must be positive, got {chunk_size}"),
            source: None,
        });
    }
    validate_migration_schema(&schema, crypto, target.dialect())?;

    let fingerprint = schema_fingerprint(&schema, crypto);
    let plan_id = migration_plan_id(&schema.table_name, chunk_size, &fingerprint);

    repo.ensure_schema().await?;
    if let Some(existing) = repo.get_run(&plan_id).await? {
        info!(
            plan_id = %plan_id,
            status = existing.status.as_str(),
            "field crypto migration already planned"
        );
        return Ok(existing);
    }

    let total_rows = count_rows(target, &schema).await?;
    let total_chunks = if total_rows == 0 {
        0
    } else {
        (total_rows - 1) / chunk_size + 1
    };
    let now = WrappedChronoDateTime::now();
    let run = FieldCryptoMigrationRunRecord {
        plan_id: plan_id.clone(),
        table_name: schema.table_name.clone(),
        chunk_size,
        schema_fingerprint: fingerprint,
        status: FieldCryptoMigrationRunStatus::Planned,
        total_rows,
        total_chunks,
        processed_rows: 0,
        processed_chunks: 0,
        failed_chunks: 0,
        cursor_requested_at: None,
        cursor_message_id: None,
        last_error: None,
        created_at: now,
        updated_at: now,
    };

    if !repo.create_run_if_absent(&run).await? {
        // planned concurrently by another invocation
        if let Some(existing) = repo.get_run(&plan_id).await? {
            return Ok(existing);
        }
    }

    info!(
        plan_id = %plan_id,
        table = %run.table_name,
        total_rows,
        total_chunks,
        chunk_size,
        "field crypto migration planned"
    );
    Ok(run)
}
