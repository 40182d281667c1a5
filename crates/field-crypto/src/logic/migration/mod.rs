// Chunked, resumable backfill of plaintext columns into their protected
// layout. Planning is idempotent per (table, chunk size, schema fingerprint);
// every invocation of apply/retry loads persisted state, does bounded work and
// writes its progress back.

mod executor;
mod planner;
mod schema;

pub use executor::*;
pub use planner::*;
pub use schema::*;

use std::collections::BTreeMap;

use serde::Serialize;
use shared::error::CommonError;

use crate::logic::field_crypto::FieldCrypto;
use crate::repository::{
    FieldCryptoMigrationChunkStatus, FieldCryptoMigrationRepositoryLike,
    FieldCryptoMigrationRunRecord,
};
use crate::sql::SqlClient;

/// Outcome of one apply or retry invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldCryptoMigrationProgress {
    pub run: FieldCryptoMigrationRunRecord,
    pub chunks_attempted: u32,
    pub chunks_succeeded: u32,
    pub chunks_failed: u32,
}

impl FieldCryptoMigrationProgress {
    fn new(run: FieldCryptoMigrationRunRecord) -> Self {
        Self {
            run,
            chunks_attempted: 0,
            chunks_succeeded: 0,
            chunks_failed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldCryptoMigrationStatus {
    pub run: FieldCryptoMigrationRunRecord,
    pub chunk_counts: BTreeMap<FieldCryptoMigrationChunkStatus, i64>,
}

pub type StatusFieldCryptoMigrationResponse = FieldCryptoMigrationStatus;

/// Loads a run and checks it was planned for `schema` as it is now.
async fn load_run_for_schema<R>(
    repo: &R,
    target: &dyn SqlClient,
    crypto: &FieldCrypto,
    plan_id: &str,
    schema: &FieldCryptoMigrationSchema,
) -> Result<FieldCryptoMigrationRunRecord, CommonError>
where
    R: FieldCryptoMigrationRepositoryLike + ?Sized,
{
    repo.ensure_schema().await?;
    let run = load_run(repo, plan_id).await?;

    validate_migration_schema(schema, crypto, target.dialect())?;
    if run.table_name != schema.table_name {
        return Err(CommonError::InvalidRequest {
            msg: format!(
                "plan {plan_id} targets table {} but schema names {}",
                run.table_name, schema.table_name
            ),
            source: None,
        });
    }
    if schema_fingerprint(schema, crypto) != run.schema_fingerprint {
        return Err(CommonError::InvalidRequest {
            msg: format!(
                "schema for table {} changed since plan {plan_id} was made; plan again",
                run.table_name
            ),
            source: None,
        });
    }
    Ok(run)
}

async fn load_run<R>(repo: &R, plan_id: &str) -> Result<FieldCryptoMigrationRunRecord, CommonError>
where
    R: FieldCryptoMigrationRepositoryLike + ?Sized,
{
    repo.get_run(plan_id)
        .await?
        .ok_or_else(|| CommonError::NotFound {
            msg: "field crypto migration plan not found".to_string(),
            lookup_id: plan_id.to_string(),
            source: None,
        })
}

/// Run record plus chunk counts per status.
pub async fn status_field_crypto_migration<R>(
    repo: &R,
    plan_id: &str,
) -> Result<StatusFieldCryptoMigrationResponse, CommonError>
where
    R: FieldCryptoMigrationRepositoryLike + ?Sized,
{
    repo.ensure_schema().await?;
    let run = load_run(repo, plan_id).await?;
    let chunk_counts = repo.count_chunks_by_status(plan_id).await?;
    Ok(FieldCryptoMigrationStatus { run, chunk_counts })
}
