mod sql;

pub use sql::{CHUNKS_TABLE, RUNS_TABLE, Repository};

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use shared::{error::CommonError, primitives::WrappedChronoDateTime};

use crate::sql::SqlValue;

/// Migration run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCryptoMigrationRunStatus {
    Planned,
    Running,
    Completed,
    Failed,
}

impl FieldCryptoMigrationRunStatus {
    /// Convert to string representation for database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldCryptoMigrationRunStatus::Planned => "planned",
            FieldCryptoMigrationRunStatus::Running => "running",
            FieldCryptoMigrationRunStatus::Completed => "completed",
            FieldCryptoMigrationRunStatus::Failed => "failed",
        }
    }
}

impl FromStr for FieldCryptoMigrationRunStatus {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(FieldCryptoMigrationRunStatus::Planned),
            "running" => Ok(FieldCryptoMigrationRunStatus::Running),
            "completed" => Ok(FieldCryptoMigrationRunStatus::Completed),
            "failed" => Ok(FieldCryptoMigrationRunStatus::Failed),
            _ => Err(CommonError::Repository {
                msg: format!("invalid run status: {s}"),
                source: None,
            }),
        }
    }
}

impl From<FieldCryptoMigrationRunStatus> for SqlValue {
    fn from(value: FieldCryptoMigrationRunStatus) -> Self {
        SqlValue::Text(value.as_str().to_string())
    }
}

/// Migration chunk status. A chunk with no record yet is implicitly pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCryptoMigrationChunkStatus {
    Processing,
    Completed,
    Failed,
}

impl FieldCryptoMigrationChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldCryptoMigrationChunkStatus::Processing => "processing",
            FieldCryptoMigrationChunkStatus::Completed => "completed",
            FieldCryptoMigrationChunkStatus::Failed => "failed",
        }
    }
}

impl FromStr for FieldCryptoMigrationChunkStatus {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(FieldCryptoMigrationChunkStatus::Processing),
            "completed" => Ok(FieldCryptoMigrationChunkStatus::Completed),
            "failed" => Ok(FieldCryptoMigrationChunkStatus::Failed),
            _ => Err(CommonError::Repository {
                msg: format!("invalid chunk status: {s}"),
                source: None,
            }),
        }
    }
}

impl From<FieldCryptoMigrationChunkStatus> for SqlValue {
    fn from(value: FieldCryptoMigrationChunkStatus) -> Self {
        SqlValue::Text(value.as_str().to_string())
    }
}

/// One row per plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCryptoMigrationRunRecord {
    pub plan_id: String,
    pub table_name: String,
    pub chunk_size: i64,
    pub schema_fingerprint: String,
    pub status: FieldCryptoMigrationRunStatus,
    pub total_rows: i64,
    pub total_chunks: i64,
    pub processed_rows: i64,
    pub processed_chunks: i64,
    pub failed_chunks: i64,
    /// Keyset cursor: last processed `(requested_at, message_id)`.
    pub cursor_requested_at: Option<SqlValue>,
    pub cursor_message_id: Option<SqlValue>,
    pub last_error: Option<String>,
    pub created_at: WrappedChronoDateTime,
    pub updated_at: WrappedChronoDateTime,
}

/// One row per attempted chunk, keyed by `(plan_id, chunk_no)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCryptoMigrationChunkRecord {
    pub plan_id: String,
    pub chunk_no: i64,
    pub start_requested_at: Option<SqlValue>,
    pub start_message_id: Option<SqlValue>,
    pub end_requested_at: Option<SqlValue>,
    pub end_message_id: Option<SqlValue>,
    /// Exact row ids the chunk covers; retry re-reads these rather than the cursor.
    pub row_ids: Vec<SqlValue>,
    pub row_count: i64,
    pub attempts: i64,
    pub status: FieldCryptoMigrationChunkStatus,
    pub last_error: Option<String>,
    pub created_at: WrappedChronoDateTime,
    pub updated_at: WrappedChronoDateTime,
}

#[async_trait::async_trait]
pub trait FieldCryptoMigrationRepositoryLike: Send + Sync {
    /// Creates the run and chunk tables if they do not exist.
    async fn ensure_schema(&self) -> Result<(), CommonError>;

    /// Inserts `run` unless a run with the same plan id exists. Returns whether
    /// a row was written.
    async fn create_run_if_absent(
        &self,
        run: &FieldCryptoMigrationRunRecord,
    ) -> Result<bool, CommonError>;

    async fn get_run(
        &self,
        plan_id: &str,
    ) -> Result<Option<FieldCryptoMigrationRunRecord>, CommonError>;

    async fn upsert_run(&self, run: &FieldCryptoMigrationRunRecord) -> Result<(), CommonError>;

    async fn upsert_chunk(&self, chunk: &FieldCryptoMigrationChunkRecord)
    -> Result<(), CommonError>;

    async fn get_chunk(
        &self,
        plan_id: &str,
        chunk_no: i64,
    ) -> Result<Option<FieldCryptoMigrationChunkRecord>, CommonError>;

    /// Next unused chunk number for the plan, starting at 1.
    async fn next_chunk_no(&self, plan_id: &str) -> Result<i64, CommonError>;

    /// Chunks in `status` ordered by chunk number.
    async fn list_chunks_by_status(
        &self,
        plan_id: &str,
        status: FieldCryptoMigrationChunkStatus,
        limit: i64,
    ) -> Result<Vec<FieldCryptoMigrationChunkRecord>, CommonError>;

    async fn count_chunks_by_status(
        &self,
        plan_id: &str,
    ) -> Result<BTreeMap<FieldCryptoMigrationChunkStatus, i64>, CommonError>;
}
