use std::ops::Deref;
use std::path::{Path, PathBuf};

use crate::error::CommonError;
use libsql::params::IntoParams;
use libsql::{Database, Rows};
use tracing::info;
use url::Url;

#[derive(Debug, Clone)]
pub struct Connection(pub libsql::Connection);

impl Deref for Connection {
    type Target = libsql::Connection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[macro_export]
macro_rules! execute_with_retry {
    ($operation:expr) => {
        execute_with_retry!($operation, 10)
    };
    ($operation:expr, $max_retries:expr) => {{
        async {
            let mut _retries = 0u32;
            let _max_retries: u32 = $max_retries;

            loop {
                match $operation.await {
                    Ok(result) => break Ok(result),
                    Err(err) => {
                        let err_str = err.to_string();
                        if err_str.contains("database is locked") || err_str.contains("SQLITE_BUSY")
                        {
                            tracing::warn!("Database is locked, retrying... {:?}", err);
                            if _retries >= _max_retries {
                                break Err(err);
                            }

                            _retries += 1;

                            // Very low delay with exponential backoff
                            let delay_us = 10_000 * (1 << _retries.min(6));
                            tokio::time::sleep(std::time::Duration::from_micros(delay_us)).await;
                        } else {
                            tracing::error!("Error executing with retry: {:?}", err);
                            break Err(err);
                        }
                    }
                }
            }
        }
        .await
    }};
}

impl Connection {
    /// Execute sql query provided some type that implements [`IntoParams`] returning
    /// on success the number of rows that were changed.
    pub async fn execute(&self, sql: &str, params: impl IntoParams) -> libsql::Result<u64> {
        tracing::trace!("executing `{}`", sql);
        let params = params.into_params()?;
        execute_with_retry!(self.0.execute(sql, params.clone()), 10)
    }

    /// Execute a batch set of statements.
    pub async fn execute_batch(&self, sql: &str) -> libsql::Result<()> {
        tracing::trace!("executing batch `{}`", sql);
        execute_with_retry!(self.0.execute_batch(sql), 10).map(|_| ())
    }

    /// Execute sql query provided some type that implements [`IntoParams`] returning
    /// on success the [`Rows`].
    pub async fn query(&self, sql: &str, params: impl IntoParams) -> libsql::Result<Rows> {
        tracing::trace!("querying `{}`", sql);
        let params = params.into_params()?;
        execute_with_retry!(self.0.query(sql, params.clone()), 10)
    }
}

pub struct LocalConnectionParams {
    pub path_to_db_file: PathBuf,
}

pub enum ConnectionType {
    Local(LocalConnectionParams),
}

fn get_libsql_path(url: &Url) -> String {
    let is_relative = url.as_str().starts_with("libsql://./");
    let host = url.host_str().unwrap_or_default();

    if is_relative {
        format!(".{}", url.path())
    } else if host.is_empty() {
        url.path().to_string()
    } else {
        // `libsql://relative/dir/file.db` parses the first segment as the host
        format!("{host}{}", url.path())
    }
}

impl TryFrom<Url> for ConnectionType {
    type Error = CommonError;
    fn try_from(url: Url) -> Result<Self, Self::Error> {
        if url.scheme() != "libsql" {
            let scheme = url.scheme();
            return Err(CommonError::InvalidRequest {
                msg: format!("invalid scheme: {scheme}"),
                source: None,
            });
        }

        let mode = match url
            .query_pairs()
            .find(|(key, _)| key == "mode")
            .map(|(_, value)| value.to_string())
        {
            Some(mode) => mode,
            None => {
                return Err(CommonError::InvalidRequest {
                    msg: "missing mode query parameter".to_string(),
                    source: None,
                });
            }
        };

        match mode.as_str() {
            "local" => Ok(ConnectionType::Local(LocalConnectionParams {
                path_to_db_file: PathBuf::from(get_libsql_path(&url)),
            })),
            _ => Err(CommonError::InvalidRequest {
                msg: format!("unsupported connection mode: {mode}"),
                source: None,
            }),
        }
    }
}

pub fn construct_db_connection_string(
    connection_type: ConnectionType,
) -> Result<String, CommonError> {
    match connection_type {
        ConnectionType::Local(params) => {
            let path = params.path_to_db_file.to_string_lossy();
            let mut conn_url = url::Url::parse(&format!("libsql://{path}"))?;
            conn_url.query_pairs_mut().append_pair("mode", "local");
            Ok(conn_url.to_string())
        }
    }
}

pub async fn establish_db_connection(
    connection_string: &Url,
) -> Result<(Database, Connection), CommonError> {
    let connection_type = ConnectionType::try_from(connection_string.clone())?;

    fn create_db_file_parent_dir(parent_path: Option<&Path>) -> Result<(), CommonError> {
        if let Some(path) = parent_path {
            if !path.as_os_str().is_empty() && !std::fs::exists(path)? {
                std::fs::create_dir_all(path)?;
            }
        }
        Ok(())
    }

    let (db, conn) = match connection_type {
        ConnectionType::Local(params) => {
            info!(
                "establishing local connection to {}",
                params.path_to_db_file.display()
            );
            create_db_file_parent_dir(params.path_to_db_file.parent())?;
            let db = libsql::Builder::new_local(params.path_to_db_file.clone())
                .build()
                .await?;
            let conn = db.connect()?;
            (db, conn)
        }
    };

    Ok((db, Connection(conn)))
}
