use crate::error::CommonError;
use crate::libsql::Connection;

/// Open a private in-memory database and run each schema script against it.
pub async fn setup_in_memory_database(
    schema: &[&str],
) -> Result<(libsql::Database, Connection), CommonError> {
    let db = libsql::Builder::new_local(":memory:").build().await?;
    let conn = Connection(db.connect()?);

    // Enable foreign key constraints
    conn.execute("PRAGMA foreign_keys = ON", ()).await?;

    for script in schema {
        conn.execute_batch(script).await?;
    }
    Ok((db, conn))
}
