//! Code supporting the target store and the `init-schema`/`clear` sub commands.

use std::time::Duration;

use rusqlite::Connection;

use crate::err::LoadError;

pub mod schema;

/// Open the store at `path` with foreign key enforcement.
///
/// Without `busy_timeout`, waiting on a locked store uses the backend default.
pub fn open(path: &str, busy_timeout: Option<Duration>) -> Result<Connection, LoadError> {
    let unavailable = |source| LoadError::StoreUnavailable {
        path: path.to_string(),
        source,
    };
    let conn = Connection::open(path).map_err(unavailable)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(unavailable)?;
    if let Some(timeout) = busy_timeout {
        conn.busy_timeout(timeout).map_err(unavailable)?;
    }
    Ok(conn)
}

/// Command line arguments shared by the store maintenance sub commands.
#[derive(Debug, clap::Parser)]
pub struct Args {
    /// Path to the store database file.
    #[arg(long)]
    pub path_db: String,
}

/// Main entry point for `init-schema` sub command.
pub fn run_init_schema(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let conn = open(&args.path_db, None)?;
    schema::ensure_schema(&conn)
        .map_err(|e| anyhow::anyhow!("problem creating schema: {}", e))?;
    tracing::info!("schema ready in {}", &args.path_db);
    Ok(())
}

/// Main entry point for `clear` sub command.
pub fn run_clear(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let mut conn = open(&args.path_db, None)?;
    schema::clear(&mut conn).map_err(|e| anyhow::anyhow!("problem clearing tables: {}", e))?;
    tracing::info!("cleared all tables in {}", &args.path_db);
    Ok(())
}
