use std::path::Path;

use rusqlite::{Connection, TransactionBehavior};

use crate::error::CoreResult;

pub mod core_events;
pub mod daily;
pub mod migrations;
pub mod period;
pub mod sessions;

pub fn open(path: &Path) -> CoreResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut conn = Connection::open(path)?;
    init_db(&mut conn)?;
    Ok(conn)
}

pub fn init_db(conn: &mut Connection) -> CoreResult<()> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
"#,
    )?;
    migrations::run_migrations(conn)?;
    Ok(())
}

/// Runs `f` inside an IMMEDIATE transaction: the write lock is taken up front, so two
/// recomputes of the same date cannot interleave, even across processes.
pub fn write_tx<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Connection) -> CoreResult<T>,
) -> CoreResult<T> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let out = f(&tx)?;
    tx.commit()?;
    Ok(out)
}

pub(crate) fn conversion_error(col: usize) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        col,
        rusqlite::types::Type::Text,
        Box::new(std::fmt::Error),
    )
}
