//! Durable task/job store (redb) and the in-memory cache views the
//! scheduler reads during a tick.

pub mod error;
pub mod job_cache;
pub mod job_store;
pub mod task_cache;
pub mod task_store;

use anyhow::Result;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;

/// Number of times a store write is retried on a concurrent update
/// before the operation is abandoned.
pub const NUM_RETRIES: usize = 5;

/// Auto-increment counter table: counter name -> next value.
pub const COUNTER_TABLE: TableDefinition<&str, i64> = TableDefinition::new("counters");

/// Open (or create) the scheduler database at the given path.
pub fn open_db(path: &Path) -> Result<Database> {
    let db = Database::create(path)?;
    // Ensure all tables exist by doing a write transaction
    let write_txn = db.begin_write()?;
    {
        let _tasks = write_txn.open_table(task_store::TASKS_TABLE)?;
        let _jobs = write_txn.open_table(job_store::JOBS_TABLE)?;
        let _counters = write_txn.open_table(COUNTER_TABLE)?;
    }
    write_txn.commit()?;
    Ok(db)
}

/// Allocate the next value of a named counter within its own write
/// transaction.
pub(crate) fn next_counter(db: &Database, name: &str) -> Result<i64> {
    let write_txn = db.begin_write()?;
    let value = {
        let mut counters = write_txn.open_table(COUNTER_TABLE)?;
        let next = counters.get(name)?.map(|v| v.value()).unwrap_or(1);
        counters.insert(name, next + 1)?;
        next
    };
    write_txn.commit()?;
    Ok(value)
}
