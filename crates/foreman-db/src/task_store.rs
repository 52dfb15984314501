use crate::error::DbError;
use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use foreman_core::task::{Task, TaskId};
use redb::{Database, ReadableTable, TableDefinition};

/// Tasks table: i64 task ID -> JSON-serialized Task.
pub const TASKS_TABLE: TableDefinition<i64, &str> = TableDefinition::new("tasks");

const NEXT_TASK_ID: &str = "next_task_id";

/// Durable task records with optimistic concurrency.
///
/// Every write re-stamps `db_modified`; `put_tasks` rejects the whole
/// batch with [`DbError::ConcurrentUpdate`] if any record's stamp no
/// longer matches the stored copy.
pub struct TaskStore<'a> {
    db: &'a Database,
}

impl<'a> TaskStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Allocate an id for a task without writing it. Ids allocated for
    /// submissions that later fail are simply never used; the store
    /// tolerates the gap.
    pub fn assign_id(&self, task: &mut Task) -> Result<()> {
        if task.id.0 != 0 {
            bail!("task already has id {}", task.id);
        }
        task.id = TaskId(crate::next_counter(self.db, NEXT_TASK_ID)?);
        Ok(())
    }

    /// Write a batch of tasks atomically (single transaction).
    ///
    /// Each task must have an assigned id and must carry the
    /// `db_modified` stamp of the copy it was derived from. On success
    /// the tasks' stamps are refreshed in place.
    pub fn put_tasks(&self, tasks: &mut [Task]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TASKS_TABLE)?;
            for task in tasks.iter_mut() {
                if task.id.0 <= 0 {
                    bail!("task {} has no assigned id", task.key);
                }
                if let Some(guard) = table.get(task.id.0)? {
                    let stored: Task = serde_json::from_str(guard.value())?;
                    if stored.db_modified != task.db_modified {
                        // Drop the txn without committing; nothing from
                        // this batch lands.
                        return Err(DbError::ConcurrentUpdate)
                            .context(format!("task {} modified since read", task.id));
                    }
                }
                let mut stamp = Utc::now();
                if stamp <= task.db_modified {
                    stamp = task.db_modified + Duration::microseconds(1);
                }
                task.db_modified = stamp;
                let json = serde_json::to_string(task)?;
                table.insert(task.id.0, json.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Write a single task.
    pub fn put_task(&self, task: &mut Task) -> Result<()> {
        self.put_tasks(std::slice::from_mut(task))
    }

    pub fn get(&self, id: TaskId) -> Result<Option<Task>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TASKS_TABLE)?;
        match table.get(id.0)? {
            Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
            None => Ok(None),
        }
    }

    /// All stored tasks, in id order.
    pub fn list(&self) -> Result<Vec<Task>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TASKS_TABLE)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            result.push(serde_json::from_str(value.value())?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use foreman_core::task::{TaskKey, TaskStatus};

    fn test_db() -> Database {
        let dir = tempfile::tempdir().unwrap();
        crate::open_db(&dir.path().join("test.redb")).unwrap()
    }

    fn task(name: &str) -> Task {
        Task::new(
            TaskKey::new("https://example.com/repo.git", "abc123", name),
            Utc::now(),
        )
    }

    #[test]
    fn assign_id_increments() {
        let db = test_db();
        let store = TaskStore::new(&db);
        let mut t1 = task("Build");
        let mut t2 = task("Test");
        store.assign_id(&mut t1).unwrap();
        store.assign_id(&mut t2).unwrap();
        assert_eq!(t1.id, TaskId(1));
        assert_eq!(t2.id, TaskId(2));
        assert!(store.assign_id(&mut t1).is_err());
    }

    #[test]
    fn put_and_get_roundtrip() {
        let db = test_db();
        let store = TaskStore::new(&db);
        let mut t = task("Build");
        store.assign_id(&mut t).unwrap();
        t.commits = vec!["abc123".into()];
        store.put_task(&mut t).unwrap();

        let fetched = store.get(t.id).unwrap().unwrap();
        assert_eq!(fetched.key, t.key);
        assert_eq!(fetched.commits, t.commits);
        assert_eq!(fetched.db_modified, t.db_modified);
    }

    #[test]
    fn put_rejects_unassigned_id() {
        let db = test_db();
        let store = TaskStore::new(&db);
        let mut t = task("Build");
        assert!(store.put_task(&mut t).is_err());
    }

    #[test]
    fn concurrent_update_detected() {
        let db = test_db();
        let store = TaskStore::new(&db);
        let mut t = task("Build");
        store.assign_id(&mut t).unwrap();
        store.put_task(&mut t).unwrap();

        // Two readers pick up the same copy.
        let mut reader_a = store.get(t.id).unwrap().unwrap();
        let mut reader_b = store.get(t.id).unwrap().unwrap();

        reader_a.status = TaskStatus::Running;
        store.put_task(&mut reader_a).unwrap();

        reader_b.status = TaskStatus::Mishap;
        let err = store.put_task(&mut reader_b).unwrap_err();
        assert!(DbError::is_concurrent_update(&err));

        // The losing write left no trace.
        let stored = store.get(t.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
    }

    #[test]
    fn batch_is_atomic_on_conflict() {
        let db = test_db();
        let store = TaskStore::new(&db);
        let mut t1 = task("Build");
        let mut t2 = task("Test");
        store.assign_id(&mut t1).unwrap();
        store.assign_id(&mut t2).unwrap();
        let mut batch = [t1, t2];
        store.put_tasks(&mut batch).unwrap();
        let [mut t1, mut t2] = batch;

        // Refresh t1's stamp behind the batch's back.
        let mut fresh = store.get(t1.id).unwrap().unwrap();
        store.put_task(&mut fresh).unwrap();

        // The batch writes t2 first, then conflicts on t1 — but nothing
        // may land.
        t2.status = TaskStatus::Success;
        t1.status = TaskStatus::Success;
        let err = store.put_tasks(&mut [t2.clone(), t1]).unwrap_err();
        assert!(DbError::is_concurrent_update(&err));
        let stored_t2 = store.get(t2.id).unwrap().unwrap();
        assert_eq!(stored_t2.status, TaskStatus::Pending);
    }

    #[test]
    fn stamps_are_strictly_increasing() {
        let db = test_db();
        let store = TaskStore::new(&db);
        let mut t = task("Build");
        store.assign_id(&mut t).unwrap();
        store.put_task(&mut t).unwrap();
        let first = t.db_modified;
        store.put_task(&mut t).unwrap();
        assert!(t.db_modified > first);
    }

    #[test]
    fn list_returns_all_in_id_order() {
        let db = test_db();
        let store = TaskStore::new(&db);
        for name in ["Build", "Test", "Perf"] {
            let mut t = task(name);
            store.assign_id(&mut t).unwrap();
            store.put_task(&mut t).unwrap();
        }
        let all = store.list().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].key.name, "Build");
        assert_eq!(all[2].key.name, "Perf");
    }
}
