use anyhow::{Result, bail};
use chrono::{Duration, Utc};
use foreman_core::job::{Job, JobId};
use redb::{Database, ReadableTable, TableDefinition};

/// Jobs table: i64 job ID -> JSON-serialized Job.
pub const JOBS_TABLE: TableDefinition<i64, &str> = TableDefinition::new("jobs");

const NEXT_JOB_ID: &str = "next_job_id";

/// Durable job records.
pub struct JobStore<'a> {
    db: &'a Database,
}

impl<'a> JobStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a new job, assigning it an auto-incremented id.
    pub fn insert(&self, mut job: Job) -> Result<Job> {
        if job.id.0 != 0 {
            bail!("job already has id {}", job.id);
        }
        job.id = JobId(crate::next_counter(self.db, NEXT_JOB_ID)?);
        self.put_jobs(std::slice::from_mut(&mut job))?;
        Ok(job)
    }

    /// Write a batch of jobs atomically, re-stamping `db_modified`.
    pub fn put_jobs(&self, jobs: &mut [Job]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(JOBS_TABLE)?;
            for job in jobs.iter_mut() {
                if job.id.0 <= 0 {
                    bail!("job {} has no assigned id", job.name);
                }
                let mut stamp = Utc::now();
                if stamp <= job.db_modified {
                    stamp = job.db_modified + Duration::microseconds(1);
                }
                job.db_modified = stamp;
                let json = serde_json::to_string(job)?;
                table.insert(job.id.0, json.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn put_job(&self, job: &mut Job) -> Result<()> {
        self.put_jobs(std::slice::from_mut(job))
    }

    pub fn get(&self, id: JobId) -> Result<Option<Job>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(JOBS_TABLE)?;
        match table.get(id.0)? {
            Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
            None => Ok(None),
        }
    }

    /// All stored jobs, in id order.
    pub fn list(&self) -> Result<Vec<Job>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(JOBS_TABLE)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            result.push(serde_json::from_str(value.value())?);
        }
        Ok(result)
    }
}
