use thiserror::Error;

/// Store errors that callers need to tell apart. Everything else travels
/// as a plain `anyhow::Error`.
#[derive(Debug, Error)]
pub enum DbError {
    /// The record's `db_modified` stamp didn't match the stored copy.
    /// The write was rejected wholesale; reload and retry.
    #[error("concurrent update")]
    ConcurrentUpdate,

    #[error("no such record: {0}")]
    NotFound(String),
}

impl DbError {
    /// Whether an error chain bottoms out in a concurrent-update
    /// rejection. Callers retry the whole group on these.
    pub fn is_concurrent_update(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<DbError>(), Some(DbError::ConcurrentUpdate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn detects_concurrent_update_through_context() {
        let err: anyhow::Error = anyhow::Error::from(DbError::ConcurrentUpdate)
            .context("failed to persist task group");
        assert!(DbError::is_concurrent_update(&err));

        let other = anyhow::anyhow!("network down");
        assert!(!DbError::is_concurrent_update(&other));
    }
}
