//! Client seam for the content-addressed input staging service.

use anyhow::Result;
use async_trait::async_trait;
use foreman_core::spec::RepoState;

/// One task's staging request: the isolate recipe plus the output digests
/// of its dependency tasks, which are embedded into the input.
#[derive(Debug, Clone)]
pub struct IsolateSpec {
    pub task_name: String,
    pub isolate: String,
    pub dependency_hashes: Vec<String>,
}

/// Stages task inputs at a RepoState and returns one digest per request.
///
/// An implementation materializes a temporary checkout of the RepoState,
/// stages all requests against it in one call, and must release the
/// checkout on every exit path. Callers verify that the returned digest
/// count equals the request count.
#[async_trait]
pub trait InputStager: Send + Sync {
    async fn stage(&self, repo_state: &RepoState, specs: &[IsolateSpec]) -> Result<Vec<String>>;

    /// Server URL embedded in executor submissions so bots know where to
    /// fetch staged inputs from.
    fn server_url(&self) -> String;
}
