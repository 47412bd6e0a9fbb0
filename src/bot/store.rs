//! The versioned-store capability set the pipeline mutates.
//!
//! Real implementation: `GitHubClient`. Test double: `fakes::MemoryStore`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::event::RepositoryRef;
use crate::errors::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

/// A commit and the tree it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub tree_sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub sha: String,
}

/// Git file mode of a blob entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FileMode {
    #[default]
    Regular,
    Executable,
}

impl FileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::Regular => "100644",
            FileMode::Executable => "100755",
        }
    }
}

/// One path in a tree built on top of a base tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeChange {
    Upsert {
        path: String,
        blob_sha: String,
        mode: FileMode,
    },
    /// Remove the path from the base tree.
    Delete { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestHandle {
    pub number: u64,
    pub html_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPullRequest {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

/// Bound a single remote call by `limit`.
pub async fn within<T, F>(limit: Duration, call: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(StoreError::Timeout { after: limit }))
}

#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Create `refs/heads/{name}` at `from_sha`.
    async fn create_branch(&self, repo: &RepositoryRef, name: &str, from_sha: &str) -> StoreResult<BranchInfo>;

    /// Fast-forward `refs/heads/{name}` to `sha`.
    async fn update_ref(&self, repo: &RepositoryRef, name: &str, sha: &str) -> StoreResult<()>;

    async fn delete_branch(&self, repo: &RepositoryRef, name: &str) -> StoreResult<()>;

    async fn get_branch_info(&self, repo: &RepositoryRef, name: &str) -> StoreResult<BranchInfo>;

    async fn get_commit(&self, repo: &RepositoryRef, sha: &str) -> StoreResult<CommitInfo>;

    /// Upload file contents, returning the blob SHA.
    async fn create_blob(&self, repo: &RepositoryRef, content: &[u8]) -> StoreResult<String>;

    /// Create a tree from `base_tree` plus `changes`, returning the tree SHA.
    async fn create_tree(&self, repo: &RepositoryRef, base_tree: &str, changes: &[TreeChange]) -> StoreResult<String>;

    async fn create_commit(
        &self,
        repo: &RepositoryRef,
        tree_sha: &str,
        parent_sha: &str,
        message: &str,
    ) -> StoreResult<CommitInfo>;

    async fn create_pull_request(&self, repo: &RepositoryRef, pr: &NewPullRequest) -> StoreResult<PullRequestHandle>;

    async fn create_issue_comment(&self, repo: &RepositoryRef, issue_number: u64, body: &str) -> StoreResult<()>;
}
