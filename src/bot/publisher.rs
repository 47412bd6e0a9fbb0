//! Opens follow-up pull requests and posts status comments.

use std::sync::Arc;

use super::event::RepositoryRef;
use super::store::{NewPullRequest, PullRequestHandle, StoreResult, VersionedStore};
use crate::errors::StoreError;

/// Result of a best-effort comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommentOutcome {
    Posted,
    Failed(String),
}

impl CommentOutcome {
    pub fn is_posted(&self) -> bool {
        matches!(self, CommentOutcome::Posted)
    }
}

pub struct PullRequestPublisher {
    store: Arc<dyn VersionedStore>,
}

impl PullRequestPublisher {
    pub fn new(store: Arc<dyn VersionedStore>) -> Self {
        Self { store }
    }

    /// Open a pull request from `head` into `base`. Fails with `Validation`
    /// before any remote call when both name the same branch.
    pub async fn open_pull_request(
        &self,
        repo: &RepositoryRef,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> StoreResult<PullRequestHandle> {
        if head == base {
            return Err(StoreError::Validation(format!(
                "head and base are both '{}'",
                head
            )));
        }
        let request = NewPullRequest {
            head: head.to_string(),
            base: base.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        };
        let handle = self.store.create_pull_request(repo, &request).await?;
        tracing::info!(%repo, pr = handle.number, url = %handle.html_url, head, base, "opened pull request");
        Ok(handle)
    }

    /// Post a comment on an issue or pull request. Never fails the caller.
    pub async fn post_comment(&self, repo: &RepositoryRef, issue: u64, body: &str) -> CommentOutcome {
        match self.store.create_issue_comment(repo, issue, body).await {
            Ok(()) => {
                tracing::info!(%repo, pr = issue, "posted comment");
                CommentOutcome::Posted
            }
            Err(e) => {
                tracing::warn!(%repo, pr = issue, error = %e, "failed to post comment");
                CommentOutcome::Failed(e.to_string())
            }
        }
    }
}
