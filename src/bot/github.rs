use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::event::RepositoryRef;
use super::store::{
    BranchInfo, CommitInfo, FileMode, NewPullRequest, PullRequestHandle, StoreResult, TreeChange, VersionedStore,
};
use crate::errors::StoreError;

const USER_AGENT: &str = "webporizer";
const API_VERSION: &str = "2022-11-28";

/// Which remote call failed; decides how a 422 is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateBranch,
    UpdateRef,
    DeleteBranch,
    GetBranch,
    GetCommit,
    CreateBlob,
    CreateTree,
    CreateCommit,
    CreatePullRequest,
    CreateComment,
    GetUser,
}

/// Map a non-success GitHub response to a `StoreError`.
///
/// GitHub answers most semantic failures with 422 and a message, so the
/// operation and message together select the variant.
pub fn classify_error(op: Operation, status: u16, message: &str, reference: &str) -> StoreError {
    let lower = message.to_lowercase();
    match (op, status) {
        (Operation::CreateBranch, 422) if lower.contains("already exists") => StoreError::RefConflict {
            reference: reference.to_string(),
        },
        (Operation::CreateBranch, 422) if lower.contains("object does not exist") => {
            StoreError::NotFound(format!("{}: {}", reference, message))
        }
        (Operation::UpdateRef, 422) if lower.contains("fast forward") => StoreError::StaleRef {
            reference: reference.to_string(),
            message: message.to_string(),
        },
        (Operation::UpdateRef | Operation::DeleteBranch, 422) if lower.contains("does not exist") => {
            StoreError::NotFound(format!("{}: {}", reference, message))
        }
        (Operation::CreateCommit | Operation::CreateTree, 422) => StoreError::InvalidTree(message.to_string()),
        (Operation::CreatePullRequest, 422) => StoreError::Validation(message.to_string()),
        (_, 404) => StoreError::NotFound(format!("{}: {}", reference, message)),
        _ => StoreError::Api {
            status,
            message: message.to_string(),
        },
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct RefResponse {
    #[serde(rename = "ref")]
    git_ref: String,
    object: ShaObject,
}

#[derive(Deserialize)]
struct ShaObject {
    sha: String,
}

#[derive(Deserialize)]
struct CommitResponse {
    sha: String,
    tree: ShaObject,
}

#[derive(Deserialize)]
struct UserResponse {
    login: String,
}

#[derive(Serialize)]
struct TreeEntry<'a> {
    path: &'a str,
    mode: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    /// `null` removes the path from the base tree
    sha: Option<&'a str>,
}

fn tree_entries(changes: &[TreeChange]) -> Vec<TreeEntry<'_>> {
    changes
        .iter()
        .map(|change| match change {
            TreeChange::Upsert { path, blob_sha, mode } => TreeEntry {
                path,
                mode: mode.as_str(),
                kind: "blob",
                sha: Some(blob_sha),
            },
            TreeChange::Delete { path } => TreeEntry {
                path,
                mode: FileMode::Regular.as_str(),
                kind: "blob",
                sha: None,
            },
        })
        .collect()
}

/// GitHub REST v3 client implementing `VersionedStore`.
#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
    timeout: Duration,
}

impl GitHubClient {
    pub fn new(api_url: &str, token: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("Failed to build GitHub HTTP client")?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            timeout,
        })
    }

    /// Login of the authenticated identity.
    pub async fn whoami(&self) -> StoreResult<String> {
        let url = format!("{}/user", self.api_url);
        let resp = self.send(self.http.get(&url), Operation::GetUser, "user").await?;
        let user: UserResponse = self.decode(resp).await?;
        Ok(user.login)
    }

    fn repo_url(&self, repo: &RepositoryRef, path: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.api_url, repo.owner, repo.name, path)
    }

    fn map_transport(&self, e: reqwest::Error) -> StoreError {
        if e.is_timeout() {
            StoreError::Timeout { after: self.timeout }
        } else {
            StoreError::Transport(e.to_string())
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        op: Operation,
        reference: &str,
    ) -> StoreResult<reqwest::Response> {
        let resp = request
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp
            .json::<ErrorBody>()
            .await
            .map(|b| b.message)
            .unwrap_or_else(|_| status.canonical_reason().unwrap_or("unknown error").to_string());
        let err = classify_error(op, status.as_u16(), &message, reference);
        tracing::debug!(
            ?op,
            status = status.as_u16(),
            classified = ?err.status(),
            %message,
            reference,
            "GitHub call failed"
        );
        Err(err)
    }

    async fn decode<T: serde::de::DeserializeOwned>(&self, resp: reqwest::Response) -> StoreResult<T> {
        resp.json::<T>().await.map_err(|e| StoreError::Api {
            status: 200,
            message: format!("unexpected response body: {}", e),
        })
    }
}

#[async_trait]
impl VersionedStore for GitHubClient {
    async fn create_branch(&self, repo: &RepositoryRef, name: &str, from_sha: &str) -> StoreResult<BranchInfo> {
        let reference = format!("refs/heads/{}", name);
        let resp = self
            .send(
                self.http
                    .post(self.repo_url(repo, "git/refs"))
                    .json(&json!({ "ref": reference, "sha": from_sha })),
                Operation::CreateBranch,
                &reference,
            )
            .await?;
        let created: RefResponse = self.decode(resp).await?;
        Ok(BranchInfo {
            name: created.git_ref.trim_start_matches("refs/heads/").to_string(),
            sha: created.object.sha,
        })
    }

    async fn update_ref(&self, repo: &RepositoryRef, name: &str, sha: &str) -> StoreResult<()> {
        let reference = format!("refs/heads/{}", name);
        self.send(
            self.http
                .patch(self.repo_url(repo, &format!("git/{}", reference)))
                .json(&json!({ "sha": sha, "force": false })),
            Operation::UpdateRef,
            &reference,
        )
        .await?;
        Ok(())
    }

    async fn delete_branch(&self, repo: &RepositoryRef, name: &str) -> StoreResult<()> {
        let reference = format!("refs/heads/{}", name);
        self.send(
            self.http.delete(self.repo_url(repo, &format!("git/{}", reference))),
            Operation::DeleteBranch,
            &reference,
        )
        .await?;
        Ok(())
    }

    async fn get_branch_info(&self, repo: &RepositoryRef, name: &str) -> StoreResult<BranchInfo> {
        let reference = format!("heads/{}", name);
        let resp = self
            .send(
                self.http.get(self.repo_url(repo, &format!("git/ref/{}", reference))),
                Operation::GetBranch,
                &reference,
            )
            .await?;
        let found: RefResponse = self.decode(resp).await?;
        Ok(BranchInfo {
            name: name.to_string(),
            sha: found.object.sha,
        })
    }

    async fn get_commit(&self, repo: &RepositoryRef, sha: &str) -> StoreResult<CommitInfo> {
        let resp = self
            .send(
                self.http.get(self.repo_url(repo, &format!("git/commits/{}", sha))),
                Operation::GetCommit,
                sha,
            )
            .await?;
        let commit: CommitResponse = self.decode(resp).await?;
        Ok(CommitInfo {
            sha: commit.sha,
            tree_sha: commit.tree.sha,
        })
    }

    async fn create_blob(&self, repo: &RepositoryRef, content: &[u8]) -> StoreResult<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let resp = self
            .send(
                self.http
                    .post(self.repo_url(repo, "git/blobs"))
                    .json(&json!({ "content": encoded, "encoding": "base64" })),
                Operation::CreateBlob,
                "blob",
            )
            .await?;
        let blob: ShaObject = self.decode(resp).await?;
        Ok(blob.sha)
    }

    async fn create_tree(&self, repo: &RepositoryRef, base_tree: &str, changes: &[TreeChange]) -> StoreResult<String> {
        let entries = tree_entries(changes);
        let resp = self
            .send(
                self.http
                    .post(self.repo_url(repo, "git/trees"))
                    .json(&json!({ "base_tree": base_tree, "tree": entries })),
                Operation::CreateTree,
                base_tree,
            )
            .await?;
        let tree: ShaObject = self.decode(resp).await?;
        Ok(tree.sha)
    }

    async fn create_commit(
        &self,
        repo: &RepositoryRef,
        tree_sha: &str,
        parent_sha: &str,
        message: &str,
    ) -> StoreResult<CommitInfo> {
        let resp = self
            .send(
                self.http.post(self.repo_url(repo, "git/commits")).json(&json!({
                    "message": message,
                    "tree": tree_sha,
                    "parents": [parent_sha],
                })),
                Operation::CreateCommit,
                tree_sha,
            )
            .await?;
        let commit: CommitResponse = self.decode(resp).await?;
        Ok(CommitInfo {
            sha: commit.sha,
            tree_sha: commit.tree.sha,
        })
    }

    async fn create_pull_request(&self, repo: &RepositoryRef, pr: &NewPullRequest) -> StoreResult<PullRequestHandle> {
        let resp = self
            .send(
                self.http.post(self.repo_url(repo, "pulls")).json(&json!({
                    "title": pr.title,
                    "body": pr.body,
                    "head": pr.head,
                    "base": pr.base,
                })),
                Operation::CreatePullRequest,
                &pr.head,
            )
            .await?;
        self.decode(resp).await
    }

    async fn create_issue_comment(&self, repo: &RepositoryRef, issue_number: u64, body: &str) -> StoreResult<()> {
        self.send(
            self.http
                .post(self.repo_url(repo, &format!("issues/{}/comments", issue_number)))
                .json(&json!({ "body": body })),
            Operation::CreateComment,
            &format!("#{}", issue_number),
        )
        .await?;
        Ok(())
    }
}
