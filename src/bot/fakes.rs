//! In-memory fakes for the store, checkout and converter seams.
//!
//! `MemoryStore` behaves like a tiny content-addressed git host: blobs, trees
//! and commits are keyed by SHA-256 of their content, branches are plain
//! name → SHA maps, and every call is recorded for ordering assertions.
//! Failures and delays can be injected per operation.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::checkout::Checkout;
use super::event::RepositoryRef;
use super::store::{
    BranchInfo, CommitInfo, FileMode, NewPullRequest, PullRequestHandle, StoreResult, TreeChange, VersionedStore,
};
use super::transform::{Converter, OUTPUT_EXTENSION};
use crate::errors::{ConversionError, StoreError};

/// Operations failures or delays can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateBranch,
    UpdateRef,
    DeleteBranch,
    GetCommit,
    CreateBlob,
    CreateTree,
    CreateCommit,
    CreatePullRequest,
    CreateComment,
}

/// One recorded call, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    CreateBranch { name: String, from_sha: String },
    UpdateRef { name: String, sha: String },
    DeleteBranch { name: String },
    GetBranchInfo { name: String },
    GetCommit { sha: String },
    CreateBlob,
    /// `executable` lists upserted paths with mode 100755.
    CreateTree { base_tree: String, executable: Vec<String> },
    CreateCommit { tree_sha: String, parent_sha: String },
    CreatePullRequest { head: String, base: String },
    CreateComment { issue: u64, body: String },
}

#[derive(Debug, Clone)]
struct StoredCommit {
    tree_sha: String,
    parent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RecordedPullRequest {
    pub repo: RepositoryRef,
    pub request: NewPullRequest,
    pub handle: PullRequestHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedComment {
    pub repo: RepositoryRef,
    pub issue: u64,
    pub body: String,
}

#[derive(Default)]
struct State {
    blobs: HashMap<String, Vec<u8>>,
    trees: HashMap<String, BTreeMap<String, String>>,
    commits: HashMap<String, StoredCommit>,
    branches: HashMap<(RepositoryRef, String), String>,
    pulls: Vec<RecordedPullRequest>,
    comments: Vec<RecordedComment>,
    calls: Vec<StoreCall>,
    failures: HashMap<FailPoint, StoreError>,
    delays: HashMap<FailPoint, Duration>,
}

fn digest(kind: &str, parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

fn tree_sha(entries: &BTreeMap<String, String>) -> String {
    let flat: Vec<u8> = entries
        .iter()
        .flat_map(|(path, blob)| format!("{}\0{}\n", path, blob).into_bytes())
        .collect();
    digest("tree", &[&flat])
}

/// In-memory `VersionedStore`.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a root commit containing `files` under `sha`.
    pub fn seed_commit(&self, _repo: &RepositoryRef, sha: &str, files: &[(&str, &[u8])]) {
        let mut state = self.lock();
        let mut entries = BTreeMap::new();
        for (path, content) in files {
            let blob = digest("blob", &[content]);
            state.blobs.insert(blob.clone(), content.to_vec());
            entries.insert(path.to_string(), blob);
        }
        let tree = tree_sha(&entries);
        state.trees.insert(tree.clone(), entries);
        state.commits.insert(
            sha.to_string(),
            StoredCommit {
                tree_sha: tree,
                parent: None,
            },
        );
    }

    pub fn seed_branch(&self, repo: &RepositoryRef, name: &str, sha: &str) {
        self.lock()
            .branches
            .insert((repo.clone(), name.to_string()), sha.to_string());
    }

    /// Make the next and every later call to `point` fail with `error`.
    pub fn fail_on(&self, point: FailPoint, error: StoreError) {
        self.lock().failures.insert(point, error);
    }

    /// Sleep before answering calls to `point`.
    pub fn delay_on(&self, point: FailPoint, delay: Duration) {
        self.lock().delays.insert(point, delay);
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    pub fn pull_requests(&self) -> Vec<RecordedPullRequest> {
        self.lock().pulls.clone()
    }

    pub fn comments(&self) -> Vec<RecordedComment> {
        self.lock().comments.clone()
    }

    pub fn branch_sha(&self, repo: &RepositoryRef, name: &str) -> Option<String> {
        self.lock().branches.get(&(repo.clone(), name.to_string())).cloned()
    }

    pub fn commit_tree(&self, sha: &str) -> Option<String> {
        self.lock().commits.get(sha).map(|c| c.tree_sha.clone())
    }

    pub fn commit_parent(&self, sha: &str) -> Option<String> {
        self.lock().commits.get(sha).and_then(|c| c.parent.clone())
    }

    /// Path → content for a tree.
    pub fn tree_files(&self, tree: &str) -> Option<BTreeMap<String, Vec<u8>>> {
        let state = self.lock();
        let entries = state.trees.get(tree)?;
        Some(
            entries
                .iter()
                .map(|(path, blob)| (path.clone(), state.blobs.get(blob).cloned().unwrap_or_default()))
                .collect(),
        )
    }

    /// Record the call, then apply any injected delay or failure.
    async fn enter(&self, point: FailPoint, call: StoreCall) -> StoreResult<()> {
        let delay = {
            let mut state = self.lock();
            state.calls.push(call);
            state.delays.get(&point).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.lock().failures.get(&point) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl VersionedStore for MemoryStore {
    async fn create_branch(&self, repo: &RepositoryRef, name: &str, from_sha: &str) -> StoreResult<BranchInfo> {
        self.enter(
            FailPoint::CreateBranch,
            StoreCall::CreateBranch {
                name: name.to_string(),
                from_sha: from_sha.to_string(),
            },
        )
        .await?;
        let mut state = self.lock();
        let key = (repo.clone(), name.to_string());
        if state.branches.contains_key(&key) {
            return Err(StoreError::RefConflict {
                reference: format!("refs/heads/{}", name),
            });
        }
        if !state.commits.contains_key(from_sha) {
            return Err(StoreError::NotFound(format!("commit {}", from_sha)));
        }
        state.branches.insert(key, from_sha.to_string());
        Ok(BranchInfo {
            name: name.to_string(),
            sha: from_sha.to_string(),
        })
    }

    async fn update_ref(&self, repo: &RepositoryRef, name: &str, sha: &str) -> StoreResult<()> {
        self.enter(
            FailPoint::UpdateRef,
            StoreCall::UpdateRef {
                name: name.to_string(),
                sha: sha.to_string(),
            },
        )
        .await?;
        let mut state = self.lock();
        let key = (repo.clone(), name.to_string());
        let Some(current) = state.branches.get(&key).cloned() else {
            return Err(StoreError::NotFound(format!("refs/heads/{}", name)));
        };
        let fast_forward = current == sha
            || state.commits.get(sha).and_then(|c| c.parent.as_deref()) == Some(current.as_str());
        if !fast_forward {
            return Err(StoreError::StaleRef {
                reference: format!("refs/heads/{}", name),
                message: "Update is not a fast forward".to_string(),
            });
        }
        state.branches.insert(key, sha.to_string());
        Ok(())
    }

    async fn delete_branch(&self, repo: &RepositoryRef, name: &str) -> StoreResult<()> {
        self.enter(
            FailPoint::DeleteBranch,
            StoreCall::DeleteBranch { name: name.to_string() },
        )
        .await?;
        match self.lock().branches.remove(&(repo.clone(), name.to_string())) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(format!("refs/heads/{}", name))),
        }
    }

    async fn get_branch_info(&self, repo: &RepositoryRef, name: &str) -> StoreResult<BranchInfo> {
        self.lock().calls.push(StoreCall::GetBranchInfo { name: name.to_string() });
        self.branch_sha(repo, name)
            .map(|sha| BranchInfo {
                name: name.to_string(),
                sha,
            })
            .ok_or_else(|| StoreError::NotFound(format!("refs/heads/{}", name)))
    }

    async fn get_commit(&self, _repo: &RepositoryRef, sha: &str) -> StoreResult<CommitInfo> {
        self.enter(FailPoint::GetCommit, StoreCall::GetCommit { sha: sha.to_string() })
            .await?;
        self.commit_tree(sha)
            .map(|tree_sha| CommitInfo {
                sha: sha.to_string(),
                tree_sha,
            })
            .ok_or_else(|| StoreError::NotFound(format!("commit {}", sha)))
    }

    async fn create_blob(&self, _repo: &RepositoryRef, content: &[u8]) -> StoreResult<String> {
        self.enter(FailPoint::CreateBlob, StoreCall::CreateBlob).await?;
        let sha = digest("blob", &[content]);
        self.lock().blobs.insert(sha.clone(), content.to_vec());
        Ok(sha)
    }

    async fn create_tree(&self, _repo: &RepositoryRef, base_tree: &str, changes: &[TreeChange]) -> StoreResult<String> {
        self.enter(
            FailPoint::CreateTree,
            StoreCall::CreateTree {
                base_tree: base_tree.to_string(),
                executable: changes
                    .iter()
                    .filter_map(|change| match change {
                        TreeChange::Upsert {
                            path,
                            mode: FileMode::Executable,
                            ..
                        } => Some(path.clone()),
                        _ => None,
                    })
                    .collect(),
            },
        )
        .await?;
        let mut state = self.lock();
        let Some(mut entries) = state.trees.get(base_tree).cloned() else {
            return Err(StoreError::InvalidTree(format!("base tree {} does not exist", base_tree)));
        };
        for change in changes {
            match change {
                TreeChange::Upsert { path, blob_sha, .. } => {
                    if !state.blobs.contains_key(blob_sha) {
                        return Err(StoreError::InvalidTree(format!("blob {} does not exist", blob_sha)));
                    }
                    entries.insert(path.clone(), blob_sha.clone());
                }
                TreeChange::Delete { path } => {
                    entries.remove(path);
                }
            }
        }
        let sha = tree_sha(&entries);
        state.trees.insert(sha.clone(), entries);
        Ok(sha)
    }

    async fn create_commit(
        &self,
        _repo: &RepositoryRef,
        tree_sha: &str,
        parent_sha: &str,
        message: &str,
    ) -> StoreResult<CommitInfo> {
        self.enter(
            FailPoint::CreateCommit,
            StoreCall::CreateCommit {
                tree_sha: tree_sha.to_string(),
                parent_sha: parent_sha.to_string(),
            },
        )
        .await?;
        let mut state = self.lock();
        if !state.trees.contains_key(tree_sha) {
            return Err(StoreError::InvalidTree(format!("tree {} does not exist", tree_sha)));
        }
        if !state.commits.contains_key(parent_sha) {
            return Err(StoreError::NotFound(format!("commit {}", parent_sha)));
        }
        let sha = digest(
            "commit",
            &[tree_sha.as_bytes(), parent_sha.as_bytes(), message.as_bytes()],
        );
        state.commits.insert(
            sha.clone(),
            StoredCommit {
                tree_sha: tree_sha.to_string(),
                parent: Some(parent_sha.to_string()),
            },
        );
        Ok(CommitInfo {
            sha,
            tree_sha: tree_sha.to_string(),
        })
    }

    async fn create_pull_request(&self, repo: &RepositoryRef, pr: &NewPullRequest) -> StoreResult<PullRequestHandle> {
        self.enter(
            FailPoint::CreatePullRequest,
            StoreCall::CreatePullRequest {
                head: pr.head.clone(),
                base: pr.base.clone(),
            },
        )
        .await?;
        let mut state = self.lock();
        if state
            .pulls
            .iter()
            .any(|p| p.repo == *repo && p.request.head == pr.head)
        {
            return Err(StoreError::Validation(format!(
                "A pull request already exists for {}:{}.",
                repo.owner, pr.head
            )));
        }
        if !state.branches.contains_key(&(repo.clone(), pr.head.clone())) {
            return Err(StoreError::Validation(format!("head {} does not exist", pr.head)));
        }
        let number = 100 + state.pulls.len() as u64;
        let handle = PullRequestHandle {
            number,
            html_url: format!("https://github.com/{}/pull/{}", repo, number),
        };
        state.pulls.push(RecordedPullRequest {
            repo: repo.clone(),
            request: pr.clone(),
            handle: handle.clone(),
        });
        Ok(handle)
    }

    async fn create_issue_comment(&self, repo: &RepositoryRef, issue_number: u64, body: &str) -> StoreResult<()> {
        self.enter(
            FailPoint::CreateComment,
            StoreCall::CreateComment {
                issue: issue_number,
                body: body.to_string(),
            },
        )
        .await?;
        self.lock().comments.push(RecordedComment {
            repo: repo.clone(),
            issue: issue_number,
            body: body.to_string(),
        });
        Ok(())
    }
}

/// Materializes commits straight out of a `MemoryStore`.
pub struct MemoryCheckout {
    store: Arc<MemoryStore>,
    seen: Mutex<Vec<PathBuf>>,
}

impl MemoryCheckout {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Directories handed to `materialize`, in call order.
    pub fn seen(&self) -> Vec<PathBuf> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Checkout for MemoryCheckout {
    async fn materialize(&self, _repo: &RepositoryRef, sha: &str, dest: &Path) -> Result<()> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).push(dest.to_path_buf());
        let tree = self
            .store
            .commit_tree(sha)
            .ok_or_else(|| anyhow::anyhow!("unknown commit {}", sha))?;
        let files = self
            .store
            .tree_files(&tree)
            .ok_or_else(|| anyhow::anyhow!("unknown tree {}", tree))?;
        for (path, content) in files {
            let target = dest.join(&path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, content)?;
        }
        Ok(())
    }
}

/// Writes `RIFF` + the input bytes as the "WebP" output; no decoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkerConverter;

impl Converter for MarkerConverter {
    fn convert(&self, input: &Path) -> Result<PathBuf, ConversionError> {
        let bytes = std::fs::read(input).map_err(|source| ConversionError::Io {
            path: input.to_path_buf(),
            source,
        })?;
        let output = input.with_extension(OUTPUT_EXTENSION);
        let mut converted = b"RIFF".to_vec();
        converted.extend_from_slice(&bytes);
        std::fs::write(&output, converted).map_err(|source| ConversionError::Io {
            path: output.clone(),
            source,
        })?;
        Ok(output)
    }
}
