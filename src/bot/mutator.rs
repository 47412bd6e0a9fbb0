//! Remote-state sequencing: branch, blobs, tree, commit, ref update.
//!
//! Every mutating step pushes its inverse onto [`Compensations`]; the
//! orchestrator unwinds that stack when a later step fails. Each remote call
//! is bounded on its own by the mutator's call timeout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::branch::BranchIdentifier;
use super::event::RepositoryRef;
use super::store::{BranchInfo, CommitInfo, FileMode, StoreResult, TreeChange, VersionedStore, within};
use super::transform::TransformationResult;
use crate::errors::{RunFailure, StoreError};

/// Inverse of a completed remote mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    DeleteBranch { repo: RepositoryRef, name: String },
}

/// LIFO stack of inverse actions for one run.
#[derive(Debug, Default)]
pub struct Compensations {
    stack: Vec<Compensation>,
}

impl Compensations {
    pub fn push(&mut self, action: Compensation) {
        self.stack.push(action);
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    /// Run all inverse actions newest-first, each bounded by `limit`.
    /// Failures are logged and skipped. Returns how many succeeded.
    pub async fn unwind(&mut self, store: &dyn VersionedStore, limit: Duration) -> usize {
        let mut undone = 0;
        while let Some(action) = self.stack.pop() {
            match &action {
                Compensation::DeleteBranch { repo, name } => match within(limit, store.delete_branch(repo, name)).await {
                    Ok(()) => {
                        tracing::info!(%repo, branch = %name, "compensation: deleted branch");
                        undone += 1;
                    }
                    Err(e) => {
                        tracing::error!(%repo, branch = %name, error = %e, "compensation failed: branch left behind");
                    }
                },
            }
        }
        undone
    }
}

/// Tree built from the transformed working directory. Only
/// `RepositoryMutator::build_tree` produces one, so a commit can never be
/// created from the untouched base tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostTransformTree {
    sha: String,
    base_tree_sha: String,
    changes: usize,
}

impl PostTransformTree {
    pub fn sha(&self) -> &str {
        &self.sha
    }

    pub fn base_tree_sha(&self) -> &str {
        &self.base_tree_sha
    }

    pub fn changes(&self) -> usize {
        self.changes
    }
}

/// Convert a relative path to the forward-slash form trees use.
fn tree_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Files to upload and paths to remove, in a stable order.
pub fn planned_changes(result: &TransformationResult) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut uploads: Vec<PathBuf> = result.converted.iter().map(|c| c.output.clone()).collect();
    uploads.extend(result.rewritten.iter().cloned());
    let deletions = result.converted.iter().map(|c| c.source.clone()).collect();
    (uploads, deletions)
}

/// Git mode for a working-directory file, from its executable bit.
#[cfg(unix)]
async fn file_mode(path: &Path) -> std::io::Result<FileMode> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = tokio::fs::metadata(path).await?;
    if metadata.permissions().mode() & 0o111 != 0 {
        Ok(FileMode::Executable)
    } else {
        Ok(FileMode::Regular)
    }
}

#[cfg(not(unix))]
async fn file_mode(_path: &Path) -> std::io::Result<FileMode> {
    Ok(FileMode::Regular)
}

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

pub struct RepositoryMutator {
    store: Arc<dyn VersionedStore>,
    call_timeout: Duration,
}

impl RepositoryMutator {
    pub fn new(store: Arc<dyn VersionedStore>) -> Self {
        Self {
            store,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Bound every remote call by `limit` instead of the default.
    pub fn with_call_timeout(mut self, limit: Duration) -> Self {
        self.call_timeout = limit;
        self
    }

    pub fn store(&self) -> &dyn VersionedStore {
        self.store.as_ref()
    }

    /// Undo everything recorded in `compensations`.
    pub async fn unwind(&self, compensations: &mut Compensations) -> usize {
        compensations.unwind(self.store(), self.call_timeout).await
    }

    /// Step 1: create the run's branch at `from_sha`.
    pub async fn create_branch(
        &self,
        repo: &RepositoryRef,
        branch: &BranchIdentifier,
        from_sha: &str,
        compensations: &mut Compensations,
    ) -> StoreResult<BranchInfo> {
        let info = within(self.call_timeout, self.store.create_branch(repo, &branch.name, from_sha)).await?;
        compensations.push(Compensation::DeleteBranch {
            repo: repo.clone(),
            name: branch.name.clone(),
        });
        tracing::info!(%repo, branch = %branch, from_sha, "created branch");
        Ok(info)
    }

    /// Upload the transformed files and build a tree on top of `base_sha`'s tree.
    pub async fn build_tree(
        &self,
        repo: &RepositoryRef,
        base_sha: &str,
        workdir: &Path,
        result: &TransformationResult,
    ) -> Result<PostTransformTree, BuildTreeError> {
        let base = within(self.call_timeout, self.store.get_commit(repo, base_sha)).await?;
        let (uploads, deletions) = planned_changes(result);

        let mut changes = Vec::with_capacity(uploads.len() + deletions.len());
        for rel in &uploads {
            let local = workdir.join(rel);
            let read_error = |source| BuildTreeError::Read {
                path: rel.clone(),
                source,
            };
            let bytes = tokio::fs::read(&local).await.map_err(read_error)?;
            let mode = file_mode(&local).await.map_err(read_error)?;
            let blob_sha = within(self.call_timeout, self.store.create_blob(repo, &bytes)).await?;
            changes.push(TreeChange::Upsert {
                path: tree_path(rel),
                blob_sha,
                mode,
            });
        }
        for rel in &deletions {
            changes.push(TreeChange::Delete { path: tree_path(rel) });
        }

        let sha = within(self.call_timeout, self.store.create_tree(repo, &base.tree_sha, &changes)).await?;
        if sha == base.tree_sha {
            return Err(StoreError::InvalidTree(format!(
                "tree {} is identical to the base tree of {}",
                sha, base_sha
            ))
            .into());
        }
        tracing::info!(%repo, tree = %sha, base_tree = %base.tree_sha, changes = changes.len(), "built tree");
        Ok(PostTransformTree {
            sha,
            base_tree_sha: base.tree_sha,
            changes: changes.len(),
        })
    }

    /// Steps 3 and 4: commit `tree` on top of `parent_sha`, then fast-forward
    /// the branch to the new commit.
    pub async fn commit_and_update(
        &self,
        repo: &RepositoryRef,
        branch: &BranchIdentifier,
        tree: &PostTransformTree,
        parent_sha: &str,
        message: &str,
    ) -> StoreResult<CommitInfo> {
        let commit = within(
            self.call_timeout,
            self.store.create_commit(repo, tree.sha(), parent_sha, message),
        )
        .await?;
        self.update_ref(repo, branch, &commit.sha).await?;
        tracing::info!(%repo, branch = %branch, commit = %commit.sha, "branch points at new commit");
        Ok(commit)
    }

    /// Step 2: repoint `branch` to `sha` (fast-forward only).
    pub async fn update_ref(&self, repo: &RepositoryRef, branch: &BranchIdentifier, sha: &str) -> StoreResult<()> {
        within(self.call_timeout, self.store.update_ref(repo, &branch.name, sha)).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildTreeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to read transformed file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<BuildTreeError> for RunFailure {
    fn from(err: BuildTreeError) -> Self {
        match err {
            BuildTreeError::Store(e) => RunFailure::Store(e),
            read @ BuildTreeError::Read { .. } => RunFailure::Workspace(read.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::fakes::{FailPoint, MemoryStore, StoreCall};
    use crate::bot::transform::ConvertedAsset;

    fn repo() -> RepositoryRef {
        RepositoryRef::new("acme", "site")
    }

    fn branch() -> BranchIdentifier {
        BranchIdentifier {
            name: "webp-1-1".into(),
        }
    }

    fn converted_result() -> TransformationResult {
        TransformationResult {
            converted: vec![ConvertedAsset {
                source: PathBuf::from("img/a.jpg"),
                output: PathBuf::from("img/a.webp"),
            }],
            rewritten: vec![PathBuf::from("page.html")],
            ..Default::default()
        }
    }

    #[test]
    fn test_planned_changes() {
        let (uploads, deletions) = planned_changes(&converted_result());
        assert_eq!(uploads, vec![PathBuf::from("img/a.webp"), PathBuf::from("page.html")]);
        assert_eq!(deletions, vec![PathBuf::from("img/a.jpg")]);
    }

    #[test]
    fn test_tree_path_uses_forward_slashes() {
        assert_eq!(tree_path(Path::new("img/nested/a.webp")), "img/nested/a.webp");
    }

    #[tokio::test]
    async fn test_build_tree_differs_from_base() {
        let store = Arc::new(MemoryStore::new());
        store.seed_commit(
            &repo(),
            "abc123",
            &[("img/a.jpg", b"jpeg".as_slice()), ("page.html", b"<img src=\"img/a.jpg\">")],
        );
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("img")).unwrap();
        std::fs::write(dir.path().join("img/a.webp"), b"webp").unwrap();
        std::fs::write(dir.path().join("page.html"), b"<img src=\"img/a.webp\">").unwrap();

        let mutator = RepositoryMutator::new(store.clone());
        let tree = mutator
            .build_tree(&repo(), "abc123", dir.path(), &converted_result())
            .await
            .unwrap();

        assert_ne!(tree.sha(), tree.base_tree_sha());
        assert_eq!(tree.changes(), 3);
        let files = store.tree_files(tree.sha()).unwrap();
        assert!(files.contains_key("img/a.webp"));
        assert!(!files.contains_key("img/a.jpg"));
        assert_eq!(files["page.html"], b"<img src=\"img/a.webp\">".to_vec());
    }

    #[tokio::test]
    async fn test_build_tree_without_changes_is_invalid() {
        let store = Arc::new(MemoryStore::new());
        store.seed_commit(&repo(), "abc123", &[("a.txt", b"hi".as_slice())]);
        let dir = tempfile::tempdir().unwrap();

        let mutator = RepositoryMutator::new(store);
        let err = mutator
            .build_tree(&repo(), "abc123", dir.path(), &TransformationResult::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildTreeError::Store(StoreError::InvalidTree(_))));
    }

    #[tokio::test]
    async fn test_build_tree_missing_file_is_read_error() {
        let store = Arc::new(MemoryStore::new());
        store.seed_commit(&repo(), "abc123", &[("img/a.jpg", b"jpeg".as_slice())]);
        let dir = tempfile::tempdir().unwrap();

        let mutator = RepositoryMutator::new(store);
        let err = mutator
            .build_tree(&repo(), "abc123", dir.path(), &converted_result())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildTreeError::Read { .. }));
    }

    #[tokio::test]
    async fn test_create_branch_records_compensation_and_unwind_deletes() {
        let store = Arc::new(MemoryStore::new());
        store.seed_commit(&repo(), "abc123", &[("a.txt", b"hi".as_slice())]);
        let mutator = RepositoryMutator::new(store.clone());
        let mut compensations = Compensations::default();

        mutator
            .create_branch(&repo(), &branch(), "abc123", &mut compensations)
            .await
            .unwrap();
        assert_eq!(compensations.len(), 1);
        assert!(store.branch_sha(&repo(), "webp-1-1").is_some());

        let undone = mutator.unwind(&mut compensations).await;
        assert_eq!(undone, 1);
        assert!(compensations.is_empty());
        assert!(store.branch_sha(&repo(), "webp-1-1").is_none());
        assert!(matches!(store.calls().last(), Some(StoreCall::DeleteBranch { .. })));
    }

    #[tokio::test]
    async fn test_failed_create_branch_records_nothing() {
        let store = Arc::new(MemoryStore::new());
        store.seed_commit(&repo(), "abc123", &[("a.txt", b"hi".as_slice())]);
        store.seed_branch(&repo(), "webp-1-1", "abc123");
        let mutator = RepositoryMutator::new(store);
        let mut compensations = Compensations::default();

        let err = mutator
            .create_branch(&repo(), &branch(), "abc123", &mut compensations)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RefConflict { .. }));
        assert!(compensations.is_empty());
    }

    #[tokio::test]
    async fn test_commit_and_update_moves_branch() {
        let store = Arc::new(MemoryStore::new());
        store.seed_commit(&repo(), "abc123", &[("img/a.jpg", b"jpeg".as_slice())]);
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("img")).unwrap();
        std::fs::write(dir.path().join("img/a.webp"), b"webp").unwrap();
        std::fs::write(dir.path().join("page.html"), b"x").unwrap();

        let mutator = RepositoryMutator::new(store.clone());
        let mut compensations = Compensations::default();
        mutator
            .create_branch(&repo(), &branch(), "abc123", &mut compensations)
            .await
            .unwrap();
        let tree = mutator
            .build_tree(&repo(), "abc123", dir.path(), &converted_result())
            .await
            .unwrap();
        let commit = mutator
            .commit_and_update(&repo(), &branch(), &tree, "abc123", "Convert images")
            .await
            .unwrap();

        assert_eq!(commit.tree_sha, tree.sha());
        assert_eq!(store.branch_sha(&repo(), "webp-1-1").as_deref(), Some(commit.sha.as_str()));
    }

    #[tokio::test]
    async fn test_each_blob_upload_gets_its_own_bound() {
        let store = Arc::new(MemoryStore::new());
        let seeded: Vec<(String, &[u8])> = (0..6).map(|i| (format!("img/{}.png", i), b"png".as_slice())).collect();
        let seeded: Vec<(&str, &[u8])> = seeded.iter().map(|(p, c)| (p.as_str(), *c)).collect();
        store.seed_commit(&repo(), "abc123", &seeded);
        store.delay_on(FailPoint::CreateBlob, Duration::from_millis(40));

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("img")).unwrap();
        let mut result = TransformationResult::default();
        for i in 0..6 {
            std::fs::write(dir.path().join(format!("img/{}.webp", i)), b"webp").unwrap();
            result.converted.push(ConvertedAsset {
                source: PathBuf::from(format!("img/{}.png", i)),
                output: PathBuf::from(format!("img/{}.webp", i)),
            });
        }

        let mutator = RepositoryMutator::new(store.clone()).with_call_timeout(Duration::from_millis(150));
        let tree = mutator.build_tree(&repo(), "abc123", dir.path(), &result).await.unwrap();
        assert_eq!(tree.changes(), 12);
    }

    #[tokio::test]
    async fn test_slow_blob_upload_times_out() {
        let store = Arc::new(MemoryStore::new());
        store.seed_commit(&repo(), "abc123", &[("img/a.jpg", b"jpeg".as_slice())]);
        store.delay_on(FailPoint::CreateBlob, Duration::from_millis(300));
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("img")).unwrap();
        std::fs::write(dir.path().join("img/a.webp"), b"webp").unwrap();
        std::fs::write(dir.path().join("page.html"), b"x").unwrap();

        let mutator = RepositoryMutator::new(store).with_call_timeout(Duration::from_millis(30));
        let err = mutator
            .build_tree(&repo(), "abc123", dir.path(), &converted_result())
            .await
            .unwrap_err();
        match err {
            BuildTreeError::Store(StoreError::Timeout { after }) => assert_eq!(after, Duration::from_millis(30)),
            other => panic!("Expected Timeout, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_tree_keeps_executable_mode() {
        use std::os::unix::fs::PermissionsExt;

        let store = Arc::new(MemoryStore::new());
        store.seed_commit(
            &repo(),
            "abc123",
            &[("img/a.jpg", b"jpeg".as_slice()), ("page.html", b"<img src=\"img/a.jpg\">")],
        );
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("img")).unwrap();
        std::fs::write(dir.path().join("img/a.webp"), b"webp").unwrap();
        let page = dir.path().join("page.html");
        std::fs::write(&page, b"<img src=\"img/a.webp\">").unwrap();
        std::fs::set_permissions(&page, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mutator = RepositoryMutator::new(store.clone());
        mutator
            .build_tree(&repo(), "abc123", dir.path(), &converted_result())
            .await
            .unwrap();

        let executable = store.calls().into_iter().find_map(|call| match call {
            StoreCall::CreateTree { executable, .. } => Some(executable),
            _ => None,
        });
        assert_eq!(executable, Some(vec!["page.html".to_string()]));
    }
}
