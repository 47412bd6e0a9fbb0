//! Per-event orchestration: filter, branch, transform, commit, publish.
//!
//! A run walks `Received → Filtered → BranchCreated → Transformed → Committed
//! → PullRequestOpened → Commented → Done`. Any remote failure ends it in
//! `Failed { stage, cause }` and unwinds the compensation stack. Greeting runs
//! skip straight from `Filtered` to `Commented`.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::instrument;
use uuid::Uuid;

use super::branch::{BranchIdentifier, BranchNamer};
use super::checkout::Checkout;
use super::event::{
    EventFilter, FilterDecision, IgnoreReason, PullRequestEvent, QualifiedEvent, RepositoryRef, RunKind,
};
use super::mutator::{Compensations, RepositoryMutator};
use super::publisher::{CommentOutcome, PullRequestPublisher};
use super::store::{PullRequestHandle, VersionedStore};
use super::transform::{TransformEngine, TransformationResult};
use crate::config::BotConfig;
use crate::errors::{RunFailure, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Filtered,
    BranchCreated,
    Transformed,
    Committed,
    PullRequestOpened,
    Commented,
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Received => "received",
            Stage::Filtered => "filtered",
            Stage::BranchCreated => "branch_created",
            Stage::Transformed => "transformed",
            Stage::Committed => "committed",
            Stage::PullRequestOpened => "pull_request_opened",
            Stage::Commented => "commented",
            Stage::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub enum RunState {
    InProgress(Stage),
    Done,
    /// The transformation changed nothing; the branch was removed again.
    NoChanges,
    /// `stage` is the stage the run was trying to reach.
    Failed { stage: Stage, cause: RunFailure },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::InProgress(_))
    }
}

/// One end-to-end execution for a qualified event.
#[derive(Debug)]
pub struct PipelineRun {
    id: Uuid,
    event: PullRequestEvent,
    kind: RunKind,
    branch: Option<BranchIdentifier>,
    transformation: Option<TransformationResult>,
    commit_sha: Option<String>,
    pull_request: Option<PullRequestHandle>,
    comment: Option<CommentOutcome>,
    history: Vec<Stage>,
    state: RunState,
}

impl PipelineRun {
    /// Requires a `QualifiedEvent`, so self-authored events never get a run.
    pub fn new(qualified: QualifiedEvent) -> Self {
        let kind = qualified.kind();
        Self {
            id: Uuid::new_v4(),
            event: qualified.event().clone(),
            kind,
            branch: None,
            transformation: None,
            commit_sha: None,
            pull_request: None,
            comment: None,
            history: vec![Stage::Received],
            state: RunState::InProgress(Stage::Received),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event(&self) -> &PullRequestEvent {
        &self.event
    }

    pub fn kind(&self) -> RunKind {
        self.kind
    }

    pub fn branch(&self) -> Option<&BranchIdentifier> {
        self.branch.as_ref()
    }

    pub fn transformation(&self) -> Option<&TransformationResult> {
        self.transformation.as_ref()
    }

    pub fn commit_sha(&self) -> Option<&str> {
        self.commit_sha.as_deref()
    }

    pub fn pull_request(&self) -> Option<&PullRequestHandle> {
        self.pull_request.as_ref()
    }

    pub fn comment(&self) -> Option<&CommentOutcome> {
        self.comment.as_ref()
    }

    /// Stages reached so far, in order.
    pub fn history(&self) -> &[Stage] {
        &self.history
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    fn advance(&mut self, stage: Stage) {
        self.history.push(stage);
        self.state = match stage {
            Stage::Done => RunState::Done,
            other => RunState::InProgress(other),
        };
    }
}

/// Result of handing an event to the orchestrator.
#[derive(Debug)]
pub enum DispatchOutcome {
    Ignored(IgnoreReason),
    Spawned { run_id: Uuid, handle: JoinHandle<PipelineRun> },
}

/// Knobs the orchestrator reads per run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub stage_timeout: Duration,
    pub base_branch: Option<String>,
    pub work_root: Option<PathBuf>,
    pub rollback_on_failure: bool,
    pub commit_message: String,
    pub pr_title: String,
    pub pr_body: String,
    pub merged_comment: String,
    /// Greeting for newly opened PRs; greeting runs post nothing when unset.
    pub greeting: Option<String>,
}

impl PipelineSettings {
    pub fn from_config(config: &BotConfig, greeting: Option<String>) -> Self {
        let p = &config.pipeline;
        Self {
            stage_timeout: config.stage_timeout(),
            base_branch: p.base_branch.clone(),
            work_root: p.work_root.clone(),
            rollback_on_failure: p.rollback_on_failure,
            commit_message: p.commit_message.clone(),
            pr_title: p.pr_title.clone(),
            pr_body: p.pr_body.clone(),
            merged_comment: p.merged_comment.clone(),
            greeting,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&BotConfig::default(), None)
    }
}

/// Replace `{key}` placeholders.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |text, (key, value)| {
        text.replace(&format!("{{{}}}", key), value)
    })
}

enum Finish {
    Done,
    NoChanges,
}

type StageResult<T> = Result<T, (Stage, RunFailure)>;

pub struct Orchestrator {
    filter: EventFilter,
    namer: Arc<BranchNamer>,
    mutator: RepositoryMutator,
    publisher: PullRequestPublisher,
    checkout: Arc<dyn Checkout>,
    engine: Arc<TransformEngine>,
    settings: PipelineSettings,
}

impl Orchestrator {
    pub fn new(
        filter: EventFilter,
        namer: Arc<BranchNamer>,
        store: Arc<dyn VersionedStore>,
        checkout: Arc<dyn Checkout>,
        engine: Arc<TransformEngine>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            filter,
            namer,
            mutator: RepositoryMutator::new(store.clone()).with_call_timeout(settings.stage_timeout),
            publisher: PullRequestPublisher::new(store),
            checkout,
            engine,
            settings,
        }
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// Filter synchronously; spawn a task only for qualified events.
    pub fn dispatch(self: &Arc<Self>, event: PullRequestEvent) -> DispatchOutcome {
        let number = event.number;
        match self.filter.evaluate(event) {
            FilterDecision::Ignore(reason) => {
                tracing::info!(pr = number, %reason, "event ignored");
                DispatchOutcome::Ignored(reason)
            }
            FilterDecision::Proceed(qualified) => {
                let run = PipelineRun::new(qualified);
                let run_id = run.id;
                let this = Arc::clone(self);
                let handle = tokio::spawn(async move { this.execute(run).await });
                DispatchOutcome::Spawned { run_id, handle }
            }
        }
    }

    /// Drive one run to a terminal state.
    pub async fn run(&self, qualified: QualifiedEvent) -> PipelineRun {
        self.execute(PipelineRun::new(qualified)).await
    }

    #[instrument(skip_all, fields(run_id = %run.id, pr = run.event.number, repo = %run.event.repository))]
    async fn execute(&self, mut run: PipelineRun) -> PipelineRun {
        run.advance(Stage::Filtered);
        match run.kind {
            RunKind::Greeting => {
                self.greet(&mut run).await;
                run.advance(Stage::Done);
            }
            RunKind::Transform => {
                let mut compensations = Compensations::default();
                match self.convert_and_publish(&mut run, &mut compensations).await {
                    Ok(Finish::Done) => run.advance(Stage::Done),
                    Ok(Finish::NoChanges) => {
                        tracing::info!("nothing to convert; removing branch");
                        self.mutator.unwind(&mut compensations).await;
                        run.state = RunState::NoChanges;
                    }
                    Err((stage, cause)) => {
                        let status = match &cause {
                            RunFailure::Store(e) => e.status(),
                            _ => None,
                        };
                        tracing::error!(%stage, error = %cause, ?status, "run failed");
                        if self.settings.rollback_on_failure && !compensations.is_empty() {
                            let undone = self.mutator.unwind(&mut compensations).await;
                            tracing::info!(undone, "compensations applied");
                        }
                        run.state = RunState::Failed { stage, cause };
                    }
                }
            }
        }
        tracing::info!(state = ?run.state, "run finished");
        run
    }

    async fn greet(&self, run: &mut PipelineRun) {
        let Some(template) = self.settings.greeting.as_deref() else {
            tracing::debug!("no greeting configured");
            return;
        };
        let number = run.event.number.to_string();
        let body = render(template, &[("number", &number)]);
        let outcome = self
            .bounded_comment(&run.event.repository, run.event.number, &body)
            .await;
        run.comment = Some(outcome);
        run.advance(Stage::Commented);
    }

    async fn convert_and_publish(&self, run: &mut PipelineRun, compensations: &mut Compensations) -> StageResult<Finish> {
        let repo = run.event.repository.clone();
        let base = self
            .settings
            .base_branch
            .clone()
            .unwrap_or_else(|| run.event.base_ref.clone());

        // Branch
        let from_sha = self
            .base_tip(run, &base)
            .await
            .map_err(|e| (Stage::BranchCreated, e))?;
        let branch = self.namer.next();
        self.mutator
            .create_branch(&repo, &branch, &from_sha, compensations)
            .await
            .map_err(|e| (Stage::BranchCreated, RunFailure::from(e)))?;
        run.branch = Some(branch.clone());
        run.advance(Stage::BranchCreated);

        // Transform in an isolated working directory
        let workdir = self.workdir().map_err(|e| (Stage::Transformed, e))?;
        self.bounded(async {
            self.checkout
                .materialize(&repo, &from_sha, workdir.path())
                .await
                .map_err(|e| RunFailure::Workspace(format!("{:#}", e)))
        })
        .await
        .map_err(|e| (Stage::Transformed, e))?;

        let engine = Arc::clone(&self.engine);
        let root = workdir.path().to_path_buf();
        let result = tokio::task::spawn_blocking(move || engine.transform(&root))
            .await
            .map_err(|e| (Stage::Transformed, RunFailure::Transform(e.to_string())))?;
        tracing::info!(
            converted = result.converted.len(),
            rewritten = result.rewritten.len(),
            skipped = result.skipped.len(),
            errors = result.errors.len(),
            "transformation finished"
        );
        run.transformation = Some(result.clone());
        run.advance(Stage::Transformed);
        if !result.has_changes() {
            return Ok(Finish::NoChanges);
        }
        let converted = result.converted.len().to_string();
        let rewritten = result.rewritten.len().to_string();

        // Commit; the mutator bounds each of its remote calls
        let number = run.event.number.to_string();
        let tree = self
            .mutator
            .build_tree(&repo, &from_sha, workdir.path(), &result)
            .await
            .map_err(|e| (Stage::Committed, RunFailure::from(e)))?;
        let message = render(&self.settings.commit_message, &[("number", &number), ("branch", &branch.name)]);
        let commit = self
            .mutator
            .commit_and_update(&repo, &branch, &tree, &from_sha, &message)
            .await
            .map_err(|e| (Stage::Committed, RunFailure::from(e)))?;
        run.commit_sha = Some(commit.sha);
        run.advance(Stage::Committed);
        drop(workdir);

        // Pull request
        let vars = [
            ("number", number.as_str()),
            ("branch", branch.name.as_str()),
            ("base", base.as_str()),
            ("converted", converted.as_str()),
            ("rewritten", rewritten.as_str()),
        ];
        let title = render(&self.settings.pr_title, &vars);
        let body = render(&self.settings.pr_body, &vars);
        let pr = self
            .bounded(self.publisher.open_pull_request(&repo, &branch.name, &base, &title, &body))
            .await
            .map_err(|e| (Stage::PullRequestOpened, e))?;
        let comment = render(
            &self.settings.merged_comment,
            &[("number", &number), ("pr_url", &pr.html_url)],
        );
        run.pull_request = Some(pr);
        run.advance(Stage::PullRequestOpened);

        // Comment on the merged PR; failure does not change the outcome
        let outcome = self.bounded_comment(&repo, run.event.number, &comment).await;
        run.comment = Some(outcome);
        run.advance(Stage::Commented);

        Ok(Finish::Done)
    }

    /// Current tip of `base`, falling back to the event's base SHA when the
    /// branch cannot be found.
    async fn base_tip(&self, run: &PipelineRun, base: &str) -> Result<String, RunFailure> {
        let repo = &run.event.repository;
        match self.bounded(self.mutator.store().get_branch_info(repo, base)).await {
            Ok(info) => Ok(info.sha),
            Err(RunFailure::Store(StoreError::NotFound(_))) => {
                tracing::warn!(base, sha = %run.event.base_sha, "base branch not found; using event base sha");
                Ok(run.event.base_sha.clone())
            }
            Err(e) => Err(e),
        }
    }

    async fn bounded_comment(&self, repo: &RepositoryRef, issue: u64, body: &str) -> CommentOutcome {
        match tokio::time::timeout(self.settings.stage_timeout, self.publisher.post_comment(repo, issue, body)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let err = self.timeout_error();
                tracing::warn!(pr = issue, error = %err, "comment timed out");
                CommentOutcome::Failed(err.to_string())
            }
        }
    }

    /// Bound a stage's future by the configured timeout.
    async fn bounded<T, E, F>(&self, fut: F) -> Result<T, RunFailure>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<RunFailure>,
    {
        match tokio::time::timeout(self.settings.stage_timeout, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(self.timeout_error().into()),
        }
    }

    fn timeout_error(&self) -> StoreError {
        StoreError::Timeout {
            after: self.settings.stage_timeout,
        }
    }

    fn workdir(&self) -> Result<TempDir, RunFailure> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("webporizer-run-");
        let dir = match &self.settings.work_root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|e| RunFailure::Workspace(e.to_string()))?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        };
        dir.map_err(|e| RunFailure::Workspace(e.to_string()))
    }
}
