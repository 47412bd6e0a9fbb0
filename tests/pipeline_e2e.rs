//! End-to-end pipeline runs against the in-memory store.

use std::sync::Arc;

use webporizer::bot::branch::BranchNamer;
use webporizer::bot::event::{
    EventFilter, FilterDecision, PullRequestAction, PullRequestEvent, QualifiedEvent, RepositoryRef,
};
use webporizer::bot::fakes::{MarkerConverter, MemoryCheckout, MemoryStore, StoreCall};
use webporizer::bot::pipeline::{DispatchOutcome, Orchestrator, PipelineSettings, RunState, Stage};
use webporizer::bot::publisher::CommentOutcome;
use webporizer::bot::transform::TransformEngine;

const BOT: &str = "webporizer[bot]";

fn repo() -> RepositoryRef {
    RepositoryRef::new("acme", "site")
}

fn event(action: PullRequestAction, merged: bool, author: &str) -> PullRequestEvent {
    PullRequestEvent {
        action,
        merged,
        number: 42,
        author: author.to_string(),
        title: "Add hero image".to_string(),
        repository: repo(),
        base_ref: "main".to_string(),
        base_sha: "abc123".to_string(),
    }
}

fn site_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.seed_commit(
        &repo(),
        "abc123",
        &[
            ("assets/hero.jpg", b"\xff\xd8jpeg".as_slice()),
            ("index.html", b"<img src=\"assets/hero.jpg\" alt=\"hero\">".as_slice()),
            ("README.md", b"# site".as_slice()),
        ],
    );
    store.seed_branch(&repo(), "main", "abc123");
    store
}

fn orchestrator(store: Arc<MemoryStore>) -> Arc<Orchestrator> {
    let checkout = Arc::new(MemoryCheckout::new(store.clone()));
    orchestrator_with_checkout(store, checkout)
}

fn orchestrator_with_checkout(store: Arc<MemoryStore>, checkout: Arc<MemoryCheckout>) -> Arc<Orchestrator> {
    let images = vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()];
    let markup = vec!["html".to_string(), "md".to_string()];
    Arc::new(Orchestrator::new(
        EventFilter::new(BOT),
        Arc::new(BranchNamer::new("webporizer/webp")),
        store,
        checkout,
        Arc::new(TransformEngine::new(Arc::new(MarkerConverter), &images, &markup)),
        PipelineSettings::default(),
    ))
}

fn qualify(orch: &Orchestrator, event: PullRequestEvent) -> QualifiedEvent {
    match orch.filter().evaluate(event) {
        FilterDecision::Proceed(q) => q,
        FilterDecision::Ignore(reason) => panic!("unexpectedly ignored: {}", reason),
    }
}

#[tokio::test]
async fn merged_pull_request_produces_follow_up_pull_request() {
    let store = site_store();
    let orch = orchestrator(store.clone());

    let run = orch.run(qualify(&orch, event(PullRequestAction::Closed, true, "human1"))).await;

    assert!(matches!(run.state(), RunState::Done), "state: {:?}", run.state());
    assert_eq!(run.history().last(), Some(&Stage::Done));

    // Remote calls happen in pipeline order
    let calls = store.calls();
    let position = |pred: &dyn Fn(&StoreCall) -> bool| calls.iter().position(pred).unwrap();
    let branch_at = position(&|c| matches!(c, StoreCall::CreateBranch { .. }));
    let commit_at = position(&|c| matches!(c, StoreCall::CreateCommit { .. }));
    let pr_at = position(&|c| matches!(c, StoreCall::CreatePullRequest { .. }));
    let comment_at = position(&|c| matches!(c, StoreCall::CreateComment { .. }));
    assert!(branch_at < commit_at && commit_at < pr_at && pr_at < comment_at);

    // The commit carries the transformed tree, not the base tree
    let branch = run.branch().unwrap();
    let commit = run.commit_sha().unwrap();
    assert_eq!(store.branch_sha(&repo(), &branch.name).as_deref(), Some(commit));
    assert_eq!(store.commit_parent(commit).as_deref(), Some("abc123"));
    let tree = store.commit_tree(commit).unwrap();
    assert_ne!(Some(tree.clone()), store.commit_tree("abc123"));

    let files = store.tree_files(&tree).unwrap();
    assert!(files.contains_key("assets/hero.webp"));
    assert!(!files.contains_key("assets/hero.jpg"));
    assert_eq!(
        files["index.html"],
        b"<img src=\"assets/hero.webp\" alt=\"hero\">".to_vec()
    );
    assert_eq!(files["README.md"], b"# site".to_vec());

    // The PR uses the generated branch as head and the merged PR's base
    let pulls = store.pull_requests();
    assert_eq!(pulls.len(), 1);
    assert_eq!(pulls[0].request.head, branch.name);
    assert_eq!(pulls[0].request.base, "main");
    assert!(pulls[0].request.title.contains("#42"));

    assert_eq!(run.comment(), Some(&CommentOutcome::Posted));
    let comments = store.comments();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].issue, 42);
    assert!(comments[0].body.contains(&pulls[0].handle.html_url));
}

#[tokio::test]
async fn bot_authored_merge_never_reaches_the_store() {
    let store = site_store();
    let orch = orchestrator(store.clone());

    let outcome = orch.dispatch(event(PullRequestAction::Closed, true, "Webporizer[bot]"));

    assert!(matches!(outcome, DispatchOutcome::Ignored(_)));
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn concurrent_merges_get_distinct_branches_and_workdirs() {
    let store = site_store();
    let checkout = Arc::new(MemoryCheckout::new(store.clone()));
    let orch = orchestrator_with_checkout(store.clone(), checkout.clone());

    let mut handles = Vec::new();
    for _ in 0..4 {
        match orch.dispatch(event(PullRequestAction::Closed, true, "human1")) {
            DispatchOutcome::Spawned { handle, .. } => handles.push(handle),
            DispatchOutcome::Ignored(reason) => panic!("unexpectedly ignored: {}", reason),
        }
    }

    let mut branches = Vec::new();
    for handle in handles {
        let run = handle.await.unwrap();
        assert!(matches!(run.state(), RunState::Done), "state: {:?}", run.state());
        branches.push(run.branch().unwrap().name.clone());
    }
    branches.sort();
    branches.dedup();
    assert_eq!(branches.len(), 4);
    assert_eq!(store.pull_requests().len(), 4);

    // Each run transformed its own working directory
    let mut workdirs = checkout.seen();
    assert_eq!(workdirs.len(), 4);
    workdirs.sort();
    workdirs.dedup();
    assert_eq!(workdirs.len(), 4);
    assert!(workdirs.iter().all(|dir| !dir.exists()));
}

#[tokio::test]
async fn rerun_on_converted_tree_has_nothing_to_do() {
    let store = site_store();
    let orch = orchestrator(store.clone());
    let first = orch.run(qualify(&orch, event(PullRequestAction::Closed, true, "human1"))).await;
    let converted_sha = first.commit_sha().unwrap().to_string();

    // Merge the follow-up: main now points at the converted commit
    let fresh = Arc::new(MemoryStore::new());
    let tree = store.commit_tree(&converted_sha).unwrap();
    let files = store.tree_files(&tree).unwrap();
    let seeded: Vec<(&str, &[u8])> = files.iter().map(|(p, c)| (p.as_str(), c.as_slice())).collect();
    fresh.seed_commit(&repo(), "def456", &seeded);
    fresh.seed_branch(&repo(), "main", "def456");

    let orch = orchestrator(fresh.clone());
    let second = orch.run(qualify(&orch, event(PullRequestAction::Closed, true, "human1"))).await;

    assert!(matches!(second.state(), RunState::NoChanges));
    let transformation = second.transformation().unwrap();
    assert_eq!(transformation.files_converted().count(), 0);
    assert!(transformation.errors.is_empty());
    assert!(fresh.pull_requests().is_empty());
}
