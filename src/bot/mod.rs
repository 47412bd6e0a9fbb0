//! Pull-request bot: webhook in, follow-up pull request out.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐  POST   ┌──────────────────────────────────────────────────┐
//! │  GitHub  │ ──────> │  server.rs  (axum Router, AppState)              │
//! │ webhooks │         │    ├─ signature.rs  (X-Hub-Signature-256)        │
//! └──────────┘         │    └─ event.rs  (payload → PullRequestEvent,     │
//!                      │                  EventFilter → QualifiedEvent)   │
//!                      │         │                                        │
//!                      │         │ Orchestrator::dispatch()               │
//!                      │         v                                        │
//!                      │  pipeline.rs  (Orchestrator, PipelineRun)        │
//!                      │         │                                        │
//!                      │         ├─ branch.rs     (BranchNamer)           │
//!                      │         ├─ checkout.rs   (Checkout trait, git)   │
//!                      │         ├─ transform.rs  (TransformEngine)       │
//!                      │         ├─ mutator.rs    (RepositoryMutator,     │
//!                      │         │                 Compensations)         │
//!                      │         └─ publisher.rs  (PullRequestPublisher)  │
//!                      │                  │                               │
//!                      │                  v                               │
//!                      │  store.rs  (VersionedStore trait)                │
//!                      │    └─ github.rs  (GitHubClient, REST v3)         │
//!                      └──────────────────────────────────────────────────┘
//! ```
//!
//! `fakes` holds in-memory doubles for `VersionedStore`, `Checkout` and
//! `Converter`, used by unit and integration tests.
//!
//! ## Typical Run (merged pull request)
//!
//! 1. `POST /api/webhook` passes signature verification and parses into a
//!    `PullRequestEvent`.
//! 2. `EventFilter::evaluate` drops bot-authored and unmerged events; the
//!    rest become a `QualifiedEvent` and get a spawned `PipelineRun`.
//! 3. A fresh branch is created from the base tip, recording a
//!    `DeleteBranch` compensation.
//! 4. The base commit is fetched into a per-run temp dir and transformed on
//!    the blocking pool.
//! 5. Changed files become blobs and a tree on top of the base tree; the
//!    commit is created and the branch fast-forwarded to it.
//! 6. The follow-up PR is opened and the merged PR gets a comment linking it.

pub mod branch;
pub mod checkout;
pub mod event;
pub mod fakes;
pub mod github;
pub mod mutator;
pub mod pipeline;
pub mod publisher;
pub mod server;
pub mod signature;
pub mod store;
pub mod transform;
