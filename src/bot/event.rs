//! Pull-request events and the entry filter that gates every pipeline run.

use serde::{Deserialize, Serialize};

use crate::errors::WebhookError;

/// Identifies a remote repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub owner: String,
    pub name: String,
}

impl RepositoryRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestAction {
    Opened,
    Closed,
    Other(String),
}

impl PullRequestAction {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Opened => "opened",
            Self::Closed => "closed",
            Self::Other(action) => action,
        }
    }
}

impl From<&str> for PullRequestAction {
    fn from(s: &str) -> Self {
        match s {
            "opened" => Self::Opened,
            "closed" => Self::Closed,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A parsed `pull_request` webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestEvent {
    pub action: PullRequestAction,
    pub merged: bool,
    pub number: u64,
    pub author: String,
    pub title: String,
    pub repository: RepositoryRef,
    pub base_ref: String,
    pub base_sha: String,
}

// ── Webhook payload (subset of fields we care about) ──────────────────

#[derive(Deserialize)]
struct Payload {
    action: String,
    pull_request: PayloadPullRequest,
    repository: PayloadRepository,
}

#[derive(Deserialize)]
struct PayloadPullRequest {
    number: u64,
    #[serde(default)]
    merged: Option<bool>,
    #[serde(default)]
    title: String,
    user: PayloadUser,
    base: PayloadBase,
}

#[derive(Deserialize)]
struct PayloadUser {
    login: String,
}

#[derive(Deserialize)]
struct PayloadBase {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: String,
}

#[derive(Deserialize)]
struct PayloadRepository {
    name: String,
    owner: PayloadUser,
}

impl PullRequestEvent {
    /// Parse the JSON body of a `pull_request` delivery.
    pub fn from_payload(body: &[u8]) -> Result<Self, WebhookError> {
        let payload: Payload =
            serde_json::from_slice(body).map_err(|e| WebhookError::Payload(e.to_string()))?;
        let pr = payload.pull_request;
        Ok(Self {
            action: PullRequestAction::from(payload.action.as_str()),
            merged: pr.merged.unwrap_or(false),
            number: pr.number,
            author: pr.user.login,
            title: pr.title,
            repository: RepositoryRef::new(payload.repository.owner.login, payload.repository.name),
            base_ref: pr.base.git_ref,
            base_sha: pr.base.sha,
        })
    }
}

// ── Filter ────────────────────────────────────────────────────────────

/// What a qualified event asks the pipeline to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// Newly opened pull request: post the greeting comment.
    Greeting,
    /// Merged pull request: convert, commit and open a follow-up PR.
    Transform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    SelfAuthored,
    UnsubscribedAction,
    ClosedWithoutMerge,
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IgnoreReason::SelfAuthored => write!(f, "authored by the bot itself"),
            IgnoreReason::UnsubscribedAction => write!(f, "unsubscribed action"),
            IgnoreReason::ClosedWithoutMerge => write!(f, "closed without merge"),
        }
    }
}

/// An event that passed the filter. Only `EventFilter::evaluate` builds one,
/// so holding a `QualifiedEvent` proves the identity check already ran.
#[derive(Debug, Clone)]
pub struct QualifiedEvent {
    event: PullRequestEvent,
    kind: RunKind,
}

impl QualifiedEvent {
    pub fn event(&self) -> &PullRequestEvent {
        &self.event
    }

    pub fn kind(&self) -> RunKind {
        self.kind
    }
}

#[derive(Debug, Clone)]
pub enum FilterDecision {
    Proceed(QualifiedEvent),
    Ignore(IgnoreReason),
}

/// Classifies inbound events. Pure; no side effects.
///
/// Events authored by any of the bot's logins are ignored. That is the
/// configured login plus, when known, the login the token authenticates as.
#[derive(Debug, Clone)]
pub struct EventFilter {
    logins: Vec<String>,
}

impl EventFilter {
    pub fn new(bot_login: impl Into<String>) -> Self {
        Self {
            logins: vec![bot_login.into()],
        }
    }

    /// Also treat events by `login` as self-authored.
    pub fn with_login(mut self, login: impl Into<String>) -> Self {
        let login = login.into();
        if !self.is_bot(&login) {
            self.logins.push(login);
        }
        self
    }

    pub fn logins(&self) -> &[String] {
        &self.logins
    }

    // GitHub logins are case-insensitive
    fn is_bot(&self, author: &str) -> bool {
        self.logins.iter().any(|login| login.eq_ignore_ascii_case(author))
    }

    pub fn evaluate(&self, event: PullRequestEvent) -> FilterDecision {
        if self.is_bot(&event.author) {
            return FilterDecision::Ignore(IgnoreReason::SelfAuthored);
        }
        let kind = match event.action {
            PullRequestAction::Opened => RunKind::Greeting,
            PullRequestAction::Closed if event.merged => RunKind::Transform,
            PullRequestAction::Closed => return FilterDecision::Ignore(IgnoreReason::ClosedWithoutMerge),
            PullRequestAction::Other(_) => {
                return FilterDecision::Ignore(IgnoreReason::UnsubscribedAction);
            }
        };
        FilterDecision::Proceed(QualifiedEvent { event, kind })
    }
}

#[cfg(test)]
pub(crate) fn sample_event(action: PullRequestAction, merged: bool, author: &str) -> PullRequestEvent {
    PullRequestEvent {
        action,
        merged,
        number: 42,
        author: author.to_string(),
        title: "Add landing page".to_string(),
        repository: RepositoryRef::new("acme", "site"),
        base_ref: "main".to_string(),
        base_sha: "abc123".to_string(),
    }
}
