//! Configuration for the webporizer bot.
//!
//! Settings are layered: built-in defaults, then an optional `webporizer.toml`,
//! then environment variables (a `.env` file is loaded first), then CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [github]
//! api_url = "https://api.github.com"
//! bot_login = "webporizer[bot]"
//!
//! [server]
//! port = 3000
//! webhook_path = "/api/webhook"
//!
//! [pipeline]
//! branch_prefix = "webporizer/webp"
//! stage_timeout_secs = 60
//! rollback_on_failure = true
//! greeting_path = "message.md"
//!
//! [transform]
//! image_extensions = ["jpg", "jpeg", "png"]
//! markup_extensions = ["html", "htm", "jsx", "tsx", "css", "md"]
//! ```
//!
//! Secrets (`GITHUB_TOKEN`, `WEBHOOK_SECRET`) normally come from the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bot::event::EventFilter;

pub const DEFAULT_CONFIG_FILE: &str = "webporizer.toml";
pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_BOT_LOGIN: &str = "webporizer[bot]";

/// `[github]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubSection {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Bearer token (installation or personal access token)
    #[serde(default)]
    pub token: Option<String>,
    /// Login the bot's own pull requests are authored by
    #[serde(default)]
    pub bot_login: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token: None,
            bot_login: None,
            webhook_secret: None,
        }
    }
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
}

fn default_port() -> u16 {
    3000
}

fn default_webhook_path() -> String {
    "/api/webhook".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            webhook_path: default_webhook_path(),
        }
    }
}

/// `[pipeline]` section.
///
/// Text templates accept `{number}`, `{branch}`, `{base}`, `{converted}`,
/// `{rewritten}` and `{pr_url}` placeholders where they make sense.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Open follow-up PRs against this branch instead of the merged PR's base
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    /// Parent directory for per-run working trees (system temp dir when unset)
    #[serde(default)]
    pub work_root: Option<PathBuf>,
    /// Delete branches left behind by a failed run
    #[serde(default = "default_rollback_on_failure")]
    pub rollback_on_failure: bool,
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
    #[serde(default = "default_pr_title")]
    pub pr_title: String,
    #[serde(default = "default_pr_body")]
    pub pr_body: String,
    #[serde(default = "default_merged_comment")]
    pub merged_comment: String,
    /// Inline greeting for newly opened pull requests; wins over `greeting_path`
    #[serde(default)]
    pub greeting_comment: Option<String>,
    #[serde(default = "default_greeting_path")]
    pub greeting_path: PathBuf,
}

fn default_branch_prefix() -> String {
    "webporizer/webp".to_string()
}

fn default_stage_timeout_secs() -> u64 {
    60
}

fn default_rollback_on_failure() -> bool {
    true
}

fn default_commit_message() -> String {
    "Convert images to WebP after #{number}".to_string()
}

fn default_pr_title() -> String {
    "Convert images to WebP (follow-up to #{number})".to_string()
}

fn default_pr_body() -> String {
    "Automated WebP conversion of images merged in #{number}.\n\n\
     **Converted:** {converted} file(s)\n**References updated:** {rewritten} file(s)\n\n\
     ---\n*Opened by webporizer*"
        .to_string()
}

fn default_merged_comment() -> String {
    "Thanks for the merge! WebP conversions are in {pr_url}".to_string()
}

fn default_greeting_path() -> PathBuf {
    PathBuf::from("message.md")
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            branch_prefix: default_branch_prefix(),
            base_branch: None,
            stage_timeout_secs: default_stage_timeout_secs(),
            work_root: None,
            rollback_on_failure: default_rollback_on_failure(),
            commit_message: default_commit_message(),
            pr_title: default_pr_title(),
            pr_body: default_pr_body(),
            merged_comment: default_merged_comment(),
            greeting_comment: None,
            greeting_path: default_greeting_path(),
        }
    }
}

/// `[transform]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformSection {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
    #[serde(default = "default_markup_extensions")]
    pub markup_extensions: Vec<String>,
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png"].iter().map(|s| s.to_string()).collect()
}

fn default_markup_extensions() -> Vec<String> {
    ["html", "htm", "jsx", "tsx", "css", "md"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for TransformSection {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
            markup_extensions: default_markup_extensions(),
        }
    }
}

/// Complete bot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub transform: TransformSection,
}

impl BotConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse webporizer.toml")
    }

    /// Load from `path` if given, else from `./webporizer.toml` when present,
    /// else defaults. Environment overrides are applied afterwards.
    pub fn load_layered(path: Option<&Path>) -> Result<Self> {
        // A missing .env is the normal case in production
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides through `lookup` (injectable for tests).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("GITHUB_TOKEN") {
            self.github.token = Some(token);
        }
        if let Some(secret) = lookup("WEBHOOK_SECRET") {
            self.github.webhook_secret = Some(secret);
        }
        if let Some(login) = lookup("BOT_LOGIN") {
            self.github.bot_login = Some(login);
        }
        if let Some(host) = lookup("ENTERPRISE_HOSTNAME").filter(|h| !h.is_empty()) {
            self.github.api_url = format!("https://{}/api/v3", host);
        }
        if let Some(url) = lookup("GITHUB_API_URL") {
            self.github.api_url = url;
        }
        if let Some(port) = lookup("PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(path) = lookup("GREETING_PATH") {
            self.pipeline.greeting_path = PathBuf::from(path);
        }
    }

    /// GitHub token, or an error naming the missing setting.
    pub fn require_token(&self) -> Result<&str> {
        self.github
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .context("GITHUB_TOKEN is not set (env or [github].token)")
    }

    /// Webhook secret, or an error naming the missing setting.
    pub fn require_webhook_secret(&self) -> Result<&str> {
        self.github
            .webhook_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .context("WEBHOOK_SECRET is not set (env or [github].webhook_secret)")
    }

    /// Configured bot login, or the GitHub App default.
    pub fn bot_login(&self) -> &str {
        self.github.bot_login.as_deref().unwrap_or(DEFAULT_BOT_LOGIN)
    }

    /// Filter that ignores the bot's own events: the configured login plus
    /// `authenticated`, the login the token resolved to. Also returns a warning
    /// when an explicitly configured login disagrees with `authenticated`.
    pub fn event_filter(&self, authenticated: Option<&str>) -> (EventFilter, Option<String>) {
        let filter = EventFilter::new(self.bot_login());
        let Some(login) = authenticated else {
            return (filter, None);
        };
        let warning = match self.github.bot_login.as_deref() {
            Some(configured) if !configured.eq_ignore_ascii_case(login) => Some(format!(
                "bot_login '{}' differs from the authenticated login '{}'; ignoring events from both",
                configured, login
            )),
            _ => None,
        };
        (filter.with_login(login), warning)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.stage_timeout_secs)
    }

    /// Greeting comment text: the inline template, else the greeting file.
    pub fn greeting(&self) -> Result<String> {
        if let Some(ref text) = self.pipeline.greeting_comment {
            return Ok(text.clone());
        }
        std::fs::read_to_string(&self.pipeline.greeting_path).with_context(|| {
            format!(
                "Failed to read greeting file: {}",
                self.pipeline.greeting_path.display()
            )
        })
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !self.server.webhook_path.starts_with('/') {
            warnings.push(format!(
                "webhook_path '{}' should start with '/'",
                self.server.webhook_path
            ));
        }
        if self.pipeline.stage_timeout_secs == 0 {
            warnings.push("stage_timeout_secs is 0; every remote call will time out".to_string());
        }
        if self.transform.image_extensions.is_empty() {
            warnings.push("No image extensions configured; nothing will be converted".to_string());
        }
        for ext in &self.transform.image_extensions {
            if ext.eq_ignore_ascii_case("webp") {
                warnings.push("'webp' listed as an image extension; it is the output format".to_string());
            }
        }
        if self.pipeline.branch_prefix.trim().is_empty() {
            warnings.push("branch_prefix is empty".to_string());
        }

        warnings
    }
}
