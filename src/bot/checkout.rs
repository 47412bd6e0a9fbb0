//! Local materialization of a remote commit into a per-run working directory.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::event::RepositoryRef;

/// Abstraction over fetching a commit's files for testability.
/// Real implementation: `GitCheckout`. Test double: `fakes::MemoryCheckout`.
#[async_trait]
pub trait Checkout: Send + Sync {
    /// Populate `dest` (an existing, empty directory) with the tree of `sha`.
    async fn materialize(&self, repo: &RepositoryRef, sha: &str, dest: &Path) -> Result<()>;
}

/// Shallow-fetches a single commit with the `git` CLI.
pub struct GitCheckout {
    web_url: String,
    token: String,
}

impl GitCheckout {
    /// `api_url` is the REST base (`https://api.github.com` or
    /// `https://{host}/api/v3`); the clone host is derived from it.
    pub fn new(api_url: &str, token: &str) -> Self {
        Self {
            web_url: web_url_from_api(api_url),
            token: token.to_string(),
        }
    }

    fn remote_url(&self, repo: &RepositoryRef) -> String {
        let host = self
            .web_url
            .strip_prefix("https://")
            .unwrap_or(&self.web_url);
        format!(
            "https://x-access-token:{}@{}/{}/{}.git",
            self.token, host, repo.owner, repo.name
        )
    }

    async fn git(&self, dest: &Path, args: &[&str]) -> Result<()> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run git")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).replace(&self.token, "***");
            anyhow::bail!("git {} failed: {}", args.first().unwrap_or(&""), stderr.trim());
        }
        Ok(())
    }
}

#[async_trait]
impl Checkout for GitCheckout {
    async fn materialize(&self, repo: &RepositoryRef, sha: &str, dest: &Path) -> Result<()> {
        let url = self.remote_url(repo);
        self.git(dest, &["init", "--quiet"]).await?;
        self.git(dest, &["fetch", "--quiet", "--depth", "1", &url, sha])
            .await
            .with_context(|| format!("Failed to fetch {} from {}", sha, repo))?;
        self.git(dest, &["checkout", "--quiet", "FETCH_HEAD"]).await?;
        tracing::debug!(%repo, sha, dest = %dest.display(), "materialized commit");
        Ok(())
    }
}

/// `https://api.github.com` → `https://github.com`,
/// `https://ghe.example.com/api/v3` → `https://ghe.example.com`.
pub fn web_url_from_api(api_url: &str) -> String {
    let trimmed = api_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://api.") {
        return format!("https://{}", rest);
    }
    trimmed
        .strip_suffix("/api/v3")
        .unwrap_or(trimmed)
        .to_string()
}
