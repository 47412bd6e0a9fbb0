//! Branch names for pipeline runs.

use std::sync::Mutex;

use serde::Serialize;

/// Name of a branch created by one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BranchIdentifier {
    pub name: String,
}

impl BranchIdentifier {
    /// Fully qualified ref, e.g. `refs/heads/webporizer/webp-...`.
    pub fn git_ref(&self) -> String {
        format!("refs/heads/{}", self.name)
    }
}

impl std::fmt::Display for BranchIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Produces `{prefix}-{micros}-{counter}` names.
///
/// Create one per process and share it (`Arc<BranchNamer>`); the counter is
/// what makes names unique when two runs start within the same microsecond.
#[derive(Debug)]
pub struct BranchNamer {
    prefix: String,
    counter: Mutex<u64>,
}

impl BranchNamer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: Mutex::new(0),
        }
    }

    pub fn next(&self) -> BranchIdentifier {
        let seq = {
            // A poisoned counter is still a valid u64
            let mut counter = self.counter.lock().unwrap_or_else(|e| e.into_inner());
            *counter += 1;
            *counter
        };
        let micros = chrono::Utc::now().timestamp_micros();
        BranchIdentifier {
            name: format!("{}-{}-{}", self.prefix, micros, seq),
        }
    }
}
