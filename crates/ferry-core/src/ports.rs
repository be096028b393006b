//! Outbound collaborators: source control, chat and summarization.
//!
//! Implementations live in `ferry-notify`; tests use in-memory fakes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::Credential;
use crate::error::FerryResult;
use crate::render::{MessageSpec, RenderDirective};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workflow {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangedFile {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

/// Commit as returned by source control, with its file changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitDetail {
    pub sha: String,
    pub message: String,
    #[serde(default)]
    pub files: Vec<ChangedFile>,
}

const LOCK_FILES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.lock",
    "poetry.lock",
    "Gemfile.lock",
    "composer.lock",
    "go.sum",
];

impl CommitDetail {
    /// Drop generated lock files; their diffs drown out the real change.
    pub fn without_lock_files(mut self) -> Self {
        self.files.retain(|f| {
            let name = f.filename.rsplit('/').next().unwrap_or(&f.filename);
            !LOCK_FILES.contains(&name)
        });
        self
    }
}

pub trait SourceControl: Send + Sync {
    /// Create `git_ref` at `sha`. Returns `false` when the ref already existed.
    fn create_ref(
        &self,
        credential: &Credential,
        owner: &str,
        repo: &str,
        git_ref: &str,
        sha: &str,
    ) -> FerryResult<bool>;

    fn list_workflows(
        &self,
        credential: &Credential,
        owner: &str,
        repo: &str,
    ) -> FerryResult<Vec<Workflow>>;

    fn dispatch_workflow(
        &self,
        credential: &Credential,
        owner: &str,
        repo: &str,
        workflow_id: u64,
        git_ref: &str,
        inputs: &BTreeMap<String, String>,
    ) -> FerryResult<()>;

    fn fetch_commit(
        &self,
        credential: &Credential,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> FerryResult<CommitDetail>;
}

pub trait ChatClient: Send + Sync {
    /// Post a new message; returns its reference for later updates.
    fn post_message(&self, spec: &MessageSpec, directives: &[RenderDirective])
        -> FerryResult<String>;

    fn update_message(
        &self,
        message_ref: &str,
        spec: &MessageSpec,
        directives: &[RenderDirective],
    ) -> FerryResult<()>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SummaryKind {
    Commit,
    Release,
    PromotionPrep,
}

pub trait Summarizer: Send + Sync {
    fn summarize(&self, kind: SummaryKind, payload: &serde_json::Value) -> FerryResult<String>;
}

/// Summarize, swallowing failures. Summaries are annotations, never state.
pub fn best_effort_summary(
    summarizer: Option<&dyn Summarizer>,
    kind: SummaryKind,
    payload: &serde_json::Value,
) -> Option<String> {
    let summarizer = summarizer?;
    match summarizer.summarize(kind, payload) {
        Ok(text) if !text.trim().is_empty() => Some(text),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(?kind, error = %e, "summary omitted");
            None
        }
    }
}
