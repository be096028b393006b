//! Source-control webhook payloads, normalized into ledger inputs.
//!
//! Every field is optional on the wire so a malformed payload becomes an
//! `InvalidEvent` (400) instead of an extractor rejection.

use ferry_core::config::FerryConfig;
use ferry_core::error::{FerryError, FerryResult};
use ferry_core::types::{DeploymentStatus, NewCommit, StatusUpdate};
use ferry_ledger::CommitPush;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Account {
    #[serde(default)]
    login: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

impl Account {
    fn handle(&self) -> Option<&str> {
        self.login.as_deref().or(self.name.as_deref())
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Repository {
    #[serde(default)]
    name: String,
    #[serde(default)]
    owner: Account,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Named {
    #[serde(default)]
    name: Option<String>,
}

// ── deployment_status ──

#[derive(Debug, Deserialize)]
pub(crate) struct DeploymentStatusPayload {
    #[serde(default)]
    deployment_status: Option<StatusBody>,
    #[serde(default)]
    deployment: Option<DeploymentBody>,
    #[serde(default)]
    repository: Repository,
    #[serde(default)]
    sender: Account,
    #[serde(default)]
    workflow: Option<Named>,
    #[serde(default)]
    workflow_run: Option<Named>,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    state: String,
    #[serde(default)]
    environment: Option<String>,
    #[serde(default)]
    target_url: Option<String>,
    #[serde(default)]
    log_url: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeploymentBody {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    sha: String,
    #[serde(rename = "ref", default)]
    git_ref: String,
    #[serde(default)]
    environment: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

pub(crate) enum WebhookVerdict {
    Track(FerryResult<StatusUpdate>),
    /// Acknowledged without effect.
    Ignore(String),
}

impl DeploymentStatusPayload {
    fn workflow_name(&self) -> Option<&str> {
        self.workflow
            .as_ref()
            .and_then(|w| w.name.as_deref())
            .or_else(|| self.workflow_run.as_ref().and_then(|w| w.name.as_deref()))
    }

    /// Only human-triggered runs of a tracked deploy workflow are recorded.
    pub(crate) fn verdict(self, config: &FerryConfig) -> WebhookVerdict {
        if self.sender.kind.as_deref() != Some("User") {
            return WebhookVerdict::Ignore(format!(
                "sender type {} is not a user",
                self.sender.kind.as_deref().unwrap_or("unknown")
            ));
        }
        match self.workflow_name() {
            Some(name) if config.is_tracked_workflow(name) => {}
            Some(name) => {
                return WebhookVerdict::Ignore(format!("workflow {name:?} is not tracked"))
            }
            None => return WebhookVerdict::Ignore("no workflow in payload".into()),
        }
        WebhookVerdict::Track(self.into_update())
    }

    fn into_update(self) -> FerryResult<StatusUpdate> {
        let status = self
            .deployment_status
            .ok_or_else(|| FerryError::invalid("missing deployment_status"))?;
        let deployment = self
            .deployment
            .ok_or_else(|| FerryError::invalid("missing deployment"))?;
        let deployment_id = match deployment.id {
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(serde_json::Value::String(s)) => s,
            _ => return Err(FerryError::invalid("missing deployment id")),
        };
        let env = status
            .environment
            .or(deployment.environment)
            .unwrap_or_default();
        let update = StatusUpdate {
            repo: self.repository.name,
            env,
            deployment_id,
            status: status.state.parse::<DeploymentStatus>()?,
            sha: deployment.sha,
            branch: deployment.git_ref,
            owner: self
                .repository
                .owner
                .handle()
                .unwrap_or_default()
                .to_string(),
            author: self.sender.handle().unwrap_or_default().to_string(),
            url: status.target_url.or(status.log_url),
            created_at: deployment.created_at,
            updated_at: status.updated_at,
        };
        update.validate()?;
        Ok(update)
    }
}

// ── push ──

#[derive(Debug, Deserialize)]
pub(crate) struct PushPayload {
    #[serde(default)]
    before: Option<String>,
    #[serde(default)]
    repository: Repository,
    #[serde(default)]
    commits: Vec<PushedCommit>,
}

#[derive(Debug, Deserialize)]
struct PushedCommit {
    #[serde(default)]
    id: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    author: Account,
}

impl PushPayload {
    pub(crate) fn into_push(self) -> FerryResult<CommitPush> {
        if self.repository.name.trim().is_empty() {
            return Err(FerryError::invalid("push without repository"));
        }
        // A branch creation reports an all-zero `before`.
        let before = self
            .before
            .filter(|b| !b.is_empty() && !b.bytes().all(|c| c == b'0'));
        let owner = self
            .repository
            .owner
            .handle()
            .unwrap_or_default()
            .to_string();
        let commits = self
            .commits
            .into_iter()
            .map(|c| NewCommit {
                author: c.author.handle().unwrap_or_default().to_string(),
                sha: c.id,
                committed_at: c.timestamp,
                message: c.message,
                summary: None,
                parent_sha: None,
            })
            .collect();
        Ok(CommitPush {
            repo: self.repository.name,
            owner,
            before,
            commits,
        })
    }
}
