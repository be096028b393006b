use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FerryError;
use crate::render::{MessageSpec, RenderDirective};

/// Repository name (e.g. "billing-api").
pub type RepoName = String;

/// Environment name (e.g. "dev", "test", "prod").
pub type EnvName = String;

// ── Deployment status ──

/// Status reported by source control for one deployment attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Queued,
    Pending,
    InProgress,
    Success,
    Failure,
    Error,
    Inactive,
}

impl DeploymentStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
            Self::Inactive => "inactive",
        }
    }

    /// The only status that updates environment pointers and opens an approval.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = FerryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "queued" => Self::Queued,
            "pending" => Self::Pending,
            "in_progress" => Self::InProgress,
            "success" => Self::Success,
            "failure" => Self::Failure,
            "error" => Self::Error,
            "inactive" => Self::Inactive,
            other => return Err(FerryError::invalid(format!("unknown status {other:?}"))),
        })
    }
}

// ── Approval ──

/// Human decision on a pending promotion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl FromStr for Decision {
    type Err = FerryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "approve" | "approved" => Ok(Self::Approve),
            "reject" | "rejected" | "deny" => Ok(Self::Reject),
            other => Err(FerryError::invalid(format!("unknown decision {other:?}"))),
        }
    }
}

/// Approval state of one deployment attempt.
///
/// `Pending` is entered only when the attempt reached `success` and the
/// environment has a successor in the promotion chain. The three decided
/// variants are terminal: a record carrying one never accepts another decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ApprovalState {
    #[default]
    NotRequested,
    Pending {
        next_env: EnvName,
    },
    Approved {
        actor: String,
        next_env: EnvName,
        decided_at: String,
    },
    Rejected {
        actor: String,
        decided_at: String,
    },
    SupersededRejected {
        superseded_by: String,
        decided_at: String,
    },
}

impl ApprovalState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Approved { .. } | Self::Rejected { .. } | Self::SupersededRejected { .. }
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::NotRequested => "not_requested",
            Self::Pending { .. } => "pending",
            Self::Approved { .. } => "approved",
            Self::Rejected { .. } => "rejected",
            Self::SupersededRejected { .. } => "superseded_rejected",
        }
    }
}

// ── Deployment records ──

/// Inbound status notification, normalized from the webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusUpdate {
    pub repo: RepoName,
    pub env: EnvName,
    pub deployment_id: String,
    pub status: DeploymentStatus,
    pub sha: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl StatusUpdate {
    /// Reject updates missing any identity field.
    pub fn validate(&self) -> Result<(), FerryError> {
        for (name, value) in [
            ("repo", &self.repo),
            ("env", &self.env),
            ("deployment_id", &self.deployment_id),
            ("sha", &self.sha),
        ] {
            if value.trim().is_empty() {
                return Err(FerryError::invalid(format!("missing {name}")));
            }
        }
        Ok(())
    }
}

/// The single "current" deployment per (repo, env).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub repo: RepoName,
    pub env: EnvName,
    pub deployment_id: String,
    pub sha: String,
    pub branch: String,
    pub owner: String,
    pub author: String,
    pub status: DeploymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub approval: ApprovalState,
    pub message: MessageSpec,
    /// Directives applied to `message` so far, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directives: Vec<RenderDirective>,
    /// Chat message reference, set once the first render was posted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_message_ref: Option<String>,
}

/// Why a deployment record left the "current" slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ArchiveReason {
    Superseded { by_deployment_id: String },
}

/// Write-once archival copy of a superseded deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentHistoryRecord {
    #[serde(flatten)]
    pub record: DeploymentRecord,
    pub archived_at: String,
    pub archived: ArchiveReason,
}

// ── Commits ──

/// Commit as delivered by a push notification, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewCommit {
    pub sha: String,
    /// Any RFC 3339 timestamp.
    pub committed_at: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_sha: Option<String>,
}

/// One commit per repository, immutable apart from enrichment fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitRecord {
    pub repo: RepoName,
    pub sha: String,
    /// Normalized UTC timestamp (see `clock::format_sortable`).
    pub committed_at: String,
    pub message: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_sha: Option<String>,
}

impl CommitRecord {
    /// First line of the commit message.
    pub fn title(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }

    pub fn short_sha(&self) -> &str {
        short_sha(&self.sha)
    }
}

/// Sparse sha → timestamp index entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitRef {
    pub sha: String,
    pub committed_at: String,
    /// Sort key of the matching `CommitRecord`.
    pub sort_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_sha: Option<String>,
}

// ── Environment pointers and releases ──

/// Last successful deployment of one repo in one environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvRepoEntry {
    pub sha: String,
    pub deployment_id: String,
    pub deployed_at: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Source of truth for environment diffs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EnvLatestPointer {
    pub env: EnvName,
    #[serde(default)]
    pub repos: BTreeMap<RepoName, EnvRepoEntry>,
}

/// Commit reference carried by a release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseCommit {
    pub sha: String,
    pub message: String,
}

impl From<&CommitRecord> for ReleaseCommit {
    fn from(c: &CommitRecord) -> Self {
        Self {
            sha: c.sha.clone(),
            message: c.message.clone(),
        }
    }
}

/// What shipped to (repo, env) at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseRecord {
    pub repo: RepoName,
    pub env: EnvName,
    pub sha: String,
    #[serde(default)]
    pub commits: Vec<ReleaseCommit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub released_on: String,
}

/// Request to advance an approved artifact to the next environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromotionRequest {
    pub repo: RepoName,
    pub owner: String,
    pub sha: String,
    pub source_env: EnvName,
    pub next_env: EnvName,
    pub deployment_id: String,
    pub approved_by: String,
    /// Sortable timestamp of the approval; names the promotion tag.
    #[serde(default)]
    pub approved_at: String,
}

pub fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!(
            "SUCCESS".parse::<DeploymentStatus>().unwrap(),
            DeploymentStatus::Success
        );
        assert_eq!(
            "in_progress".parse::<DeploymentStatus>().unwrap(),
            DeploymentStatus::InProgress
        );
        assert!("exploded".parse::<DeploymentStatus>().is_err());
    }

    #[test]
    fn approval_state_serializes_tagged() {
        let s = ApprovalState::Pending {
            next_env: "prod".into(),
        };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["state"], "pending");
        assert_eq!(v["next_env"], "prod");
        let back: ApprovalState = serde_json::from_value(v).unwrap();
        assert_eq!(back, s);
        assert!(!back.is_terminal());
    }

    #[test]
    fn decided_states_are_terminal() {
        let approved = ApprovalState::Approved {
            actor: "ana".into(),
            next_env: "prod".into(),
            decided_at: "2024-01-01T00:00:00.000Z".into(),
        };
        assert!(approved.is_terminal());
        assert!(ApprovalState::SupersededRejected {
            superseded_by: "d2".into(),
            decided_at: String::new(),
        }
        .is_terminal());
        assert!(!ApprovalState::NotRequested.is_terminal());
    }

    #[test]
    fn status_update_requires_identity() {
        let mut u = StatusUpdate {
            repo: "api".into(),
            env: "test".into(),
            deployment_id: "42".into(),
            status: DeploymentStatus::Pending,
            sha: "abc".into(),
            branch: String::new(),
            owner: String::new(),
            author: String::new(),
            url: None,
            created_at: None,
            updated_at: None,
        };
        assert!(u.validate().is_ok());
        u.deployment_id = "  ".into();
        let err = u.validate().unwrap_err();
        assert!(err.to_string().contains("deployment_id"));
    }

    #[test]
    fn decision_accepts_button_values() {
        assert_eq!("approved".parse::<Decision>().unwrap(), Decision::Approve);
        assert_eq!("rejected".parse::<Decision>().unwrap(), Decision::Reject);
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn commit_title_is_first_line() {
        let c = CommitRecord {
            repo: "api".into(),
            sha: "0123456789abcdef".into(),
            committed_at: "2024-01-01T00:00:00.000Z".into(),
            message: "fix: retry\n\nlonger body".into(),
            author: "ana".into(),
            summary: None,
            parent_sha: None,
        };
        assert_eq!(c.title(), "fix: retry");
        assert_eq!(c.short_sha(), "0123456");
        assert_eq!(short_sha("abc"), "abc");
    }
}
