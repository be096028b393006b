//! Presentation-neutral message model.
//!
//! The core never builds chat markup. It produces a base [`MessageSpec`] and an
//! ordered list of [`RenderDirective`]s; the chat adapter applies them.

use serde::{Deserialize, Serialize};

use crate::types::{short_sha, ApprovalState, DeploymentStatus};

/// Base message for one deployment attempt (or a standalone report).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageSpec {
    pub headline: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<MessageField>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<Section>,
    /// Interactive approve/reject controls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controls: Option<ApprovalControls>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageField {
    pub label: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalControls {
    pub next_env: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    ReleaseSummary,
    PromotionPrep,
    InSync,
    RepoDiff,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Section {
    pub kind: SectionKind,
    pub title: String,
    pub body: String,
}

/// Where an inserted section lands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "at", content = "kind", rename_all = "snake_case")]
pub enum Anchor {
    /// Directly below the divider that separates the header from the body.
    Divider,
    /// Below the last section of this kind; the divider when there is none.
    After(SectionKind),
    End,
}

/// One mutation of a rendered message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RenderDirective {
    Insert { anchor: Anchor, section: Section },
    RemoveControls,
    AppendContext { text: String },
}

/// Inputs for the per-deployment message.
pub struct DeploymentMessage<'a> {
    pub repo: &'a str,
    pub env: &'a str,
    pub author: &'a str,
    pub owner: &'a str,
    pub status: DeploymentStatus,
    pub sha: &'a str,
    pub branch: &'a str,
    pub deployment_id: &'a str,
    pub url: Option<&'a str>,
    pub approval: &'a ApprovalState,
}

impl MessageSpec {
    /// Headline, commit and deployment fields, plus controls while approval is pending.
    pub fn for_deployment(m: &DeploymentMessage<'_>) -> Self {
        let mut headline = format!("{} deployment to {}", m.repo, m.env);
        if !m.author.is_empty() {
            headline.push_str(&format!(" by {}", m.author));
        }
        headline.push_str(&format!(": {}", m.status));

        let commit_value = if m.branch.is_empty() {
            short_sha(m.sha).to_string()
        } else {
            format!("{}: {}", m.branch, short_sha(m.sha))
        };
        let commit_link = (!m.owner.is_empty())
            .then(|| format!("https://github.com/{}/{}/commit/{}", m.owner, m.repo, m.sha));

        let fields = vec![
            MessageField {
                label: "Commit".into(),
                value: commit_value,
                link: commit_link,
            },
            MessageField {
                label: "Deployment".into(),
                value: m.deployment_id.to_string(),
                link: m.url.map(str::to_string),
            },
        ];

        let controls = match m.approval {
            ApprovalState::Pending { next_env } => Some(ApprovalControls {
                next_env: next_env.clone(),
            }),
            _ => None,
        };

        Self {
            headline,
            fields,
            sections: Vec::new(),
            controls,
        }
    }

    /// Standalone report (e.g. an environment diff) with no controls.
    pub fn report(headline: impl Into<String>, sections: Vec<Section>) -> Self {
        Self {
            headline: headline.into(),
            fields: Vec::new(),
            sections,
            controls: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(status: DeploymentStatus, approval: &ApprovalState) -> MessageSpec {
        MessageSpec::for_deployment(&DeploymentMessage {
            repo: "api",
            env: "test",
            author: "ana",
            owner: "acme",
            status,
            sha: "0123456789",
            branch: "main",
            deployment_id: "77",
            url: Some("https://ci.example/77"),
            approval,
        })
    }

    #[test]
    fn headline_and_fields() {
        let m = message(DeploymentStatus::InProgress, &ApprovalState::NotRequested);
        assert_eq!(m.headline, "api deployment to test by ana: in_progress");
        assert_eq!(m.fields[0].value, "main: 0123456");
        assert_eq!(
            m.fields[0].link.as_deref(),
            Some("https://github.com/acme/api/commit/0123456789")
        );
        assert_eq!(m.fields[1].link.as_deref(), Some("https://ci.example/77"));
        assert!(m.controls.is_none());
    }

    #[test]
    fn controls_only_while_pending() {
        let pending = ApprovalState::Pending {
            next_env: "prod".into(),
        };
        let m = message(DeploymentStatus::Success, &pending);
        assert_eq!(m.controls.unwrap().next_env, "prod");
    }

    #[test]
    fn directive_wire_shape() {
        let d = RenderDirective::Insert {
            anchor: Anchor::After(SectionKind::ReleaseSummary),
            section: Section {
                kind: SectionKind::PromotionPrep,
                title: "Prep for PROD".into(),
                body: "- abc fix".into(),
            },
        };
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["op"], "insert");
        assert_eq!(v["anchor"]["at"], "after");
        assert_eq!(v["anchor"]["kind"], "release_summary");
        assert_eq!(v["section"]["kind"], "promotion_prep");
    }
}
