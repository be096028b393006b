use std::collections::BTreeMap;

use ferry_core::config::Credential;
use ferry_core::error::FerryResult;
use ferry_core::ports::{ChangedFile, CommitDetail, SourceControl, Workflow};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{agent, upstream};

const DEFAULT_API: &str = "https://api.github.com";

/// GitHub REST client. Credentials are passed per call so one client serves
/// every environment.
pub struct GitHubClient {
    agent: ureq::Agent,
    api_url: String,
}

impl Default for GitHubClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GitHubClient {
    pub fn new() -> Self {
        Self::with_api_url(DEFAULT_API)
    }

    pub fn with_api_url(api_url: impl Into<String>) -> Self {
        Self {
            agent: agent(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn repo_url(&self, owner: &str, repo: &str, path: &str) -> String {
        format!("{}/repos/{owner}/{repo}/{path}", self.api_url)
    }

    fn get(&self, credential: &Credential, url: &str) -> anyhow::Result<String> {
        let mut resp = self
            .agent
            .get(url)
            .header("Authorization", &format!("Bearer {}", credential.expose()))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "ferry")
            .call()?;
        Ok(resp.body_mut().read_to_string()?)
    }

    fn post(&self, credential: &Credential, url: &str, body: &serde_json::Value) -> anyhow::Result<()> {
        self.agent
            .post(url)
            .header("Authorization", &format!("Bearer {}", credential.expose()))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "ferry")
            .header("Content-Type", "application/json")
            .send(body.to_string())?;
        Ok(())
    }
}

impl SourceControl for GitHubClient {
    fn create_ref(
        &self,
        credential: &Credential,
        owner: &str,
        repo: &str,
        git_ref: &str,
        sha: &str,
    ) -> FerryResult<bool> {
        let url = self.repo_url(owner, repo, "git/refs");
        match self.post(credential, &url, &serde_json::json!({ "ref": git_ref, "sha": sha })) {
            Ok(()) => {
                info!(repo, git_ref, sha, "ref created");
                Ok(true)
            }
            // 422: the ref exists already, typically from an earlier attempt.
            Err(e) if matches!(e.downcast_ref::<ureq::Error>(), Some(ureq::Error::StatusCode(422))) => {
                info!(repo, git_ref, sha, "ref already exists");
                Ok(false)
            }
            Err(e) => Err(upstream("github")(e)),
        }
    }

    fn list_workflows(
        &self,
        credential: &Credential,
        owner: &str,
        repo: &str,
    ) -> FerryResult<Vec<Workflow>> {
        let url = self.repo_url(owner, repo, "actions/workflows?per_page=100");
        let body = self.get(credential, &url).map_err(upstream("github"))?;
        parse_workflows(&body).map_err(upstream("github"))
    }

    fn dispatch_workflow(
        &self,
        credential: &Credential,
        owner: &str,
        repo: &str,
        workflow_id: u64,
        git_ref: &str,
        inputs: &BTreeMap<String, String>,
    ) -> FerryResult<()> {
        let url = self.repo_url(owner, repo, &format!("actions/workflows/{workflow_id}/dispatches"));
        self.post(
            credential,
            &url,
            &serde_json::json!({ "ref": git_ref, "inputs": inputs }),
        )
        .map_err(upstream("github"))?;
        info!(repo, workflow_id, git_ref, "workflow dispatched");
        Ok(())
    }

    fn fetch_commit(
        &self,
        credential: &Credential,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> FerryResult<CommitDetail> {
        let url = self.repo_url(owner, repo, &format!("commits/{sha}"));
        let body = self.get(credential, &url).map_err(upstream("github"))?;
        let detail = parse_commit(&body).map_err(upstream("github"))?;
        debug!(repo, sha, files = detail.files.len(), "commit detail fetched");
        Ok(detail)
    }
}

// ── Response shapes ──

#[derive(Deserialize)]
struct WorkflowList {
    #[serde(default)]
    workflows: Vec<Workflow>,
}

#[derive(Deserialize)]
struct CommitResponse {
    sha: String,
    commit: CommitInner,
    #[serde(default)]
    files: Vec<ChangedFile>,
}

#[derive(Deserialize)]
struct CommitInner {
    #[serde(default)]
    message: String,
}

fn parse_workflows(body: &str) -> anyhow::Result<Vec<Workflow>> {
    let list: WorkflowList = serde_json::from_str(body)?;
    Ok(list.workflows)
}

fn parse_commit(body: &str) -> anyhow::Result<CommitDetail> {
    let resp: CommitResponse = serde_json::from_str(body)?;
    Ok(CommitDetail {
        sha: resp.sha,
        message: resp.commit.message,
        files: resp.files,
    })
}
