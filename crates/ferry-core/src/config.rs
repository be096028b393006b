use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FerryError, FerryResult};

// ── Promotion chain ──

/// Ordered environments, lowest first (e.g. dev → test → prod).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct PromotionChain(Vec<String>);

impl Default for PromotionChain {
    fn default() -> Self {
        Self(vec!["dev".into(), "test".into(), "prod".into()])
    }
}

impl PromotionChain {
    pub fn new(envs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(envs.into_iter().map(Into::into).collect())
    }

    pub fn envs(&self) -> &[String] {
        &self.0
    }

    pub fn position(&self, env: &str) -> Option<usize> {
        self.0.iter().position(|e| e.eq_ignore_ascii_case(env))
    }

    /// Environment that follows `env`, if any.
    pub fn next(&self, env: &str) -> Option<&str> {
        let idx = self.position(env)?;
        self.0.get(idx + 1).map(String::as_str)
    }

    /// Order two environments as (lower, higher). Unknown names are rejected.
    pub fn order<'a>(&self, a: &'a str, b: &'a str) -> FerryResult<(&'a str, &'a str)> {
        let pa = self
            .position(a)
            .ok_or_else(|| FerryError::invalid(format!("unknown environment {a:?}")))?;
        let pb = self
            .position(b)
            .ok_or_else(|| FerryError::invalid(format!("unknown environment {b:?}")))?;
        match pa.cmp(&pb) {
            std::cmp::Ordering::Less => Ok((a, b)),
            std::cmp::Ordering::Greater => Ok((b, a)),
            std::cmp::Ordering::Equal => Err(FerryError::invalid(format!(
                "cannot diff {a:?} against itself"
            ))),
        }
    }
}

// ── Per-environment settings ──

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvSettings {
    /// Name of the environment variable holding this environment's bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_env: Option<String>,
    /// Passed to the deploy workflow as the `deploy_role` input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatSettings {
    #[serde(default = "default_chat_api")]
    pub api_url: String,
    pub channel: String,
    #[serde(default = "default_chat_token_env")]
    pub token_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SummarizerSettings {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Retention {
    #[serde(default = "default_commit_days")]
    pub commit_days: u32,
    #[serde(default = "default_history_days")]
    pub deployment_history_days: u32,
    #[serde(default = "default_release_days")]
    pub release_archive_days: u32,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            commit_days: default_commit_days(),
            deployment_history_days: default_history_days(),
            release_archive_days: default_release_days(),
        }
    }
}

// ── Top-level config ──

/// Workspace configuration (`.ferry/config.json`). Passed explicitly to the
/// components that need it; there is no process-wide copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FerryConfig {
    #[serde(default)]
    pub chain: PromotionChain,
    #[serde(default = "default_deploy_workflows")]
    pub deploy_workflows: Vec<String>,
    #[serde(default = "default_promotion_workflow")]
    pub promotion_workflow: String,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvSettings>,
    #[serde(default = "default_credential_env")]
    pub default_credential_env: String,
    #[serde(default)]
    pub excluded_repos: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat: Option<ChatSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarizer: Option<SummarizerSettings>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub retention: Retention,
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            chain: PromotionChain::default(),
            deploy_workflows: default_deploy_workflows(),
            promotion_workflow: default_promotion_workflow(),
            environments: BTreeMap::new(),
            default_credential_env: default_credential_env(),
            excluded_repos: Vec::new(),
            chat: None,
            summarizer: None,
            page_size: default_page_size(),
            retention: Retention::default(),
        }
    }
}

impl FerryConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> FerryResult<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(FerryError::Config(format!("{}: {e}", path.display()))),
        };
        Self::from_json(&content)
            .map_err(|e| FerryError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_json(content: &str) -> FerryResult<Self> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| FerryError::Config(e.to_string()))?;
        if config.chain.envs().is_empty() {
            return Err(FerryError::Config("chain must name at least one environment".into()));
        }
        if config.page_size == 0 {
            return Err(FerryError::Config("page_size must be positive".into()));
        }
        Ok(config)
    }

    pub fn env(&self, env: &str) -> Option<&EnvSettings> {
        self.environments.get(env)
    }

    pub fn is_tracked_workflow(&self, name: &str) -> bool {
        self.deploy_workflows.iter().any(|w| w == name)
    }

    /// Name of the variable holding the credential for `env`.
    pub fn credential_var(&self, env: &str) -> &str {
        self.env(env)
            .and_then(|s| s.credential_env.as_deref())
            .unwrap_or(&self.default_credential_env)
    }

    /// Resolve the bearer credential authorized to deploy into `env`.
    pub fn credential_for(&self, env: &str) -> FerryResult<Credential> {
        read_credential(self.credential_var(env), env)
    }

    /// Credential for read-only source-control calls not tied to an environment.
    pub fn default_credential(&self) -> FerryResult<Credential> {
        read_credential(&self.default_credential_env, "source control")
    }
}

fn read_credential(var: &str, purpose: &str) -> FerryResult<Credential> {
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(Credential(v)),
        _ => Err(FerryError::Config(format!(
            "no credential for {purpose}: ${var} is not set"
        ))),
    }
}

/// Bearer token. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

fn default_deploy_workflows() -> Vec<String> {
    vec!["Deploy".into(), "deploy-to-env".into()]
}

fn default_promotion_workflow() -> String {
    "deploy-to-env".into()
}

fn default_credential_env() -> String {
    "GITHUB_TOKEN".into()
}

fn default_chat_api() -> String {
    "https://slack.com/api".into()
}

fn default_chat_token_env() -> String {
    "SLACK_TOKEN".into()
}

fn default_page_size() -> usize {
    100
}

fn default_commit_days() -> u32 {
    30
}

fn default_history_days() -> u32 {
    60
}

fn default_release_days() -> u32 {
    30
}
