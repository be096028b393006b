//! Adapters for ferry's external collaborators and delivery of derived events.
//!
//! Everything here talks HTTP through a short-timeout `ureq` agent. Failures
//! surface as [`FerryError::UpstreamUnavailable`] and never roll back state the
//! ledger already recorded.

use std::time::Duration;

use ferry_core::config::FerryConfig;
use ferry_core::error::FerryError;
use ferry_core::ports::{ChatClient, SourceControl, Summarizer};
use tracing::warn;

pub mod dispatch;
pub mod github;
pub mod promote;
pub mod slack;
pub mod summarize;

pub use dispatch::{DrainReport, Dispatcher};
pub use github::GitHubClient;
pub use promote::{PromoteOutcome, PromotionTrigger};
pub use slack::SlackClient;
pub use summarize::HttpSummarizer;

const TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn agent() -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(TIMEOUT))
        .build()
        .new_agent()
}

pub(crate) fn upstream(service: &'static str) -> impl Fn(anyhow::Error) -> FerryError {
    move |e| FerryError::upstream(service, format!("{e:#}"))
}

/// Collaborators built from the workspace configuration.
///
/// Chat and summarization are optional: a missing section or token disables
/// them with a warning rather than failing startup.
pub struct Collaborators {
    pub source: GitHubClient,
    pub chat: Option<SlackClient>,
    pub summarizer: Option<HttpSummarizer>,
}

impl Collaborators {
    pub fn from_config(config: &FerryConfig) -> Self {
        let chat = config.chat.as_ref().and_then(|settings| {
            match SlackClient::from_settings(settings) {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!(error = %e, "chat disabled");
                    None
                }
            }
        });
        let summarizer = config.summarizer.as_ref().and_then(|settings| {
            match HttpSummarizer::from_settings(settings) {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!(error = %e, "summarizer disabled");
                    None
                }
            }
        });
        Self {
            source: GitHubClient::new(),
            chat,
            summarizer,
        }
    }

    pub fn source(&self) -> Option<&dyn SourceControl> {
        Some(&self.source)
    }

    pub fn chat(&self) -> Option<&dyn ChatClient> {
        self.chat.as_ref().map(|c| c as &dyn ChatClient)
    }

    pub fn summarizer(&self) -> Option<&dyn Summarizer> {
        self.summarizer.as_ref().map(|s| s as &dyn Summarizer)
    }
}
