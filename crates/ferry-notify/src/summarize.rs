use ferry_core::config::{Credential, SummarizerSettings};
use ferry_core::error::{FerryError, FerryResult};
use ferry_core::ports::{Summarizer, SummaryKind};
use serde::Deserialize;

use crate::{agent, upstream};

/// Posts `{kind, payload}` to a summarization endpoint and expects
/// `{"summary": "..."}` back.
pub struct HttpSummarizer {
    agent: ureq::Agent,
    url: String,
    token: Option<Credential>,
}

#[derive(Deserialize)]
struct SummaryResponse {
    #[serde(default)]
    summary: String,
}

impl HttpSummarizer {
    pub fn new(url: impl Into<String>, token: Option<Credential>) -> Self {
        Self {
            agent: agent(),
            url: url.into(),
            token,
        }
    }

    pub fn from_settings(settings: &SummarizerSettings) -> FerryResult<Self> {
        let token = match &settings.token_env {
            Some(var) => Some(
                std::env::var(var)
                    .ok()
                    .filter(|t| !t.trim().is_empty())
                    .map(Credential::new)
                    .ok_or_else(|| {
                        FerryError::Config(format!("summarizer token ${var} is not set"))
                    })?,
            ),
            None => None,
        };
        Ok(Self::new(&settings.url, token))
    }

    fn request(&self, kind: SummaryKind, payload: &serde_json::Value) -> anyhow::Result<String> {
        let body = serde_json::json!({ "kind": kind, "payload": payload });
        let mut req = self
            .agent
            .post(&self.url)
            .header("Content-Type", "application/json");
        if let Some(token) = &self.token {
            req = req.header("Authorization", &format!("Bearer {}", token.expose()));
        }
        let mut resp = req.send(body.to_string())?;
        let text = resp.body_mut().read_to_string()?;
        parse_summary(&text)
    }
}

fn parse_summary(body: &str) -> anyhow::Result<String> {
    let parsed: SummaryResponse = serde_json::from_str(body)?;
    Ok(parsed.summary.trim().to_string())
}

impl Summarizer for HttpSummarizer {
    fn summarize(&self, kind: SummaryKind, payload: &serde_json::Value) -> FerryResult<String> {
        self.request(kind, payload).map_err(upstream("summarizer"))
    }
}
