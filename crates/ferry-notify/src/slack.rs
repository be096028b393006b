//! Slack Web API adapter. The only place render directives become chat blocks.

use ferry_core::config::{ChatSettings, Credential};
use ferry_core::error::{FerryError, FerryResult};
use ferry_core::ports::ChatClient;
use ferry_core::render::{Anchor, MessageField, MessageSpec, RenderDirective, SectionKind};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{agent, upstream};

/// Slack rejects section text longer than 3000 characters.
const MAX_SECTION_TEXT: usize = 2900;

pub struct SlackClient {
    agent: ureq::Agent,
    api_url: String,
    channel: String,
    token: Credential,
}

impl SlackClient {
    pub fn new(api_url: impl Into<String>, channel: impl Into<String>, token: Credential) -> Self {
        Self {
            agent: agent(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            channel: channel.into(),
            token,
        }
    }

    pub fn from_settings(settings: &ChatSettings) -> FerryResult<Self> {
        let token = std::env::var(&settings.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                FerryError::Config(format!("chat token ${} is not set", settings.token_env))
            })?;
        Ok(Self::new(
            &settings.api_url,
            &settings.channel,
            Credential::new(token),
        ))
    }

    fn call(&self, method: &str, body: &Value) -> anyhow::Result<SlackResponse> {
        let mut resp = self
            .agent
            .post(&format!("{}/{method}", self.api_url))
            .header("Authorization", &format!("Bearer {}", self.token.expose()))
            .header("Content-Type", "application/json; charset=utf-8")
            .send(body.to_string())?;
        let text = resp.body_mut().read_to_string()?;
        let parsed: SlackResponse = serde_json::from_str(&text)?;
        if !parsed.ok {
            anyhow::bail!(
                "{method}: {}",
                parsed.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(parsed)
    }
}

#[derive(Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

impl ChatClient for SlackClient {
    fn post_message(&self, spec: &MessageSpec, directives: &[RenderDirective]) -> FerryResult<String> {
        let body = json!({
            "channel": self.channel,
            "text": spec.headline,
            "blocks": render_blocks(spec, directives),
        });
        let resp = self
            .call("chat.postMessage", &body)
            .map_err(upstream("chat"))?;
        let ts = resp
            .ts
            .ok_or_else(|| FerryError::upstream("chat", "chat.postMessage returned no ts"))?;
        debug!(channel = %self.channel, ts = %ts, "chat message posted");
        Ok(ts)
    }

    fn update_message(
        &self,
        message_ref: &str,
        spec: &MessageSpec,
        directives: &[RenderDirective],
    ) -> FerryResult<()> {
        let body = json!({
            "channel": self.channel,
            "ts": message_ref,
            "text": spec.headline,
            "blocks": render_blocks(spec, directives),
        });
        self.call("chat.update", &body).map_err(upstream("chat"))?;
        debug!(channel = %self.channel, ts = message_ref, "chat message updated");
        Ok(())
    }
}

// ── Rendering ──

#[derive(Debug, Clone, PartialEq)]
enum Block {
    Headline(String),
    Fields(Vec<MessageField>),
    Divider,
    Section {
        kind: SectionKind,
        title: String,
        body: String,
    },
    Controls {
        next_env: String,
    },
    Context(String),
}

/// Lay out the base message, then apply each directive in order.
fn layout(spec: &MessageSpec, directives: &[RenderDirective]) -> Vec<Block> {
    let mut blocks = vec![Block::Headline(spec.headline.clone())];
    if !spec.fields.is_empty() {
        blocks.push(Block::Fields(spec.fields.clone()));
    }
    blocks.push(Block::Divider);
    blocks.extend(spec.sections.iter().map(|s| Block::Section {
        kind: s.kind,
        title: s.title.clone(),
        body: s.body.clone(),
    }));
    if let Some(controls) = &spec.controls {
        blocks.push(Block::Controls {
            next_env: controls.next_env.clone(),
        });
    }

    for directive in directives {
        match directive {
            RenderDirective::Insert { anchor, section } => {
                let at = insert_position(&blocks, anchor);
                blocks.insert(
                    at,
                    Block::Section {
                        kind: section.kind,
                        title: section.title.clone(),
                        body: section.body.clone(),
                    },
                );
            }
            RenderDirective::RemoveControls => {
                blocks.retain(|b| !matches!(b, Block::Controls { .. }));
            }
            RenderDirective::AppendContext { text } => blocks.push(Block::Context(text.clone())),
        }
    }
    blocks
}

fn insert_position(blocks: &[Block], anchor: &Anchor) -> usize {
    let below_divider = blocks
        .iter()
        .position(|b| matches!(b, Block::Divider))
        .map_or(blocks.len(), |i| i + 1);
    match anchor {
        Anchor::Divider => below_divider,
        Anchor::After(kind) => blocks
            .iter()
            .rposition(|b| matches!(b, Block::Section { kind: k, .. } if k == kind))
            .map_or(below_divider, |i| i + 1),
        Anchor::End => blocks.len(),
    }
}

fn mrkdwn(text: &str) -> Value {
    json!({ "type": "mrkdwn", "text": text })
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

fn field_text(field: &MessageField) -> String {
    match &field.link {
        Some(link) => format!("*{}:*\n<{link}|{}>", field.label, field.value),
        None => format!("*{}:*\n{}", field.label, field.value),
    }
}

/// Slack Block Kit JSON for a message and its directives.
pub fn render_blocks(spec: &MessageSpec, directives: &[RenderDirective]) -> Vec<Value> {
    layout(spec, directives)
        .into_iter()
        .map(|block| match block {
            Block::Headline(text) => json!({ "type": "section", "text": mrkdwn(&format!("*{text}*")) }),
            Block::Fields(fields) => json!({
                "type": "section",
                "fields": fields.iter().map(|f| mrkdwn(&field_text(f))).collect::<Vec<_>>(),
            }),
            Block::Divider => json!({ "type": "divider" }),
            Block::Section { title, body, .. } => json!({
                "type": "section",
                "text": mrkdwn(&truncate(&format!("*{title}*\n{body}"), MAX_SECTION_TEXT)),
            }),
            Block::Controls { next_env } => json!({
                "type": "actions",
                "elements": [
                    {
                        "type": "button",
                        "action_id": "approve",
                        "style": "primary",
                        "text": { "type": "plain_text", "text": format!("Promote to {}", next_env.to_uppercase()) },
                        "value": next_env,
                    },
                    {
                        "type": "button",
                        "action_id": "reject",
                        "style": "danger",
                        "text": { "type": "plain_text", "text": "Reject" },
                        "value": next_env,
                    }
                ],
            }),
            Block::Context(text) => json!({ "type": "context", "elements": [mrkdwn(&text)] }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::render::{ApprovalControls, Section};

    fn base() -> MessageSpec {
        MessageSpec {
            headline: "api deployment to dev by ana: success".into(),
            fields: vec![MessageField {
                label: "Commit".into(),
                value: "main: abc1234".into(),
                link: Some("https://github.com/acme/api/commit/abc1234".into()),
            }],
            sections: Vec::new(),
            controls: Some(ApprovalControls {
                next_env: "test".into(),
            }),
        }
    }

    fn section(kind: SectionKind, title: &str) -> Section {
        Section {
            kind,
            title: title.into(),
            body: "- abc1234 change".into(),
        }
    }

    fn titles(blocks: &[Block]) -> Vec<String> {
        blocks
            .iter()
            .map(|b| match b {
                Block::Headline(_) => "headline".to_string(),
                Block::Fields(_) => "fields".to_string(),
                Block::Divider => "divider".to_string(),
                Block::Section { title, .. } => title.clone(),
                Block::Controls { .. } => "controls".to_string(),
                Block::Context(text) => format!("context:{text}"),
            })
            .collect()
    }

    #[test]
    fn release_then_prep_land_below_divider() {
        let directives = vec![
            RenderDirective::Insert {
                anchor: Anchor::Divider,
                section: section(SectionKind::ReleaseSummary, "DEV Release Summary"),
            },
            RenderDirective::Insert {
                anchor: Anchor::After(SectionKind::ReleaseSummary),
                section: section(SectionKind::PromotionPrep, "Prep for TEST"),
            },
        ];
        let blocks = layout(&base(), &directives);
        assert_eq!(
            titles(&blocks),
            [
                "headline",
                "fields",
                "divider",
                "DEV Release Summary",
                "Prep for TEST",
                "controls"
            ]
        );
    }

    #[test]
    fn after_missing_kind_falls_back_to_divider() {
        let directives = vec![RenderDirective::Insert {
            anchor: Anchor::After(SectionKind::ReleaseSummary),
            section: section(SectionKind::PromotionPrep, "Prep for TEST"),
        }];
        let blocks = layout(&base(), &directives);
        assert_eq!(titles(&blocks)[3], "Prep for TEST");
    }

    #[test]
    fn decision_removes_controls_and_appends_context() {
        let directives = vec![
            RenderDirective::RemoveControls,
            RenderDirective::AppendContext {
                text: "Approved by bo".into(),
            },
        ];
        let blocks = layout(&base(), &directives);
        assert_eq!(
            titles(&blocks),
            ["headline", "fields", "divider", "context:Approved by bo"]
        );
    }

    #[test]
    fn block_kit_shape() {
        let blocks = render_blocks(&base(), &[]);
        assert_eq!(blocks[0]["text"]["text"], "*api deployment to dev by ana: success*");
        assert_eq!(
            blocks[1]["fields"][0]["text"],
            "*Commit:*\n<https://github.com/acme/api/commit/abc1234|main: abc1234>"
        );
        assert_eq!(blocks[2]["type"], "divider");
        assert_eq!(blocks[3]["type"], "actions");
        assert_eq!(blocks[3]["elements"][0]["text"]["text"], "Promote to TEST");
    }

    #[test]
    fn long_sections_are_truncated() {
        let mut spec = base();
        spec.sections.push(Section {
            kind: SectionKind::RepoDiff,
            title: "api".into(),
            body: "x".repeat(5000),
        });
        let blocks = render_blocks(&spec, &[]);
        let text = blocks[3]["text"]["text"].as_str().unwrap();
        assert_eq!(text.chars().count(), MAX_SECTION_TEXT + 1);
        assert!(text.ends_with('…'));
    }
}
