//! Derived events and the outbox seam they travel through.

use serde::{Deserialize, Serialize};

use crate::clock::now_sortable;
use crate::error::{FerryError, FerryResult};
use crate::render::MessageSpec;
use crate::types::{EnvName, ReleaseCommit, ReleaseRecord, RepoName};

pub const TOPIC_RELEASE_COMPUTED: &str = "release.computed";
pub const TOPIC_PROMOTION_REQUESTED: &str = "promotion.requested";
pub const TOPIC_CHAT_RENDER_REQUESTED: &str = "chat.render.requested";

/// Envelope for every event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundEvent {
    pub event_id: String,
    pub ts: String,
    pub topic: String,
    /// Events sharing a dedup key are enqueued at most once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    pub payload: serde_json::Value,
}

impl OutboundEvent {
    /// Decode the payload into its typed form.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> FerryResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            FerryError::invalid(format!("{} payload of {}: {e}", self.topic, self.event_id))
        })
    }
}

fn new_event_id() -> String {
    format!("evt_{}", ulid::Ulid::new().to_string().to_lowercase())
}

/// Build an event with a fresh id and timestamp.
pub fn new_event(
    topic: &str,
    dedup_key: Option<String>,
    payload: &impl Serialize,
) -> FerryResult<OutboundEvent> {
    let payload = serde_json::to_value(payload)
        .map_err(|e| FerryError::invalid(format!("unserializable {topic} payload: {e}")))?;
    Ok(OutboundEvent {
        event_id: new_event_id(),
        ts: now_sortable(),
        topic: topic.to_string(),
        dedup_key,
        payload,
    })
}

pub fn promotion_dedup_key(repo: &str, env: &str, deployment_id: &str) -> String {
    format!("promotion:{repo}:{env}:{deployment_id}")
}

pub fn release_dedup_key(repo: &str, env: &str, sha: &str) -> String {
    format!("release:{repo}:{env}:{sha}")
}

// ── Payloads ──

/// What a chat render should show.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum ChatRenderRequest {
    /// Re-render the message owned by one deployment attempt from its stored record.
    Deployment {
        repo: RepoName,
        env: EnvName,
        deployment_id: String,
    },
    /// Post a standalone message.
    Report { message: MessageSpec },
}

/// Commits that would ship if the release were promoted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromotionPrep {
    pub next_env: EnvName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_sha: Option<String>,
    pub commits: Vec<ReleaseCommit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseComputed {
    pub release: ReleaseRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_sha: Option<String>,
    pub deployment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prep: Option<PromotionPrep>,
}

// ── Seams ──

/// Publishes derived events. At-least-once; no ordering across topics.
pub trait EventBus {
    /// Returns `false` when an event with the same dedup key was already enqueued.
    fn publish(&self, event: &OutboundEvent) -> FerryResult<bool>;
}

/// An outbox entry awaiting delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub event: OutboundEvent,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Consumer side of the outbox.
pub trait OutboxReader {
    /// Oldest undelivered events first.
    fn pending(&self, limit: usize) -> FerryResult<Vec<PendingEvent>>;
    fn ack(&self, event_id: &str) -> FerryResult<()>;
    /// Record a failed delivery; the event stays pending.
    fn nack(&self, event_id: &str, error: &str) -> FerryResult<()>;
}
