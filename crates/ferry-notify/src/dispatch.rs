//! Outbox delivery. Each drain hands pending events to their collaborator,
//! acking on success and leaving failures pending for the next drain.

use ferry_core::config::FerryConfig;
use ferry_core::error::{FerryError, FerryResult};
use ferry_core::event::{
    ChatRenderRequest, EventBus, OutboundEvent, OutboxReader, ReleaseComputed,
    TOPIC_CHAT_RENDER_REQUESTED, TOPIC_PROMOTION_REQUESTED, TOPIC_RELEASE_COMPUTED,
};
use ferry_core::ports::{ChatClient, SourceControl};
use ferry_core::types::PromotionRequest;
use ferry_ledger::{DeploymentTracker, ItemStore};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::promote::PromotionTrigger;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub delivered: usize,
    /// Left pending after a failed attempt.
    pub failed: usize,
    /// Acked without delivery: unknown topics and undecodable payloads.
    pub dropped: usize,
}

pub struct Dispatcher<'a> {
    outbox: &'a dyn OutboxReader,
    store: &'a dyn ItemStore,
    bus: &'a dyn EventBus,
    config: &'a FerryConfig,
    source: Option<&'a dyn SourceControl>,
    chat: Option<&'a dyn ChatClient>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        outbox: &'a dyn OutboxReader,
        store: &'a dyn ItemStore,
        bus: &'a dyn EventBus,
        config: &'a FerryConfig,
    ) -> Self {
        Self {
            outbox,
            store,
            bus,
            config,
            source: None,
            chat: None,
        }
    }

    pub fn with_source_control(mut self, source: Option<&'a dyn SourceControl>) -> Self {
        self.source = source;
        self
    }

    pub fn with_chat(mut self, chat: Option<&'a dyn ChatClient>) -> Self {
        self.chat = chat;
        self
    }

    /// Deliver up to `limit` pending events, oldest first.
    pub fn drain(&self, limit: usize) -> FerryResult<DrainReport> {
        let mut report = DrainReport::default();
        for pending in self.outbox.pending(limit)? {
            let event = &pending.event;
            match self.deliver(event) {
                Ok(()) => {
                    self.outbox.ack(&event.event_id)?;
                    report.delivered += 1;
                }
                Err(FerryError::InvalidEvent(msg)) => {
                    warn!(event_id = %event.event_id, topic = %event.topic, error = %msg, "dropping undeliverable event");
                    self.outbox.ack(&event.event_id)?;
                    report.dropped += 1;
                }
                Err(e) => {
                    warn!(
                        event_id = %event.event_id,
                        topic = %event.topic,
                        attempts = pending.attempts + 1,
                        error = %e,
                        "delivery failed"
                    );
                    self.outbox.nack(&event.event_id, &e.to_string())?;
                    report.failed += 1;
                }
            }
        }
        if report != DrainReport::default() {
            info!(
                delivered = report.delivered,
                failed = report.failed,
                dropped = report.dropped,
                "outbox drained"
            );
        }
        Ok(report)
    }

    fn deliver(&self, event: &OutboundEvent) -> FerryResult<()> {
        match event.topic.as_str() {
            TOPIC_PROMOTION_REQUESTED => self.promote(&event.decode()?),
            TOPIC_CHAT_RENDER_REQUESTED => self.render(&event.decode()?),
            TOPIC_RELEASE_COMPUTED => {
                let computed: ReleaseComputed = event.decode()?;
                info!(
                    repo = %computed.release.repo,
                    env = %computed.release.env,
                    sha = %computed.release.sha,
                    prior_sha = computed.prior_sha.as_deref().unwrap_or("-"),
                    commits = computed.release.commits.len(),
                    "release computed"
                );
                Ok(())
            }
            other => Err(FerryError::invalid(format!("unknown topic {other:?}"))),
        }
    }

    fn promote(&self, req: &PromotionRequest) -> FerryResult<()> {
        let source = self
            .source
            .ok_or_else(|| FerryError::Config("source control not configured".into()))?;
        PromotionTrigger::new(source, self.config).promote(req)?;
        Ok(())
    }

    fn render(&self, req: &ChatRenderRequest) -> FerryResult<()> {
        let Some(chat) = self.chat else {
            debug!("chat not configured; render skipped");
            return Ok(());
        };
        match req {
            ChatRenderRequest::Report { message } => {
                chat.post_message(message, &[])?;
                Ok(())
            }
            ChatRenderRequest::Deployment {
                repo,
                env,
                deployment_id,
            } => {
                let tracker = DeploymentTracker::new(
                    self.store,
                    self.bus,
                    &self.config.chain,
                    self.config.retention.deployment_history_days,
                );
                let Some(record) = tracker.find(repo, env, deployment_id)? else {
                    warn!(repo, env, deployment_id, "render for unknown deployment");
                    return Ok(());
                };
                match &record.chat_message_ref {
                    Some(message_ref) => {
                        chat.update_message(message_ref, &record.message, &record.directives)
                    }
                    None => {
                        let message_ref = chat.post_message(&record.message, &record.directives)?;
                        if !tracker.set_message_ref(repo, env, deployment_id, &message_ref)? {
                            debug!(repo, env, deployment_id, "message ref not stored; attempt no longer current");
                        }
                        Ok(())
                    }
                }
            }
        }
    }
}
