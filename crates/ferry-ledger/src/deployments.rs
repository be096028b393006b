//! Deployment state tracker: the single current deployment per (repo, env),
//! supersession into write-once history, and duplicate-delivery suppression.

use ferry_core::clock::{expires_in_days, normalize_timestamp, now_sortable};
use ferry_core::config::PromotionChain;
use ferry_core::error::{FerryError, FerryResult};
use ferry_core::event::{new_event, ChatRenderRequest, EventBus, TOPIC_CHAT_RENDER_REQUESTED};
use ferry_core::render::{DeploymentMessage, MessageSpec, RenderDirective};
use ferry_core::types::{
    ApprovalState, ArchiveReason, DeploymentHistoryRecord, DeploymentRecord, StatusUpdate,
};
use tracing::{debug, info, warn};

use crate::keys;
use crate::store::{load, query_all, save, Guard, ItemStore, Order, SkRange, Versioned};

/// Guarded writes retried this many times before reporting contention.
pub(crate) const MAX_WRITE_ATTEMPTS: usize = 3;

pub const SUPERSEDED_CONTEXT: &str = "Automatic rejection by subsequent deployment";

/// Result of applying one status notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    /// `false` for duplicates and late deliveries for superseded attempts.
    pub accepted: bool,
    /// The current record after the call.
    pub current: Option<DeploymentRecord>,
    /// The record this update displaced, as archived.
    pub superseded_prior: Option<DeploymentRecord>,
}

pub struct DeploymentTracker<'a> {
    store: &'a dyn ItemStore,
    bus: &'a dyn EventBus,
    chain: &'a PromotionChain,
    history_days: u32,
}

impl<'a> DeploymentTracker<'a> {
    pub fn new(
        store: &'a dyn ItemStore,
        bus: &'a dyn EventBus,
        chain: &'a PromotionChain,
        history_days: u32,
    ) -> Self {
        Self {
            store,
            bus,
            chain,
            history_days,
        }
    }

    pub fn current(&self, repo: &str, env: &str) -> FerryResult<Option<Versioned<DeploymentRecord>>> {
        load(self.store, &keys::deployment_pk(repo, env), keys::LATEST)
    }

    pub fn history(
        &self,
        repo: &str,
        env: &str,
        deployment_id: &str,
    ) -> FerryResult<Option<DeploymentHistoryRecord>> {
        Ok(load::<DeploymentHistoryRecord>(
            self.store,
            &keys::deployment_pk(repo, env),
            &keys::deployment_history_sk(deployment_id),
        )?
        .map(|v| v.value))
    }

    /// Archived attempts for (repo, env), most recently archived first.
    pub fn list_history(&self, repo: &str, env: &str) -> FerryResult<Vec<DeploymentHistoryRecord>> {
        let items = query_all(
            self.store,
            &keys::deployment_pk(repo, env),
            &SkRange::prefix("DEPLOYMENT#"),
            Order::Ascending,
            100,
        )?;
        let mut records = items
            .iter()
            .map(|i| i.decode::<DeploymentHistoryRecord>())
            .collect::<FerryResult<Vec<_>>>()?;
        records.sort_by(|a, b| b.archived_at.cmp(&a.archived_at));
        Ok(records)
    }

    /// The record for one attempt, whether still current or archived.
    pub fn find(
        &self,
        repo: &str,
        env: &str,
        deployment_id: &str,
    ) -> FerryResult<Option<DeploymentRecord>> {
        if let Some(current) = self.current(repo, env)? {
            if current.value.deployment_id == deployment_id {
                return Ok(Some(current.value));
            }
        }
        Ok(self.history(repo, env, deployment_id)?.map(|h| h.record))
    }

    /// Apply a status notification.
    ///
    /// A different `deployment_id` supersedes the current record; the same id
    /// with the same status is a duplicate and changes nothing.
    pub fn apply_status(&self, update: &StatusUpdate) -> FerryResult<ApplyOutcome> {
        update.validate()?;
        let pk = keys::deployment_pk(&update.repo, &update.env);
        let updated_at = normalize_or_now(update.updated_at.as_deref())?;

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self.current(&update.repo, &update.env)?;

            let (record, guard, superseded) = match current {
                Some(cur) if cur.value.deployment_id == update.deployment_id => {
                    if cur.value.status == update.status {
                        debug!(
                            repo = %update.repo,
                            env = %update.env,
                            deployment_id = %update.deployment_id,
                            status = %update.status,
                            "duplicate status ignored"
                        );
                        return Ok(ApplyOutcome {
                            accepted: false,
                            current: Some(cur.value),
                            superseded_prior: None,
                        });
                    }
                    let record = self.advance(cur.value, update, &updated_at);
                    (record, Guard::Version(cur.version), None)
                }
                Some(cur) => {
                    if self.history(&update.repo, &update.env, &update.deployment_id)?.is_some() {
                        info!(
                            repo = %update.repo,
                            env = %update.env,
                            deployment_id = %update.deployment_id,
                            current = %cur.value.deployment_id,
                            "late status for superseded deployment ignored"
                        );
                        return Ok(ApplyOutcome {
                            accepted: false,
                            current: Some(cur.value),
                            superseded_prior: None,
                        });
                    }
                    let archived = self.archive(cur.value, &update.deployment_id)?;
                    let record = self.fresh(update, &updated_at)?;
                    (record, Guard::Version(cur.version), Some(archived))
                }
                None => (self.fresh(update, &updated_at)?, Guard::Absent, None),
            };

            if !save(self.store, &pk, keys::LATEST, &record, None, guard)? {
                debug!(
                    repo = %update.repo,
                    env = %update.env,
                    deployment_id = %update.deployment_id,
                    "deployment record changed underneath, retrying"
                );
                continue;
            }

            info!(
                repo = %record.repo,
                env = %record.env,
                deployment_id = %record.deployment_id,
                status = %record.status,
                approval = record.approval.label(),
                "deployment status applied"
            );
            if let Some(prior) = &superseded {
                self.request_render(prior);
            }
            self.request_render(&record);
            return Ok(ApplyOutcome {
                accepted: true,
                current: Some(record),
                superseded_prior: superseded,
            });
        }

        Err(FerryError::StorageUnavailable(format!(
            "deployment record {pk} kept changing after {MAX_WRITE_ATTEMPTS} attempts"
        )))
    }

    /// Append directives to the current record if it still belongs to `deployment_id`.
    pub fn annotate(
        &self,
        repo: &str,
        env: &str,
        deployment_id: &str,
        directives: &[RenderDirective],
    ) -> FerryResult<bool> {
        let pk = keys::deployment_pk(repo, env);
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(cur) = self.current(repo, env)? else {
                return Ok(false);
            };
            if cur.value.deployment_id != deployment_id {
                debug!(repo, env, deployment_id, "deployment moved on, annotation dropped");
                return Ok(false);
            }
            let mut record = cur.value;
            record.directives.extend_from_slice(directives);
            if save(self.store, &pk, keys::LATEST, &record, None, Guard::Version(cur.version))? {
                self.request_render(&record);
                return Ok(true);
            }
        }
        Err(FerryError::StorageUnavailable(format!(
            "deployment record {pk} kept changing after {MAX_WRITE_ATTEMPTS} attempts"
        )))
    }

    /// Remember the chat message posted for this attempt.
    pub fn set_message_ref(
        &self,
        repo: &str,
        env: &str,
        deployment_id: &str,
        message_ref: &str,
    ) -> FerryResult<bool> {
        let pk = keys::deployment_pk(repo, env);
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(cur) = self.current(repo, env)? else {
                return Ok(false);
            };
            if cur.value.deployment_id != deployment_id {
                return Ok(false);
            }
            let mut record = cur.value;
            record.chat_message_ref = Some(message_ref.to_string());
            if save(self.store, &pk, keys::LATEST, &record, None, Guard::Version(cur.version))? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn advance(
        &self,
        mut record: DeploymentRecord,
        update: &StatusUpdate,
        updated_at: &str,
    ) -> DeploymentRecord {
        record.status = update.status;
        record.updated_at = updated_at.to_string();
        if update.url.is_some() {
            record.url = update.url.clone();
        }
        // An open approval follows the status: a success that later fails
        // loses its controls, a success reached later gains them.
        if !record.approval.is_terminal() {
            record.approval = self.initial_approval(update);
        }
        record.message = self.base_message(&record);
        record
    }

    fn fresh(&self, update: &StatusUpdate, updated_at: &str) -> FerryResult<DeploymentRecord> {
        let created_at = match update.created_at.as_deref() {
            Some(ts) => normalize_timestamp(ts)?,
            None => updated_at.to_string(),
        };
        let mut record = DeploymentRecord {
            repo: update.repo.clone(),
            env: update.env.clone(),
            deployment_id: update.deployment_id.clone(),
            sha: update.sha.clone(),
            branch: update.branch.clone(),
            owner: update.owner.clone(),
            author: update.author.clone(),
            status: update.status,
            url: update.url.clone(),
            created_at,
            updated_at: updated_at.to_string(),
            approval: self.initial_approval(update),
            message: MessageSpec::default(),
            directives: Vec::new(),
            chat_message_ref: None,
        };
        record.message = self.base_message(&record);
        Ok(record)
    }

    /// Pending only for a success with somewhere left to promote to.
    fn initial_approval(&self, update: &StatusUpdate) -> ApprovalState {
        match self.chain.next(&update.env) {
            Some(next_env) if update.status.is_success() => ApprovalState::Pending {
                next_env: next_env.to_string(),
            },
            _ => ApprovalState::NotRequested,
        }
    }

    fn base_message(&self, record: &DeploymentRecord) -> MessageSpec {
        MessageSpec::for_deployment(&DeploymentMessage {
            repo: &record.repo,
            env: &record.env,
            author: &record.author,
            owner: &record.owner,
            status: record.status,
            sha: &record.sha,
            branch: &record.branch,
            deployment_id: &record.deployment_id,
            url: record.url.as_deref(),
            approval: &record.approval,
        })
    }

    /// Write the displaced record to history, cancelling any open approval.
    fn archive(&self, mut prior: DeploymentRecord, by: &str) -> FerryResult<DeploymentRecord> {
        let now = now_sortable();
        if prior.approval.is_pending() {
            prior.approval = ApprovalState::SupersededRejected {
                superseded_by: by.to_string(),
                decided_at: now.clone(),
            };
            prior.message.controls = None;
            prior.directives.push(RenderDirective::RemoveControls);
            prior.directives.push(RenderDirective::AppendContext {
                text: SUPERSEDED_CONTEXT.to_string(),
            });
            info!(
                repo = %prior.repo,
                env = %prior.env,
                deployment_id = %prior.deployment_id,
                superseded_by = by,
                "pending approval rejected by supersession"
            );
        }
        let history = DeploymentHistoryRecord {
            record: prior,
            archived_at: now,
            archived: ArchiveReason::Superseded {
                by_deployment_id: by.to_string(),
            },
        };
        let written = save(
            self.store,
            &keys::deployment_pk(&history.record.repo, &history.record.env),
            &keys::deployment_history_sk(&history.record.deployment_id),
            &history,
            Some(expires_in_days(self.history_days)),
            Guard::Absent,
        )?;
        if !written {
            debug!(
                deployment_id = %history.record.deployment_id,
                "history entry already written"
            );
        }
        Ok(history.record)
    }

    fn request_render(&self, record: &DeploymentRecord) {
        let request = ChatRenderRequest::Deployment {
            repo: record.repo.clone(),
            env: record.env.clone(),
            deployment_id: record.deployment_id.clone(),
        };
        let published = new_event(TOPIC_CHAT_RENDER_REQUESTED, None, &request)
            .and_then(|event| self.bus.publish(&event));
        if let Err(e) = published {
            warn!(
                repo = %record.repo,
                env = %record.env,
                deployment_id = %record.deployment_id,
                error = %e,
                "chat render request not published"
            );
        }
    }
}

fn normalize_or_now(ts: Option<&str>) -> FerryResult<String> {
    match ts {
        Some(ts) => normalize_timestamp(ts),
        None => Ok(now_sortable()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{tmp_store, FlakyStore};
    use ferry_core::event::OutboxReader;
    use ferry_core::types::DeploymentStatus;

    fn update(id: &str, status: DeploymentStatus, sha: &str) -> StatusUpdate {
        StatusUpdate {
            repo: "x".into(),
            env: "test".into(),
            deployment_id: id.into(),
            status,
            sha: sha.into(),
            branch: "main".into(),
            owner: "acme".into(),
            author: "ana".into(),
            url: None,
            created_at: Some("2024-05-01T10:00:00Z".into()),
            updated_at: None,
        }
    }

    #[test]
    fn duplicate_status_is_noop() {
        let (dir, store) = tmp_store();
        let chain = PromotionChain::default();
        let tracker = DeploymentTracker::new(&store, &store, &chain, 60);

        let first = tracker
            .apply_status(&update("d1", DeploymentStatus::Success, "s1"))
            .unwrap();
        assert!(first.accepted);
        let v1 = tracker.current("x", "test").unwrap().unwrap().version;

        let again = tracker
            .apply_status(&update("d1", DeploymentStatus::Success, "s1"))
            .unwrap();
        assert!(!again.accepted);
        assert_eq!(tracker.current("x", "test").unwrap().unwrap().version, v1);
        // Only the first delivery asked for a render.
        assert_eq!(store.pending(10).unwrap().len(), 1);

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn success_opens_approval_only_with_next_env() {
        let (dir, store) = tmp_store();
        let chain = PromotionChain::default();
        let tracker = DeploymentTracker::new(&store, &store, &chain, 60);

        let out = tracker
            .apply_status(&update("d1", DeploymentStatus::InProgress, "s1"))
            .unwrap();
        assert_eq!(out.current.unwrap().approval, ApprovalState::NotRequested);

        let out = tracker
            .apply_status(&update("d1", DeploymentStatus::Success, "s1"))
            .unwrap();
        let rec = out.current.unwrap();
        assert_eq!(
            rec.approval,
            ApprovalState::Pending {
                next_env: "prod".into()
            }
        );
        assert_eq!(rec.message.controls.unwrap().next_env, "prod");

        let mut prod = update("p1", DeploymentStatus::Success, "s1");
        prod.env = "prod".into();
        let out = tracker.apply_status(&prod).unwrap();
        assert_eq!(out.current.unwrap().approval, ApprovalState::NotRequested);

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn failure_after_success_removes_controls() {
        let (dir, store) = tmp_store();
        let chain = PromotionChain::default();
        let tracker = DeploymentTracker::new(&store, &store, &chain, 60);

        tracker
            .apply_status(&update("d1", DeploymentStatus::Success, "s1"))
            .unwrap();
        let out = tracker
            .apply_status(&update("d1", DeploymentStatus::Failure, "s1"))
            .unwrap();
        assert!(out.accepted);
        let rec = out.current.unwrap();
        assert_eq!(rec.approval, ApprovalState::NotRequested);
        assert!(rec.message.controls.is_none());

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn new_deployment_supersedes_and_archives() {
        let (dir, store) = tmp_store();
        let chain = PromotionChain::default();
        let tracker = DeploymentTracker::new(&store, &store, &chain, 60);

        tracker
            .apply_status(&update("A", DeploymentStatus::Success, "s1"))
            .unwrap();
        let out = tracker
            .apply_status(&update("B", DeploymentStatus::Pending, "s2"))
            .unwrap();
        assert!(out.accepted);
        let prior = out.superseded_prior.unwrap();
        assert_eq!(prior.deployment_id, "A");
        assert!(matches!(
            prior.approval,
            ApprovalState::SupersededRejected { ref superseded_by, .. } if superseded_by == "B"
        ));
        assert_eq!(
            prior.directives,
            vec![
                RenderDirective::RemoveControls,
                RenderDirective::AppendContext {
                    text: SUPERSEDED_CONTEXT.into()
                }
            ]
        );

        let hist = tracker.history("x", "test", "A").unwrap().unwrap();
        assert_eq!(hist.record.sha, "s1");
        assert_eq!(
            hist.archived,
            ArchiveReason::Superseded {
                by_deployment_id: "B".into()
            }
        );
        let cur = tracker.current("x", "test").unwrap().unwrap().value;
        assert_eq!(cur.deployment_id, "B");
        assert!(cur.directives.is_empty());
        assert_eq!(tracker.find("x", "test", "A").unwrap().unwrap().sha, "s1");
        assert_eq!(tracker.list_history("x", "test").unwrap().len(), 1);

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn late_status_for_superseded_attempt_is_ignored() {
        let (dir, store) = tmp_store();
        let chain = PromotionChain::default();
        let tracker = DeploymentTracker::new(&store, &store, &chain, 60);

        tracker
            .apply_status(&update("A", DeploymentStatus::InProgress, "s1"))
            .unwrap();
        tracker
            .apply_status(&update("B", DeploymentStatus::InProgress, "s2"))
            .unwrap();
        let late = tracker
            .apply_status(&update("A", DeploymentStatus::Success, "s1"))
            .unwrap();
        assert!(!late.accepted);
        assert_eq!(
            tracker.current("x", "test").unwrap().unwrap().value.deployment_id,
            "B"
        );

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_identity_is_invalid() {
        let (dir, store) = tmp_store();
        let chain = PromotionChain::default();
        let tracker = DeploymentTracker::new(&store, &store, &chain, 60);
        let mut u = update("d1", DeploymentStatus::Success, "s1");
        u.repo = String::new();
        let err = tracker.apply_status(&u).unwrap_err();
        assert!(matches!(err, FerryError::InvalidEvent(_)));
        assert!(!err.is_retryable());
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn contention_retries_then_fails() {
        let (dir, store) = tmp_store();
        let chain = PromotionChain::default();
        tracker_seed(&store, &chain);

        let flaky = FlakyStore::new(&store);
        *flaky.lose_races.borrow_mut() = 2;
        let tracker = DeploymentTracker::new(&flaky, &store, &chain, 60);
        let out = tracker
            .apply_status(&update("d1", DeploymentStatus::Success, "s1"))
            .unwrap();
        assert!(out.accepted);

        *flaky.lose_races.borrow_mut() = MAX_WRITE_ATTEMPTS;
        let err = tracker
            .apply_status(&update("d1", DeploymentStatus::Inactive, "s1"))
            .unwrap_err();
        assert!(err.is_retryable());

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    fn tracker_seed(store: &crate::sqlite_store::SqliteStore, chain: &PromotionChain) {
        DeploymentTracker::new(store, store, chain, 60)
            .apply_status(&update("d1", DeploymentStatus::InProgress, "s1"))
            .unwrap();
    }

    #[test]
    fn storage_outage_is_retryable() {
        let (dir, store) = tmp_store();
        let chain = PromotionChain::default();
        let mut flaky = FlakyStore::new(&store);
        flaky.poisoned.push(keys::deployment_pk("x", "test"));
        let tracker = DeploymentTracker::new(&flaky, &store, &chain, 60);
        let err = tracker
            .apply_status(&update("d1", DeploymentStatus::Success, "s1"))
            .unwrap_err();
        assert!(matches!(err, FerryError::StorageUnavailable(_)));
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn annotate_and_message_ref_follow_the_attempt() {
        let (dir, store) = tmp_store();
        let chain = PromotionChain::default();
        let tracker = DeploymentTracker::new(&store, &store, &chain, 60);
        tracker
            .apply_status(&update("d1", DeploymentStatus::Success, "s1"))
            .unwrap();
        let note = RenderDirective::AppendContext { text: "hi".into() };
        assert!(tracker.annotate("x", "test", "d1", &[note.clone()]).unwrap());
        assert!(!tracker.annotate("x", "test", "d0", &[note.clone()]).unwrap());
        assert!(tracker.set_message_ref("x", "test", "d1", "C1/123.4").unwrap());
        assert!(!tracker.set_message_ref("x", "test", "zz", "C1/1").unwrap());
        let cur = tracker.current("x", "test").unwrap().unwrap().value;
        assert_eq!(cur.directives, vec![note]);
        assert_eq!(cur.chat_message_ref.as_deref(), Some("C1/123.4"));
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
