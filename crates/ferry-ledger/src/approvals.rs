//! Approval workflow layered on the current deployment record.
//!
//! The decision field is written with a version guard: of two racing clicks
//! the first write wins and the loser re-reads a terminal state.

use ferry_core::clock::now_sortable;
use ferry_core::error::{FerryError, FerryResult};
use ferry_core::event::{
    new_event, promotion_dedup_key, ChatRenderRequest, EventBus, TOPIC_CHAT_RENDER_REQUESTED,
    TOPIC_PROMOTION_REQUESTED,
};
use ferry_core::render::RenderDirective;
use ferry_core::types::{ApprovalState, Decision, DeploymentRecord, PromotionRequest};
use tracing::{info, warn};

use crate::deployments::MAX_WRITE_ATTEMPTS;
use crate::keys;
use crate::store::{load, save, Guard, ItemStore};

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionOutcome {
    /// `false` when the call replayed a decision already on record.
    pub accepted: bool,
    pub record: DeploymentRecord,
    /// Set for approvals, including replays.
    pub promotion: Option<PromotionRequest>,
}

pub struct ApprovalWorkflow<'a> {
    store: &'a dyn ItemStore,
    bus: &'a dyn EventBus,
}

impl<'a> ApprovalWorkflow<'a> {
    pub fn new(store: &'a dyn ItemStore, bus: &'a dyn EventBus) -> Self {
        Self { store, bus }
    }

    /// Record a human decision for the deployment awaiting one.
    ///
    /// Fails with `StaleDecision` when `deployment_id` is no longer current or
    /// a different decision already closed the approval.
    pub fn decide(
        &self,
        repo: &str,
        env: &str,
        deployment_id: &str,
        decision: Decision,
        actor: &str,
    ) -> FerryResult<DecisionOutcome> {
        if actor.trim().is_empty() {
            return Err(FerryError::invalid("decision requires an actor"));
        }
        let pk = keys::deployment_pk(repo, env);
        let stale = |reason: String| FerryError::StaleDecision {
            repo: repo.to_string(),
            env: env.to_string(),
            deployment_id: deployment_id.to_string(),
            reason,
        };

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(cur) = load::<DeploymentRecord>(self.store, &pk, keys::LATEST)? else {
                return Err(stale("no deployment on record".into()));
            };
            let mut record = cur.value;
            if record.deployment_id != deployment_id {
                return Err(stale(format!("superseded by {}", record.deployment_id)));
            }

            let next_env = match (&record.approval, decision) {
                (ApprovalState::Pending { next_env }, _) if record.status.is_success() => {
                    next_env.clone()
                }
                (ApprovalState::Approved { actor: by, .. }, Decision::Approve) if by == actor => {
                    info!(repo, env, deployment_id, actor, "approval replayed");
                    let promotion = promotion_request(&record, actor);
                    if let Some(p) = &promotion {
                        self.request_promotion(p);
                    }
                    return Ok(DecisionOutcome {
                        accepted: false,
                        record,
                        promotion,
                    });
                }
                (ApprovalState::Rejected { actor: by, .. }, Decision::Reject) if by == actor => {
                    return Ok(DecisionOutcome {
                        accepted: false,
                        record,
                        promotion: None,
                    });
                }
                (state, _) if state.is_terminal() => {
                    return Err(stale(format!("approval already {}", state.label())));
                }
                (ApprovalState::Pending { .. }, _) => {
                    return Err(stale(format!("deployment is {}", record.status)));
                }
                _ => return Err(stale("no approval pending".into())),
            };

            let decided_at = now_sortable();
            let context = match decision {
                Decision::Approve => {
                    record.approval = ApprovalState::Approved {
                        actor: actor.to_string(),
                        next_env,
                        decided_at,
                    };
                    format!("Approved by {actor}")
                }
                Decision::Reject => {
                    record.approval = ApprovalState::Rejected {
                        actor: actor.to_string(),
                        decided_at,
                    };
                    format!("Rejected by {actor}")
                }
            };
            record.message.controls = None;
            record.directives.push(RenderDirective::RemoveControls);
            record
                .directives
                .push(RenderDirective::AppendContext { text: context });

            if !save(self.store, &pk, keys::LATEST, &record, None, Guard::Version(cur.version))? {
                continue;
            }

            info!(
                repo,
                env,
                deployment_id,
                actor,
                approval = record.approval.label(),
                "decision recorded"
            );
            self.request_render(&record);
            let promotion = promotion_request(&record, actor);
            if let Some(p) = &promotion {
                self.request_promotion(p);
            }
            return Ok(DecisionOutcome {
                accepted: true,
                record,
                promotion,
            });
        }

        Err(FerryError::StorageUnavailable(format!(
            "deployment record {pk} kept changing after {MAX_WRITE_ATTEMPTS} attempts"
        )))
    }

    fn request_render(&self, record: &DeploymentRecord) {
        let request = ChatRenderRequest::Deployment {
            repo: record.repo.clone(),
            env: record.env.clone(),
            deployment_id: record.deployment_id.clone(),
        };
        if let Err(e) = new_event(TOPIC_CHAT_RENDER_REQUESTED, None, &request)
            .and_then(|event| self.bus.publish(&event))
        {
            warn!(deployment_id = %record.deployment_id, error = %e, "chat render request not published");
        }
    }

    fn request_promotion(&self, promotion: &PromotionRequest) {
        let key = promotion_dedup_key(
            &promotion.repo,
            &promotion.source_env,
            &promotion.deployment_id,
        );
        match new_event(TOPIC_PROMOTION_REQUESTED, Some(key), promotion)
            .and_then(|event| self.bus.publish(&event))
        {
            Ok(true) => info!(
                repo = %promotion.repo,
                next_env = %promotion.next_env,
                sha = %promotion.sha,
                "promotion requested"
            ),
            Ok(false) => {}
            Err(e) => warn!(
                repo = %promotion.repo,
                next_env = %promotion.next_env,
                error = %e,
                "promotion request not published"
            ),
        }
    }
}

fn promotion_request(record: &DeploymentRecord, actor: &str) -> Option<PromotionRequest> {
    match &record.approval {
        ApprovalState::Approved {
            next_env,
            decided_at,
            ..
        } => Some(PromotionRequest {
            repo: record.repo.clone(),
            owner: record.owner.clone(),
            sha: record.sha.clone(),
            source_env: record.env.clone(),
            next_env: next_env.clone(),
            deployment_id: record.deployment_id.clone(),
            approved_by: actor.to_string(),
            approved_at: decided_at.clone(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployments::DeploymentTracker;
    use crate::testutil::{tmp_store, FlakyStore};
    use ferry_core::config::PromotionChain;
    use ferry_core::event::OutboxReader;
    use ferry_core::types::{DeploymentStatus, StatusUpdate};

    fn deploy(store: &crate::sqlite_store::SqliteStore, id: &str, status: DeploymentStatus) {
        let chain = PromotionChain::default();
        DeploymentTracker::new(store, store, &chain, 60)
            .apply_status(&StatusUpdate {
                repo: "x".into(),
                env: "test".into(),
                deployment_id: id.into(),
                status,
                sha: format!("sha-{id}"),
                branch: "main".into(),
                owner: "acme".into(),
                author: "ana".into(),
                url: None,
                created_at: None,
                updated_at: None,
            })
            .unwrap();
    }

    fn promotions(store: &crate::sqlite_store::SqliteStore) -> usize {
        store
            .pending(100)
            .unwrap()
            .iter()
            .filter(|p| p.event.topic == TOPIC_PROMOTION_REQUESTED)
            .count()
    }

    #[test]
    fn approve_records_and_requests_promotion() {
        let (dir, store) = tmp_store();
        deploy(&store, "d1", DeploymentStatus::Success);
        let wf = ApprovalWorkflow::new(&store, &store);

        let out = wf.decide("x", "test", "d1", Decision::Approve, "bo").unwrap();
        assert!(out.accepted);
        let p = out.promotion.unwrap();
        assert_eq!(p.next_env, "prod");
        assert_eq!(p.sha, "sha-d1");
        assert_eq!(p.owner, "acme");
        assert!(out.record.message.controls.is_none());
        assert_eq!(
            out.record.directives.last(),
            Some(&RenderDirective::AppendContext {
                text: "Approved by bo".into()
            })
        );
        assert_eq!(promotions(&store), 1);

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reject_never_promotes() {
        let (dir, store) = tmp_store();
        deploy(&store, "d1", DeploymentStatus::Success);
        let wf = ApprovalWorkflow::new(&store, &store);
        let out = wf.decide("x", "test", "d1", Decision::Reject, "bo").unwrap();
        assert!(out.accepted);
        assert!(out.promotion.is_none());
        assert_eq!(out.record.approval.label(), "rejected");
        assert_eq!(promotions(&store), 0);

        // Approving after a rejection is stale.
        let err = wf
            .decide("x", "test", "d1", Decision::Approve, "cy")
            .unwrap_err();
        assert!(matches!(err, FerryError::StaleDecision { .. }));

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn decision_for_superseded_deployment_is_stale() {
        let (dir, store) = tmp_store();
        deploy(&store, "A", DeploymentStatus::Success);
        deploy(&store, "B", DeploymentStatus::Pending);
        let wf = ApprovalWorkflow::new(&store, &store);
        let err = wf.decide("x", "test", "A", Decision::Approve, "bo").unwrap_err();
        match err {
            FerryError::StaleDecision { reason, .. } => assert!(reason.contains("B")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(promotions(&store), 0);
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn nothing_pending_is_stale() {
        let (dir, store) = tmp_store();
        let wf = ApprovalWorkflow::new(&store, &store);
        assert!(matches!(
            wf.decide("x", "test", "d1", Decision::Approve, "bo"),
            Err(FerryError::StaleDecision { .. })
        ));
        deploy(&store, "d1", DeploymentStatus::InProgress);
        assert!(matches!(
            wf.decide("x", "test", "d1", Decision::Approve, "bo"),
            Err(FerryError::StaleDecision { .. })
        ));
        assert!(matches!(
            wf.decide("x", "test", "d1", Decision::Approve, " "),
            Err(FerryError::InvalidEvent(_))
        ));
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn failure_after_success_withdraws_approval() {
        let (dir, store) = tmp_store();
        deploy(&store, "d1", DeploymentStatus::Success);
        deploy(&store, "d1", DeploymentStatus::Failure);
        let wf = ApprovalWorkflow::new(&store, &store);
        match wf.decide("x", "test", "d1", Decision::Approve, "bo") {
            Err(FerryError::StaleDecision { reason, .. }) => assert!(reason.contains("no approval")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(promotions(&store), 0);
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn replayed_approval_does_not_double_promote() {
        let (dir, store) = tmp_store();
        deploy(&store, "d1", DeploymentStatus::Success);
        let wf = ApprovalWorkflow::new(&store, &store);
        wf.decide("x", "test", "d1", Decision::Approve, "bo").unwrap();
        let replay = wf.decide("x", "test", "d1", Decision::Approve, "bo").unwrap();
        assert!(!replay.accepted);
        assert!(replay.promotion.is_some());
        assert_eq!(promotions(&store), 1);

        // A second approver arrives after the first one won.
        assert!(matches!(
            wf.decide("x", "test", "d1", Decision::Approve, "cy"),
            Err(FerryError::StaleDecision { .. })
        ));
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn losing_a_race_rereads_terminal_state() {
        let (dir, store) = tmp_store();
        deploy(&store, "d1", DeploymentStatus::Success);

        // The competing click lands between our read and our write.
        struct Racing<'a> {
            flaky: FlakyStore<'a>,
            store: &'a crate::sqlite_store::SqliteStore,
        }
        impl crate::store::ItemStore for Racing<'_> {
            fn get(&self, pk: &str, sk: &str) -> FerryResult<Option<crate::store::Item>> {
                self.flaky.get(pk, sk)
            }
            fn put(
                &self,
                pk: &str,
                sk: &str,
                body: &serde_json::Value,
                expires_at: Option<i64>,
                guard: Guard,
            ) -> FerryResult<bool> {
                if *self.flaky.lose_races.borrow() > 0 {
                    ApprovalWorkflow::new(self.store, self.store)
                        .decide("x", "test", "d1", Decision::Reject, "rival")
                        .unwrap();
                }
                self.flaky.put(pk, sk, body, expires_at, guard)
            }
            fn set_field(
                &self,
                pk: &str,
                sk: &str,
                path: &str,
                value: &serde_json::Value,
                seed: &serde_json::Value,
            ) -> FerryResult<()> {
                self.flaky.set_field(pk, sk, path, value, seed)
            }
            fn query(
                &self,
                pk: &str,
                range: &crate::store::SkRange,
                order: crate::store::Order,
                cursor: Option<&str>,
                limit: usize,
            ) -> FerryResult<crate::store::Page> {
                self.flaky.query(pk, range, order, cursor, limit)
            }
        }

        let racing = Racing {
            flaky: FlakyStore::new(&store),
            store: &store,
        };
        *racing.flaky.lose_races.borrow_mut() = 1;
        let err = ApprovalWorkflow::new(&racing, &store)
            .decide("x", "test", "d1", Decision::Approve, "bo")
            .unwrap_err();
        assert!(matches!(err, FerryError::StaleDecision { .. }));
        assert_eq!(promotions(&store), 0);

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
