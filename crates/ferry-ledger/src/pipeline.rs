//! Wires the components into the inbound event flow: status notifications,
//! approval decisions, commit pushes and diff requests.

use ferry_core::config::FerryConfig;
use ferry_core::error::{FerryError, FerryResult};
use ferry_core::event::{
    new_event, release_dedup_key, ChatRenderRequest, EventBus, PromotionPrep, ReleaseComputed,
    TOPIC_CHAT_RENDER_REQUESTED, TOPIC_RELEASE_COMPUTED,
};
use ferry_core::ports::{best_effort_summary, SourceControl, Summarizer, SummaryKind};
use ferry_core::render::{Anchor, RenderDirective, Section, SectionKind};
use ferry_core::types::{
    CommitRecord, Decision, DeploymentRecord, EnvRepoEntry, NewCommit, ReleaseRecord,
    StatusUpdate,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::approvals::{ApprovalWorkflow, DecisionOutcome};
use crate::commits::CommitLedger;
use crate::deployments::{ApplyOutcome, DeploymentTracker};
use crate::releases::{commit_lines, EnvDiff, ReleaseLedger};
use crate::store::ItemStore;

/// Commits delivered by one push notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitPush {
    pub repo: String,
    #[serde(default)]
    pub owner: String,
    /// Head before the push; parent of the pushed commits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    pub commits: Vec<NewCommit>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusOutcome {
    pub applied: ApplyOutcome,
    /// Set when this notification produced a new release.
    pub release: Option<ReleaseRecord>,
}

pub struct Pipeline<'a> {
    store: &'a dyn ItemStore,
    bus: &'a dyn EventBus,
    config: &'a FerryConfig,
    summarizer: Option<&'a dyn Summarizer>,
    source: Option<&'a dyn SourceControl>,
}

impl<'a> Pipeline<'a> {
    pub fn new(store: &'a dyn ItemStore, bus: &'a dyn EventBus, config: &'a FerryConfig) -> Self {
        Self {
            store,
            bus,
            config,
            summarizer: None,
            source: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Option<&'a dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_source_control(mut self, source: Option<&'a dyn SourceControl>) -> Self {
        self.source = source;
        self
    }

    pub fn tracker(&self) -> DeploymentTracker<'a> {
        DeploymentTracker::new(
            self.store,
            self.bus,
            &self.config.chain,
            self.config.retention.deployment_history_days,
        )
    }

    pub fn commits(&self) -> CommitLedger<'a> {
        CommitLedger::new(
            self.store,
            self.config.page_size,
            self.config.retention.commit_days,
        )
    }

    pub fn releases(&self) -> ReleaseLedger<'a> {
        ReleaseLedger::new(
            self.store,
            self.commits(),
            self.summarizer,
            self.config.retention.release_archive_days,
        )
    }

    pub fn approvals(&self) -> ApprovalWorkflow<'a> {
        ApprovalWorkflow::new(self.store, self.bus)
    }

    // ── Deployment status ──

    /// Apply a status notification; a success also rotates the release ledger
    /// and moves the environment pointer.
    ///
    /// Safe to redeliver: the release step runs whenever the current attempt
    /// is successful and skips work already done for its sha.
    pub fn handle_deployment_status(&self, update: &StatusUpdate) -> FerryResult<StatusOutcome> {
        let applied = self.tracker().apply_status(update)?;
        let release = match &applied.current {
            Some(current)
                if update.status.is_success()
                    && current.deployment_id == update.deployment_id
                    && current.status.is_success() =>
            {
                self.track_release(current)?
            }
            _ => None,
        };
        Ok(StatusOutcome { applied, release })
    }

    fn track_release(&self, record: &DeploymentRecord) -> FerryResult<Option<ReleaseRecord>> {
        let releases = self.releases();
        let (repo, env) = (record.repo.as_str(), record.env.as_str());

        releases.update_env_pointer(
            env,
            repo,
            &EnvRepoEntry {
                sha: record.sha.clone(),
                deployment_id: record.deployment_id.clone(),
                deployed_at: record.updated_at.clone(),
                branch: record.branch.clone(),
                owner: record.owner.clone(),
                url: record.url.clone(),
            },
        )?;

        let prep = match self.config.chain.next(env) {
            Some(next_env) => Some(releases.prep_promotion(repo, env, next_env, &record.sha)?),
            None => None,
        };

        // A redelivered success never rotates twice, but still finishes the
        // annotation and event of an attempt that failed partway.
        let (release, prior_sha, fresh) = match releases.latest(repo, env)? {
            Some(latest) if latest.sha == record.sha => {
                debug!(repo, env, sha = %record.sha, "release already recorded for sha");
                let prior_sha = releases
                    .list_releases(repo, env, 2)?
                    .into_iter()
                    .nth(1)
                    .map(|p| p.sha);
                (latest, prior_sha, false)
            }
            _ => {
                let prior = releases.archive_and_rotate(repo, env)?;
                let release = releases.compute_release(repo, env, prior.as_ref(), &record.sha)?;
                (release, prior.map(|p| p.sha), true)
            }
        };

        if !has_release_summary(&record.directives) {
            let mut directives = vec![RenderDirective::Insert {
                anchor: Anchor::Divider,
                section: release_section(&release),
            }];
            if let Some(prep) = &prep {
                directives.push(RenderDirective::Insert {
                    anchor: Anchor::After(SectionKind::ReleaseSummary),
                    section: prep_section(prep),
                });
            }
            self.tracker()
                .annotate(repo, env, &record.deployment_id, &directives)?;
        }

        let payload = ReleaseComputed {
            release: release.clone(),
            prior_sha,
            deployment_id: record.deployment_id.clone(),
            prep,
        };
        let key = release_dedup_key(repo, env, &release.sha);
        if let Err(e) = new_event(TOPIC_RELEASE_COMPUTED, Some(key), &payload)
            .and_then(|event| self.bus.publish(&event))
        {
            warn!(repo, env, error = %e, "release.computed not published");
        }
        Ok(fresh.then_some(release))
    }

    // ── Decisions ──

    pub fn handle_decision(
        &self,
        repo: &str,
        env: &str,
        deployment_id: &str,
        decision: Decision,
        actor: &str,
    ) -> FerryResult<DecisionOutcome> {
        self.approvals()
            .decide(repo, env, deployment_id, decision, actor)
    }

    // ── Commit pushes ──

    /// Record every pushed commit, then enrich each with a summary when a
    /// summarizer is configured. Enrichment failures are logged and skipped.
    pub fn handle_commit_push(&self, push: &CommitPush) -> FerryResult<Vec<CommitRecord>> {
        if push.repo.trim().is_empty() {
            return Err(FerryError::invalid("push without repository"));
        }
        let ledger = self.commits();
        let mut recorded = Vec::with_capacity(push.commits.len());
        for commit in &push.commits {
            let mut commit = commit.clone();
            if commit.parent_sha.is_none() {
                commit.parent_sha = push.before.clone();
            }
            recorded.push(ledger.record(&push.repo, &commit)?);
        }

        if self.summarizer.is_some() {
            for record in &mut recorded {
                if record.summary.is_some() {
                    continue;
                }
                let Some(summary) = self.summarize_commit(&push.owner, record) else {
                    continue;
                };
                if ledger.set_summary(&push.repo, &record.sha, &summary)? {
                    record.summary = Some(summary);
                }
            }
        }
        info!(repo = %push.repo, commits = recorded.len(), "push recorded");
        Ok(recorded)
    }

    fn summarize_commit(&self, owner: &str, record: &CommitRecord) -> Option<String> {
        let detail = match self.source {
            Some(source) if !owner.is_empty() => match self
                .config
                .default_credential()
                .and_then(|cred| source.fetch_commit(&cred, owner, &record.repo, &record.sha))
            {
                Ok(detail) => Some(detail.without_lock_files()),
                Err(e) => {
                    warn!(repo = %record.repo, sha = %record.sha, error = %e, "commit detail unavailable");
                    None
                }
            },
            _ => None,
        };
        let payload = match detail {
            Some(detail) => serde_json::json!({
                "sha": record.sha,
                "message": detail.message,
                "files": detail.files,
            }),
            None => serde_json::json!({ "sha": record.sha, "message": record.message }),
        };
        best_effort_summary(self.summarizer, SummaryKind::Commit, &payload)
    }

    // ── Diff requests ──

    /// Diff two environments and publish the result as a standalone report.
    pub fn handle_diff_request(
        &self,
        env_a: &str,
        env_b: &str,
        extra_excluded: &[String],
    ) -> FerryResult<EnvDiff> {
        let mut excluded = self.config.excluded_repos.clone();
        excluded.extend(extra_excluded.iter().cloned());
        let diff = self
            .releases()
            .diff_environments(&self.config.chain, env_a, env_b, &excluded)?;

        let request = ChatRenderRequest::Report {
            message: diff.to_message(),
        };
        if let Err(e) = new_event(TOPIC_CHAT_RENDER_REQUESTED, None, &request)
            .and_then(|event| self.bus.publish(&event))
        {
            warn!(lower = %diff.lower, higher = %diff.higher, error = %e, "diff report not published");
        }
        Ok(diff)
    }
}

fn release_section(release: &ReleaseRecord) -> Section {
    Section {
        kind: SectionKind::ReleaseSummary,
        title: format!("{} Release Summary", release.env.to_uppercase()),
        body: section_body(release.summary.as_deref(), &release.commits),
    }
}

fn has_release_summary(directives: &[RenderDirective]) -> bool {
    directives.iter().any(|d| {
        matches!(
            d,
            RenderDirective::Insert { section, .. } if section.kind == SectionKind::ReleaseSummary
        )
    })
}

fn prep_section(prep: &PromotionPrep) -> Section {
    Section {
        kind: SectionKind::PromotionPrep,
        title: format!("Prep for {}", prep.next_env.to_uppercase()),
        body: section_body(prep.summary.as_deref(), &prep.commits),
    }
}

fn section_body(summary: Option<&str>, commits: &[ferry_core::types::ReleaseCommit]) -> String {
    let lines = if commits.is_empty() {
        "No new commits".to_string()
    } else {
        commit_lines(commits)
    };
    match summary {
        Some(summary) => format!("{summary}\n{lines}"),
        None => lines,
    }
}
