//! Release ledger and environment diff engine.

use std::collections::BTreeSet;

use ferry_core::clock::{expires_in_days, now_sortable};
use ferry_core::config::PromotionChain;
use ferry_core::error::FerryResult;
use ferry_core::event::PromotionPrep;
use ferry_core::ports::{best_effort_summary, Summarizer, SummaryKind};
use ferry_core::render::{MessageSpec, Section, SectionKind};
use ferry_core::types::{
    short_sha, CommitRecord, EnvLatestPointer, EnvRepoEntry, ReleaseCommit, ReleaseRecord,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::commits::CommitLedger;
use crate::keys;
use crate::store::{encode, load, save, Guard, ItemStore, Order, SkRange};

pub struct ReleaseLedger<'a> {
    store: &'a dyn ItemStore,
    commits: CommitLedger<'a>,
    summarizer: Option<&'a dyn Summarizer>,
    archive_days: u32,
}

impl<'a> ReleaseLedger<'a> {
    pub fn new(
        store: &'a dyn ItemStore,
        commits: CommitLedger<'a>,
        summarizer: Option<&'a dyn Summarizer>,
        archive_days: u32,
    ) -> Self {
        Self {
            store,
            commits,
            summarizer,
            archive_days,
        }
    }

    pub fn latest(&self, repo: &str, env: &str) -> FerryResult<Option<ReleaseRecord>> {
        Ok(load::<ReleaseRecord>(self.store, &keys::release_pk(repo, env), keys::LATEST)?
            .map(|v| v.value))
    }

    /// Copy the current latest release to an archive entry keyed by its own
    /// `released_on`, and return it as the prior release.
    pub fn archive_and_rotate(&self, repo: &str, env: &str) -> FerryResult<Option<ReleaseRecord>> {
        let Some(prior) = self.latest(repo, env)? else {
            debug!(repo, env, "no prior release to archive");
            return Ok(None);
        };
        let written = save(
            self.store,
            &keys::release_pk(repo, env),
            &prior.released_on,
            &prior,
            Some(expires_in_days(self.archive_days)),
            Guard::Absent,
        )?;
        if written {
            info!(repo, env, sha = %prior.sha, released_on = %prior.released_on, "release archived");
        }
        Ok(Some(prior))
    }

    /// Resolve what shipped since `prior` and store it as the new latest release.
    pub fn compute_release(
        &self,
        repo: &str,
        env: &str,
        prior: Option<&ReleaseRecord>,
        new_sha: &str,
    ) -> FerryResult<ReleaseRecord> {
        let commits = self
            .commits
            .resolve_range(repo, prior.map(|p| p.sha.as_str()), new_sha)?;
        let summary = self.summarize(SummaryKind::Release, &commits);
        let release = ReleaseRecord {
            repo: repo.to_string(),
            env: env.to_string(),
            sha: new_sha.to_string(),
            commits: commits.iter().map(ReleaseCommit::from).collect(),
            summary,
            released_on: now_sortable(),
        };
        save(
            self.store,
            &keys::release_pk(repo, env),
            keys::LATEST,
            &release,
            None,
            Guard::None,
        )?;
        info!(
            repo,
            env,
            sha = %new_sha,
            commits = release.commits.len(),
            "release computed"
        );
        Ok(release)
    }

    /// Commits that promoting `current_sha` into `next_env` would ship.
    pub fn prep_promotion(
        &self,
        repo: &str,
        current_env: &str,
        next_env: &str,
        current_sha: &str,
    ) -> FerryResult<PromotionPrep> {
        let base_sha = match self.latest(repo, next_env)? {
            Some(release) => Some(release.sha),
            None => self.env_pointer(next_env)?.repos.remove(repo).map(|e| e.sha),
        };
        let commits = self
            .commits
            .resolve_range(repo, base_sha.as_deref(), current_sha)?;
        let summary = self.summarize(SummaryKind::PromotionPrep, &commits);
        debug!(
            repo,
            current_env,
            next_env,
            commits = commits.len(),
            "promotion prepared"
        );
        Ok(PromotionPrep {
            next_env: next_env.to_string(),
            base_sha,
            commits: commits.iter().map(ReleaseCommit::from).collect(),
            summary,
        })
    }

    /// Point `env` at a newly deployed sha for `repo`.
    pub fn update_env_pointer(&self, env: &str, repo: &str, entry: &EnvRepoEntry) -> FerryResult<()> {
        let pk = keys::env_pointer_pk();
        let seed = encode(
            pk,
            env,
            &EnvLatestPointer {
                env: env.to_string(),
                repos: Default::default(),
            },
        )?;
        let value = encode(pk, env, entry)?;
        self.store.set_field(
            pk,
            env,
            &keys::env_pointer_repo_path(repo),
            &value,
            &seed,
        )?;
        info!(env, repo, sha = %entry.sha, "environment pointer updated");
        Ok(())
    }

    /// Pointer for `env`; empty when nothing was ever deployed there.
    pub fn env_pointer(&self, env: &str) -> FerryResult<EnvLatestPointer> {
        Ok(load::<EnvLatestPointer>(self.store, keys::env_pointer_pk(), env)?
            .map(|v| v.value)
            .unwrap_or_else(|| EnvLatestPointer {
                env: env.to_string(),
                repos: Default::default(),
            }))
    }

    /// Latest release first, then archives newest first.
    pub fn list_releases(&self, repo: &str, env: &str, limit: usize) -> FerryResult<Vec<ReleaseRecord>> {
        let mut out: Vec<ReleaseRecord> = self.latest(repo, env)?.into_iter().collect();
        let pk = keys::release_pk(repo, env);
        let mut cursor: Option<String> = None;
        while out.len() < limit {
            let page = self.store.query(
                &pk,
                &SkRange::all(),
                Order::Descending,
                cursor.as_deref(),
                limit,
            )?;
            for item in &page.items {
                if item.sk != keys::LATEST && out.len() < limit {
                    out.push(item.decode()?);
                }
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        out.truncate(limit);
        Ok(out)
    }

    /// Compare two environments. The chain decides which one is lower (ahead).
    ///
    /// A failure resolving one repository is reported inline and never aborts
    /// the rest of the diff.
    pub fn diff_environments(
        &self,
        chain: &PromotionChain,
        env_a: &str,
        env_b: &str,
        excluded: &[String],
    ) -> FerryResult<EnvDiff> {
        let (lower, higher) = chain.order(env_a, env_b)?;
        let lower_ptr = self.env_pointer(lower)?;
        let higher_ptr = self.env_pointer(higher)?;

        let repos: BTreeSet<&String> = lower_ptr
            .repos
            .keys()
            .chain(higher_ptr.repos.keys())
            .filter(|r| !excluded.iter().any(|e| e == *r))
            .collect();

        let mut diff = EnvDiff {
            lower: lower.to_string(),
            higher: higher.to_string(),
            in_sync: Vec::new(),
            out_of_sync: Vec::new(),
        };
        for repo in repos {
            let lower_sha = lower_ptr.repos.get(repo).map(|e| e.sha.clone());
            let higher_sha = higher_ptr.repos.get(repo).map(|e| e.sha.clone());
            if lower_sha == higher_sha {
                diff.in_sync.push(repo.clone());
                continue;
            }
            let outcome = match &lower_sha {
                None => RepoDiffOutcome::MissingFromLower,
                Some(end) => match self.commits.resolve_range(repo, higher_sha.as_deref(), end) {
                    Ok(commits) => RepoDiffOutcome::Ahead {
                        commits: commits.iter().map(ReleaseCommit::from).collect(),
                    },
                    Err(e) => {
                        warn!(repo = %repo, lower, higher, error = %e, "diff failed for repository");
                        RepoDiffOutcome::Failed {
                            error: e.to_string(),
                        }
                    }
                },
            };
            diff.out_of_sync.push(RepoDiff {
                repo: repo.clone(),
                lower_sha,
                higher_sha,
                outcome,
            });
        }
        info!(
            lower,
            higher,
            in_sync = diff.in_sync.len(),
            out_of_sync = diff.out_of_sync.len(),
            "environments diffed"
        );
        Ok(diff)
    }

    fn summarize(&self, kind: SummaryKind, commits: &[CommitRecord]) -> Option<String> {
        if commits.is_empty() {
            return None;
        }
        let payload = serde_json::json!(commits
            .iter()
            .map(|c| serde_json::json!({
                "sha": c.sha,
                "message": c.message,
                "author": c.author,
                "summary": c.summary,
            }))
            .collect::<Vec<_>>());
        best_effort_summary(self.summarizer, kind, &payload)
    }
}

// ── Diff results ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvDiff {
    pub lower: String,
    pub higher: String,
    pub in_sync: Vec<String>,
    pub out_of_sync: Vec<RepoDiff>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepoDiff {
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub higher_sha: Option<String>,
    #[serde(flatten)]
    pub outcome: RepoDiffOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RepoDiffOutcome {
    /// Commits in the lower environment that the higher one lacks.
    Ahead { commits: Vec<ReleaseCommit> },
    /// Deployed to the higher environment only.
    MissingFromLower,
    Failed { error: String },
}

impl EnvDiff {
    /// Standalone chat report: the in-sync list, then one section per drifted repo.
    pub fn to_message(&self) -> MessageSpec {
        let mut sections = Vec::new();
        if !self.in_sync.is_empty() {
            sections.push(Section {
                kind: SectionKind::InSync,
                title: "In sync".into(),
                body: self.in_sync.join(", "),
            });
        }
        for repo in &self.out_of_sync {
            let body = match &repo.outcome {
                RepoDiffOutcome::Ahead { commits } if commits.is_empty() => {
                    "No recorded commits in range".to_string()
                }
                RepoDiffOutcome::Ahead { commits } => commit_lines(commits),
                RepoDiffOutcome::MissingFromLower => format!("Not deployed to {}", self.lower),
                RepoDiffOutcome::Failed { error } => format!("Could not compute diff: {error}"),
            };
            sections.push(Section {
                kind: SectionKind::RepoDiff,
                title: repo.repo.clone(),
                body,
            });
        }
        MessageSpec::report(
            format!("Diff {} → {}", self.lower, self.higher),
            sections,
        )
    }
}

/// One `sha7 title` line per commit.
pub fn commit_lines(commits: &[ReleaseCommit]) -> String {
    commits
        .iter()
        .map(|c| {
            let title = c.message.lines().next().unwrap_or("");
            format!("- {} {}", short_sha(&c.sha), title)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{tmp_store, FlakyStore};
    use ferry_core::error::FerryError;
    use ferry_core::types::NewCommit;

    fn seed_commits(store: &dyn ItemStore, repo: &str, shas: &[&str]) {
        let ledger = CommitLedger::new(store, 10, 30);
        for (i, sha) in shas.iter().enumerate() {
            ledger
                .record(
                    repo,
                    &NewCommit {
                        sha: sha.to_string(),
                        committed_at: format!("2024-05-01T1{i}:00:00Z"),
                        message: format!("change {sha}\n\nbody"),
                        author: "ana".into(),
                        summary: None,
                        parent_sha: None,
                    },
                )
                .unwrap();
        }
    }

    fn ledger<'a>(store: &'a dyn ItemStore) -> ReleaseLedger<'a> {
        ReleaseLedger::new(store, CommitLedger::new(store, 10, 30), None, 30)
    }

    fn entry(sha: &str) -> EnvRepoEntry {
        EnvRepoEntry {
            sha: sha.into(),
            deployment_id: format!("dep-{sha}"),
            deployed_at: "2024-05-02T00:00:00.000Z".into(),
            branch: "main".into(),
            owner: "acme".into(),
            url: None,
        }
    }

    #[test]
    fn first_release_is_best_effort_endpoint() {
        let (dir, store) = tmp_store();
        seed_commits(&store, "x", &["a", "b", "c"]);
        let rl = ledger(&store);
        assert!(rl.archive_and_rotate("x", "dev").unwrap().is_none());
        let rel = rl.compute_release("x", "dev", None, "c").unwrap();
        assert_eq!(rel.commits.len(), 1);
        assert_eq!(rel.commits[0].sha, "c");
        assert_eq!(rl.latest("x", "dev").unwrap().unwrap(), rel);
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rotation_archives_prior_and_computes_range() {
        let (dir, store) = tmp_store();
        seed_commits(&store, "x", &["a", "b", "c", "d"]);
        let rl = ledger(&store);
        let first = rl.compute_release("x", "dev", None, "b").unwrap();

        let prior = rl.archive_and_rotate("x", "dev").unwrap().unwrap();
        assert_eq!(prior, first);
        let second = rl.compute_release("x", "dev", Some(&prior), "d").unwrap();
        let shas: Vec<_> = second.commits.iter().map(|c| c.sha.as_str()).collect();
        assert_eq!(shas, ["c", "d"]);

        let history = rl.list_releases("x", "dev", 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].sha, "d");
        assert_eq!(history[1].sha, "b");
        assert_eq!(rl.list_releases("x", "dev", 1).unwrap().len(), 1);
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn prep_uses_next_env_release_then_pointer() {
        let (dir, store) = tmp_store();
        seed_commits(&store, "x", &["a", "b", "c", "d"]);
        let rl = ledger(&store);

        rl.update_env_pointer("test", "x", &entry("a")).unwrap();
        let prep = rl.prep_promotion("x", "dev", "test", "c").unwrap();
        assert_eq!(prep.base_sha.as_deref(), Some("a"));
        assert_eq!(prep.commits.len(), 2);

        rl.compute_release("x", "test", None, "b").unwrap();
        let prep = rl.prep_promotion("x", "dev", "test", "c").unwrap();
        assert_eq!(prep.base_sha.as_deref(), Some("b"));
        assert_eq!(prep.commits.len(), 1);

        // Already promoted: nothing would ship.
        let prep = rl.prep_promotion("x", "dev", "test", "b").unwrap();
        assert!(prep.commits.is_empty());
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn diff_reports_drift_between_environments() {
        let (dir, store) = tmp_store();
        seed_commits(&store, "r", &["b", "m", "a"]);
        let rl = ledger(&store);
        rl.update_env_pointer("dev", "r", &entry("a")).unwrap();
        rl.update_env_pointer("test", "r", &entry("b")).unwrap();
        rl.update_env_pointer("dev", "same", &entry("s")).unwrap();
        rl.update_env_pointer("test", "same", &entry("s")).unwrap();
        rl.update_env_pointer("test", "legacy", &entry("l")).unwrap();
        rl.update_env_pointer("dev", "skip-me", &entry("z")).unwrap();

        let chain = PromotionChain::default();
        // Argument order does not matter.
        let diff = rl
            .diff_environments(&chain, "test", "dev", &["skip-me".to_string()])
            .unwrap();
        assert_eq!(diff.lower, "dev");
        assert_eq!(diff.higher, "test");
        assert_eq!(diff.in_sync, vec!["same".to_string()]);
        assert_eq!(diff.out_of_sync.len(), 2);

        let legacy = &diff.out_of_sync[0];
        assert_eq!(legacy.repo, "legacy");
        assert_eq!(legacy.outcome, RepoDiffOutcome::MissingFromLower);

        let r = &diff.out_of_sync[1];
        assert_eq!(r.lower_sha.as_deref(), Some("a"));
        assert_eq!(r.higher_sha.as_deref(), Some("b"));
        match &r.outcome {
            RepoDiffOutcome::Ahead { commits } => {
                let shas: Vec<_> = commits.iter().map(|c| c.sha.as_str()).collect();
                assert_eq!(shas, ["m", "a"]);
            }
            other => panic!("unexpected {other:?}"),
        }

        let msg = diff.to_message();
        assert_eq!(msg.sections[0].kind, SectionKind::InSync);
        assert!(msg.sections[2].body.contains("- m change m"));
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn diff_isolates_per_repository_failures() {
        let (dir, store) = tmp_store();
        seed_commits(&store, "good", &["g1", "g2"]);
        {
            let rl = ledger(&store);
            rl.update_env_pointer("dev", "good", &entry("g2")).unwrap();
            rl.update_env_pointer("test", "good", &entry("g1")).unwrap();
            rl.update_env_pointer("dev", "bad", &entry("b2")).unwrap();
            rl.update_env_pointer("test", "bad", &entry("b1")).unwrap();
        }
        let mut flaky = FlakyStore::new(&store);
        flaky.poisoned.push(keys::commit_ref_pk("bad"));
        let rl = ledger(&flaky);
        let diff = rl
            .diff_environments(&PromotionChain::default(), "dev", "test", &[])
            .unwrap();
        assert_eq!(diff.out_of_sync.len(), 2);
        assert!(matches!(diff.out_of_sync[0].outcome, RepoDiffOutcome::Failed { .. }));
        assert!(matches!(
            diff.out_of_sync[1].outcome,
            RepoDiffOutcome::Ahead { ref commits } if commits.len() == 1
        ));
        drop(rl);
        drop(flaky);
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn diff_of_unknown_env_is_invalid() {
        let (dir, store) = tmp_store();
        let rl = ledger(&store);
        let err = rl
            .diff_environments(&PromotionChain::default(), "dev", "qa", &[])
            .unwrap_err();
        assert!(matches!(err, FerryError::InvalidEvent(_)));
        // Empty environments diff cleanly.
        let diff = rl
            .diff_environments(&PromotionChain::default(), "dev", "prod", &[])
            .unwrap();
        assert!(diff.in_sync.is_empty() && diff.out_of_sync.is_empty());
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn summarizer_failure_does_not_block_release() {
        struct Down;
        impl Summarizer for Down {
            fn summarize(&self, _: SummaryKind, _: &serde_json::Value) -> FerryResult<String> {
                Err(FerryError::upstream("summarizer", "timeout"))
            }
        }
        let (dir, store) = tmp_store();
        seed_commits(&store, "x", &["a", "b"]);
        let rl = ReleaseLedger::new(&store, CommitLedger::new(&store, 10, 30), Some(&Down), 30);
        let rel = rl.compute_release("x", "dev", None, "b").unwrap();
        assert!(rel.summary.is_none());
        assert_eq!(rel.commits.len(), 1);
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
