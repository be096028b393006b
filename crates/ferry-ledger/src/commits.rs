//! Commit ledger: per-repository commit records plus the sparse sha → timestamp
//! index used to bound range scans.

use ferry_core::clock::{expires_in_days, normalize_timestamp};
use ferry_core::error::{FerryError, FerryResult};
use ferry_core::types::{CommitRecord, CommitRef, NewCommit};
use tracing::{debug, info};

use crate::keys;
use crate::store::{load, query_all, save, Guard, ItemStore, Order, SkRange};

pub struct CommitLedger<'a> {
    store: &'a dyn ItemStore,
    page_size: usize,
    retention_days: u32,
}

impl<'a> CommitLedger<'a> {
    pub fn new(store: &'a dyn ItemStore, page_size: usize, retention_days: u32) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            retention_days,
        }
    }

    /// Record a commit and its index entry. Idempotent on `(repo, sha)`.
    ///
    /// The first write fixes the commit's position; re-recording only refreshes
    /// enrichment fields (`summary`, a missing `parent_sha`).
    pub fn record(&self, repo: &str, commit: &NewCommit) -> FerryResult<CommitRecord> {
        if repo.trim().is_empty() || commit.sha.trim().is_empty() {
            return Err(FerryError::invalid("commit requires repo and sha"));
        }
        let expires_at = Some(expires_in_days(self.retention_days));

        if let Some(existing) = self.lookup(repo, &commit.sha)? {
            let prior = load::<CommitRecord>(self.store, &keys::commit_pk(repo), &existing.sort_key)?;
            if let Some(prior) = prior {
                let mut merged = prior.value;
                if commit.summary.is_some() {
                    merged.summary = commit.summary.clone();
                }
                if merged.parent_sha.is_none() {
                    merged.parent_sha = commit.parent_sha.clone();
                }
                save(
                    self.store,
                    &keys::commit_pk(repo),
                    &existing.sort_key,
                    &merged,
                    expires_at,
                    Guard::None,
                )?;
                debug!(repo, sha = %commit.sha, "commit re-recorded");
                return Ok(merged);
            }
        }

        let committed_at = normalize_timestamp(&commit.committed_at)?;
        let sort_key = keys::commit_sk(&committed_at, &commit.sha);
        let record = CommitRecord {
            repo: repo.to_string(),
            sha: commit.sha.clone(),
            committed_at: committed_at.clone(),
            message: commit.message.clone(),
            author: commit.author.clone(),
            summary: commit.summary.clone(),
            parent_sha: commit.parent_sha.clone(),
        };
        save(
            self.store,
            &keys::commit_pk(repo),
            &sort_key,
            &record,
            expires_at,
            Guard::None,
        )?;
        let index = CommitRef {
            sha: commit.sha.clone(),
            committed_at,
            sort_key,
            parent_sha: commit.parent_sha.clone(),
        };
        save(
            self.store,
            &keys::commit_ref_pk(repo),
            &commit.sha,
            &index,
            expires_at,
            Guard::None,
        )?;
        info!(repo, sha = %commit.sha, committed_at = %index.committed_at, "commit recorded");
        Ok(record)
    }

    /// Attach a generated summary to an already-recorded commit.
    pub fn set_summary(&self, repo: &str, sha: &str, summary: &str) -> FerryResult<bool> {
        let Some(index) = self.lookup(repo, sha)? else {
            return Ok(false);
        };
        let pk = keys::commit_pk(repo);
        let Some(current) = load::<CommitRecord>(self.store, &pk, &index.sort_key)? else {
            return Ok(false);
        };
        let mut record = current.value;
        record.summary = Some(summary.to_string());
        save(
            self.store,
            &pk,
            &index.sort_key,
            &record,
            Some(expires_in_days(self.retention_days)),
            Guard::None,
        )
    }

    /// Index lookup. A miss is expected for old or never-observed commits.
    pub fn lookup(&self, repo: &str, sha: &str) -> FerryResult<Option<CommitRef>> {
        Ok(load::<CommitRef>(self.store, &keys::commit_ref_pk(repo), sha)?.map(|v| v.value))
    }

    pub fn get(&self, repo: &str, sha: &str) -> FerryResult<Option<CommitRecord>> {
        let Some(index) = self.lookup(repo, sha)? else {
            return Ok(None);
        };
        Ok(load::<CommitRecord>(self.store, &keys::commit_pk(repo), &index.sort_key)?
            .map(|v| v.value))
    }

    /// Commits strictly after `start_sha` up to and including `end_sha`, oldest first.
    ///
    /// An unresolved start degrades to the end commit alone (or nothing when the
    /// end is unresolved too); an unresolved end leaves the range open up to now.
    pub fn resolve_range(
        &self,
        repo: &str,
        start_sha: Option<&str>,
        end_sha: &str,
    ) -> FerryResult<Vec<CommitRecord>> {
        let start = match start_sha {
            Some(sha) => self.lookup(repo, sha)?,
            None => None,
        };
        let end = self.lookup(repo, end_sha)?;

        let Some(start) = start else {
            let unresolved = FerryError::UnresolvedRange {
                repo: repo.to_string(),
                detail: format!("start {} not indexed", start_sha.unwrap_or("<none>")),
            };
            debug!(error = %unresolved, "falling back to end commit");
            return match end {
                Some(_) => Ok(self.get(repo, end_sha)?.into_iter().collect()),
                None => Ok(Vec::new()),
            };
        };

        let range = SkRange {
            start: Some(start.committed_at.clone()),
            end: end.as_ref().map(|e| keys::commit_sk_upper(&e.committed_at)),
        };
        let items = query_all(
            self.store,
            &keys::commit_pk(repo),
            &range,
            Order::Ascending,
            self.page_size,
        )?;

        let mut commits = items
            .iter()
            .map(|item| Ok((item.decode::<CommitRecord>()?, item.seq)))
            .collect::<FerryResult<Vec<_>>>()?;
        // Same-instant commits keep arrival order.
        commits.sort_by(|(a, sa), (b, sb)| {
            a.committed_at.cmp(&b.committed_at).then(sa.cmp(sb))
        });
        let mut commits: Vec<CommitRecord> = commits.into_iter().map(|(c, _)| c).collect();

        if let Some(pos) = commits.iter().position(|c| c.sha == start.sha) {
            commits.drain(..=pos);
        }
        if end.is_some() {
            if let Some(pos) = commits.iter().position(|c| c.sha == end_sha) {
                commits.truncate(pos + 1);
            }
        }
        Ok(commits)
    }
}
