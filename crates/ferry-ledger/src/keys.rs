//! Partition and sort key layout.

pub const LATEST: &str = "LATEST";

/// Current deployment and its history share one partition per (repo, env).
pub fn deployment_pk(repo: &str, env: &str) -> String {
    format!("REPO#{repo}#ENV#{env}")
}

pub fn deployment_history_sk(deployment_id: &str) -> String {
    format!("DEPLOYMENT#{deployment_id}")
}

pub fn commit_pk(repo: &str) -> String {
    format!("COMMIT#{repo}")
}

/// `<committedAt>#<sha>`: sorts by time, and same-instant commits never collide.
pub fn commit_sk(committed_at: &str, sha: &str) -> String {
    format!("{committed_at}#{sha}")
}

/// Inclusive upper bound covering every commit recorded at `committed_at`.
pub fn commit_sk_upper(committed_at: &str) -> String {
    format!("{committed_at}#\u{10FFFF}")
}

pub fn commit_ref_pk(repo: &str) -> String {
    format!("COMMITREF#{repo}")
}

/// Environment pointers all live under the `LATEST` partition.
pub fn env_pointer_pk() -> &'static str {
    LATEST
}

/// JSON path of one repository's entry inside an `EnvLatestPointer` body.
pub fn env_pointer_repo_path(repo: &str) -> String {
    format!("$.repos.\"{}\"", repo.replace('"', ""))
}

pub fn release_pk(repo: &str, env: &str) -> String {
    format!("RELEASE#{repo}#{env}")
}
