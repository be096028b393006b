use std::path::Path;

use ferry_core::types::short_sha;

use crate::workspace::Workspace;

/// `ferry commits <repo> <start> <end>`: commits after `start` up to `end`.
pub fn commits(repo_root: &Path, repo: &str, start: &str, end: &str, json: bool) -> anyhow::Result<()> {
    let ws = Workspace::open(repo_root)?;
    let commits = ws.pipeline().commits().resolve_range(repo, Some(start), end)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&commits)?);
        return Ok(());
    }
    if commits.is_empty() {
        println!("(no commits)");
    }
    for c in &commits {
        println!(
            "{} {} {:<16} {}",
            c.committed_at,
            short_sha(&c.sha),
            c.author,
            c.message.lines().next().unwrap_or("")
        );
        if let Some(summary) = &c.summary {
            println!("    {summary}");
        }
    }
    Ok(())
}

/// `ferry releases <repo> <env>`: latest release first, then the archive.
pub fn releases(repo_root: &Path, repo: &str, env: &str, limit: usize, json: bool) -> anyhow::Result<()> {
    let ws = Workspace::open(repo_root)?;
    let releases = ws.pipeline().releases().list_releases(repo, env, limit)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&releases)?);
        return Ok(());
    }
    if releases.is_empty() {
        println!("(no releases for {repo} in {env})");
    }
    for r in &releases {
        println!(
            "{} {} ({} commit(s))",
            r.released_on,
            short_sha(&r.sha),
            r.commits.len()
        );
        if let Some(summary) = &r.summary {
            println!("    {summary}");
        }
    }
    Ok(())
}

/// `ferry status <repo> <env>`: current deployment and archived attempts.
pub fn status(repo_root: &Path, repo: &str, env: &str, json: bool) -> anyhow::Result<()> {
    let ws = Workspace::open(repo_root)?;
    let tracker = ws.pipeline().tracker();
    let current = tracker.current(repo, env)?.map(|v| v.value);
    let history = tracker.list_history(repo, env)?;

    if json {
        let out = serde_json::json!({ "current": current, "history": history });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    match &current {
        Some(record) => {
            println!("{}", record.message.headline);
            println!("  deployment: {}", record.deployment_id);
            println!("  sha:        {}", record.sha);
            println!("  updated:    {}", record.updated_at);
            println!("  approval:   {}", record.approval.label());
        }
        None => println!("No deployment recorded for {repo} in {env}"),
    }
    if !history.is_empty() {
        println!("History:");
        for h in &history {
            println!(
                "  {} {} {} ({})",
                h.archived_at,
                h.record.deployment_id,
                h.record.status,
                h.record.approval.label()
            );
        }
    }
    Ok(())
}
