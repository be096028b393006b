//! Feed events to the pipeline from files, then deliver what they produced.

use std::path::Path;

use ferry_core::types::{Decision, StatusUpdate};
use ferry_ledger::CommitPush;

use crate::workspace::Workspace;

const DRAIN_LIMIT: usize = 100;

fn read_json<T: serde::de::DeserializeOwned>(file: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| anyhow::anyhow!("{}: {e}", file.display()))?;
    serde_json::from_str(&content).map_err(|e| anyhow::anyhow!("{}: {e}", file.display()))
}

fn report_drain(ws: &Workspace, no_drain: bool) -> anyhow::Result<()> {
    if no_drain {
        return Ok(());
    }
    let report = ws.drain(DRAIN_LIMIT)?;
    if report.failed > 0 {
        println!(
            "{} event(s) delivered, {} left pending (see `ferry drain`)",
            report.delivered, report.failed
        );
    }
    Ok(())
}

/// `ferry apply <file.json>`: replay one normalized status update.
pub fn apply(repo_root: &Path, file: &Path, no_drain: bool) -> anyhow::Result<()> {
    let update: StatusUpdate = read_json(file)?;
    let ws = Workspace::open(repo_root)?;
    let outcome = ws.pipeline().handle_deployment_status(&update)?;

    let verb = if outcome.applied.accepted { "applied" } else { "unchanged" };
    println!(
        "{verb}: {}/{} {} -> {}",
        update.repo, update.env, update.deployment_id, update.status
    );
    if let Some(prior) = &outcome.applied.superseded_prior {
        println!("  superseded {}", prior.deployment_id);
    }
    if let Some(record) = &outcome.applied.current {
        println!("  approval: {}", record.approval.label());
    }
    if let Some(release) = &outcome.release {
        println!(
            "  release {} with {} commit(s)",
            ferry_core::types::short_sha(&release.sha),
            release.commits.len()
        );
    }
    report_drain(&ws, no_drain)
}

/// `ferry push <file.json>`: record a batch of pushed commits.
pub fn push(repo_root: &Path, file: &Path) -> anyhow::Result<()> {
    let push: CommitPush = read_json(file)?;
    let ws = Workspace::open(repo_root)?;
    let recorded = ws.pipeline().handle_commit_push(&push)?;
    println!("recorded {} commit(s) for {}", recorded.len(), push.repo);
    Ok(())
}

/// `ferry decide <repo> <env> <deployment_id> approve|reject --actor <name>`
pub fn decide(
    repo_root: &Path,
    repo: &str,
    env: &str,
    deployment_id: &str,
    decision: &str,
    actor: &str,
    no_drain: bool,
) -> anyhow::Result<()> {
    let decision: Decision = decision.parse()?;
    let ws = Workspace::open(repo_root)?;
    let outcome = ws
        .pipeline()
        .handle_decision(repo, env, deployment_id, decision, actor)?;
    if outcome.accepted {
        println!("{repo}/{env} {deployment_id}: {}", outcome.record.approval.label());
    } else {
        println!("{repo}/{env} {deployment_id}: already {}", outcome.record.approval.label());
    }
    if let Some(promotion) = &outcome.promotion {
        println!("  promotion to {} requested", promotion.next_env);
    }
    report_drain(&ws, no_drain)
}
