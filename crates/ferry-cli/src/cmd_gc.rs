use std::path::Path;

use ferry_core::clock::unix_now;
use tracing::info;

use crate::workspace::Workspace;

/// `ferry drain`: deliver pending outbox events.
pub fn drain(repo_root: &Path, limit: usize) -> anyhow::Result<()> {
    let ws = Workspace::open(repo_root)?;
    let report = ws.drain(limit)?;
    println!(
        "delivered {}, failed {}, dropped {}",
        report.delivered, report.failed, report.dropped
    );
    Ok(())
}

/// `ferry gc`: physically remove expired commits, history and archived releases.
pub fn execute(repo_root: &Path, dry_run: bool) -> anyhow::Result<()> {
    let ws = Workspace::open(repo_root)?;
    println!("Items by family:");
    for (family, count) in ws.store.item_counts()? {
        println!("  {family:<12} {count}");
    }
    if dry_run {
        println!("(dry run, nothing removed)");
        return Ok(());
    }
    let removed = ws.store.purge_expired(unix_now())?;
    info!(removed, root = %ws.paths.root.display(), "gc complete");
    println!("Removed {removed} expired item(s)");
    Ok(())
}
