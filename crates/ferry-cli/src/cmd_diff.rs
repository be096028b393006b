use std::path::Path;

use ferry_core::types::short_sha;
use ferry_ledger::RepoDiffOutcome;

use crate::workspace::Workspace;

/// `ferry diff <envA> <envB>`
pub fn execute(
    repo_root: &Path,
    env_a: &str,
    env_b: &str,
    exclude: &[String],
    json: bool,
) -> anyhow::Result<()> {
    let ws = Workspace::open(repo_root)?;
    let diff = ws.pipeline().handle_diff_request(env_a, env_b, exclude)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&diff)?);
        return Ok(());
    }

    println!("{} -> {}", diff.lower, diff.higher);
    if diff.in_sync.is_empty() {
        println!("In sync: (none)");
    } else {
        println!("In sync: {}", diff.in_sync.join(", "));
    }
    for repo in &diff.out_of_sync {
        let lower = repo.lower_sha.as_deref().map_or("-", short_sha);
        let higher = repo.higher_sha.as_deref().map_or("-", short_sha);
        println!();
        println!("{} ({lower} vs {higher})", repo.repo);
        match &repo.outcome {
            RepoDiffOutcome::Ahead { commits } if commits.is_empty() => {
                println!("  no commits resolved between the two shas")
            }
            RepoDiffOutcome::Ahead { commits } => {
                for c in commits {
                    println!("  {} {}", short_sha(&c.sha), c.message.lines().next().unwrap_or(""));
                }
            }
            RepoDiffOutcome::MissingFromLower => println!("  not deployed to {}", diff.lower),
            RepoDiffOutcome::Failed { error } => println!("  failed: {error}"),
        }
    }
    Ok(())
}
