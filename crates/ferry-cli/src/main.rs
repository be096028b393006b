mod cmd_config;
mod cmd_diff;
mod cmd_events;
mod cmd_gc;
mod cmd_init;
mod cmd_query;
mod cmd_serve;
mod workspace;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd_config::ConfigCmd;

#[derive(Parser)]
#[command(
    name = "ferry",
    version,
    about = "Deployment tracking, release ledgers and approval-gated promotion"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize a new .ferry/ workspace
    Init,
    /// Start the webhook/action HTTP server
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 7433)]
        port: u16,
    },
    /// Apply a normalized deployment status update from a JSON file
    Apply {
        file: PathBuf,
        /// Leave derived events in the outbox
        #[arg(long)]
        no_drain: bool,
    },
    /// Record pushed commits from a JSON file
    Push { file: PathBuf },
    /// Approve or reject the promotion of a deployment
    Decide {
        repo: String,
        env: String,
        deployment_id: String,
        /// approve | reject
        decision: String,
        /// Who is deciding
        #[arg(long)]
        actor: String,
        /// Leave derived events in the outbox
        #[arg(long)]
        no_drain: bool,
    },
    /// Show commits deployed to the lower environment but not the higher one
    Diff {
        env_a: String,
        env_b: String,
        /// Repositories to skip (repeatable)
        #[arg(long = "exclude")]
        exclude: Vec<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List commits after <start> up to and including <end>
    Commits {
        repo: String,
        start: String,
        end: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List releases for a repository in an environment, newest first
    Releases {
        repo: String,
        env: String,
        /// Maximum number of releases to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the current deployment and its history
    Status {
        repo: String,
        env: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Deliver pending outbox events
    Drain {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Remove expired items from the store
    Gc {
        /// Report counts without removing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Read or edit .ferry/config.json
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

fn main() -> anyhow::Result<()> {
    let mut filter = EnvFilter::from_default_env();
    for target in ["ferry", "ferry_core", "ferry_ledger", "ferry_notify", "ferry_serve"] {
        filter = filter.add_directive(format!("{target}=info").parse()?);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let repo_root = std::env::current_dir()?;

    match cli.cmd {
        Command::Init => cmd_init::execute(&repo_root),
        Command::Serve { bind, port } => cmd_serve::execute(&repo_root, &bind, port),
        Command::Apply { file, no_drain } => cmd_events::apply(&repo_root, &file, no_drain),
        Command::Push { file } => cmd_events::push(&repo_root, &file),
        Command::Decide {
            repo,
            env,
            deployment_id,
            decision,
            actor,
            no_drain,
        } => cmd_events::decide(
            &repo_root,
            &repo,
            &env,
            &deployment_id,
            &decision,
            &actor,
            no_drain,
        ),
        Command::Diff {
            env_a,
            env_b,
            exclude,
            json,
        } => cmd_diff::execute(&repo_root, &env_a, &env_b, &exclude, json),
        Command::Commits {
            repo,
            start,
            end,
            json,
        } => cmd_query::commits(&repo_root, &repo, &start, &end, json),
        Command::Releases {
            repo,
            env,
            limit,
            json,
        } => cmd_query::releases(&repo_root, &repo, &env, limit, json),
        Command::Status { repo, env, json } => cmd_query::status(&repo_root, &repo, &env, json),
        Command::Drain { limit } => cmd_gc::drain(&repo_root, limit),
        Command::Gc { dry_run } => cmd_gc::execute(&repo_root, dry_run),
        Command::Config { cmd } => cmd_config::run(cmd, &repo_root),
    }
}
