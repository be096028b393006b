pub mod approvals;
pub mod commits;
pub mod deployments;
pub mod keys;
pub mod paths;
pub mod pipeline;
pub mod releases;
pub mod sqlite_store;
pub mod store;

#[cfg(test)]
mod testutil;

pub use approvals::{ApprovalWorkflow, DecisionOutcome};
pub use commits::CommitLedger;
pub use deployments::{ApplyOutcome, DeploymentTracker};
pub use paths::FerryPaths;
pub use pipeline::{CommitPush, Pipeline, StatusOutcome};
pub use releases::{EnvDiff, ReleaseLedger, RepoDiff, RepoDiffOutcome};
pub use sqlite_store::SqliteStore;
pub use store::{Guard, Item, ItemStore, Order, Page, SkRange, Versioned};
