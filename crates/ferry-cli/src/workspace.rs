use std::path::Path;

use ferry_core::config::FerryConfig;
use ferry_ledger::{FerryPaths, Pipeline, SqliteStore};
use ferry_notify::{Collaborators, Dispatcher, DrainReport};

/// An opened `.ferry/` workspace: config, store and collaborators.
pub struct Workspace {
    pub paths: FerryPaths,
    pub config: FerryConfig,
    pub store: SqliteStore,
    pub collaborators: Collaborators,
}

impl Workspace {
    /// Open the workspace containing `start`, walking up like `git` does.
    pub fn open(start: &Path) -> anyhow::Result<Self> {
        let root = FerryPaths::find_root(start).ok_or_else(|| {
            anyhow::anyhow!("No .ferry/ workspace found. Run `ferry init` first.")
        })?;
        let paths = FerryPaths::discover(root);
        let config = FerryConfig::load(&paths.config_json)?;
        let store = SqliteStore::open(&paths.db_path)?;
        let collaborators = Collaborators::from_config(&config);
        Ok(Self {
            paths,
            config,
            store,
            collaborators,
        })
    }

    pub fn pipeline(&self) -> Pipeline<'_> {
        Pipeline::new(&self.store, &self.store, &self.config)
            .with_summarizer(self.collaborators.summarizer())
            .with_source_control(self.collaborators.source())
    }

    pub fn drain(&self, limit: usize) -> anyhow::Result<DrainReport> {
        let report = Dispatcher::new(&self.store, &self.store, &self.store, &self.config)
            .with_source_control(self.collaborators.source())
            .with_chat(self.collaborators.chat())
            .drain(limit)?;
        Ok(report)
    }
}
