use std::path::Path;

use ferry_core::config::FerryConfig;
use ferry_ledger::{FerryPaths, SqliteStore};

pub fn execute(repo_root: &Path) -> anyhow::Result<()> {
    let paths = FerryPaths::discover(repo_root);

    if paths.is_initialized() {
        // Ensure the schema exists even if .ferry/ was partially created
        drop(SqliteStore::open_or_create(&paths.db_path)?);
        println!("Already initialized at {}", paths.ferry_dir.display());
        return Ok(());
    }

    paths.ensure_layout()?;
    drop(SqliteStore::open_or_create(&paths.db_path)?);

    if !paths.config_json.exists() {
        let json = serde_json::to_string_pretty(&FerryConfig::default())?;
        std::fs::write(&paths.config_json, json.as_bytes())?;
    }

    println!("Initialized ferry workspace at {}", paths.ferry_dir.display());
    println!("  database: {}", paths.db_path.display());
    println!("  config:   {}", paths.config_json.display());
    Ok(())
}
