use std::path::Path;

use ferry_ledger::FerryPaths;
use ferry_serve::ServeConfig;

pub fn execute(repo_root: &Path, bind: &str, port: u16) -> anyhow::Result<()> {
    let root = FerryPaths::find_root(repo_root).unwrap_or_else(|| repo_root.to_path_buf());
    let config = ServeConfig {
        bind: bind.to_string(),
        port,
    };
    tokio::runtime::Runtime::new()?.block_on(ferry_serve::serve(&root, config))
}
