use std::path::{Path, PathBuf};

/// All well-known paths under `.ferry/`.
#[derive(Debug, Clone)]
pub struct FerryPaths {
    pub root: PathBuf,
    pub ferry_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_json: PathBuf,
}

impl FerryPaths {
    /// Derive all paths from a workspace root. Pure computation, no I/O.
    pub fn discover(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let ferry_dir = root.join(".ferry");
        Self {
            db_path: ferry_dir.join("ferry.db"),
            config_json: ferry_dir.join("config.json"),
            ferry_dir,
            root,
        }
    }

    /// Create the `.ferry/` directory. Idempotent.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.ferry_dir)
    }

    /// Check whether `.ferry/` exists.
    pub fn is_initialized(&self) -> bool {
        self.ferry_dir.is_dir()
    }

    /// Walk up from `start` looking for a directory containing `.ferry/`.
    pub fn find_root(start: &Path) -> Option<PathBuf> {
        let mut cur = start.to_path_buf();
        loop {
            if cur.join(".ferry").is_dir() {
                return Some(cur);
            }
            if !cur.pop() {
                return None;
            }
        }
    }
}
