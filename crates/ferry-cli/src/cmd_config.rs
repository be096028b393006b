use clap::Subcommand;
use ferry_core::config::FerryConfig;
use ferry_ledger::FerryPaths;
use serde_json::{Map, Value};
use std::path::Path;

// ── CLI Schema ──

#[derive(Subcommand)]
pub enum ConfigCmd {
    /// Set a config value
    Set {
        /// Config key, dotted for nested values (e.g. retention.commit_days)
        key: String,
        /// Config value (true/false/number/JSON array/string)
        value: String,
    },
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },
    /// List all config values
    List,
}

// ── Dispatch ──

pub fn run(cmd: ConfigCmd, repo_root: &Path) -> anyhow::Result<()> {
    match cmd {
        ConfigCmd::Set { key, value } => set(repo_root, &key, &value),
        ConfigCmd::Get { key } => get(repo_root, &key),
        ConfigCmd::List => list(repo_root),
    }
}

// ── Command Implementations ──

fn config_path(repo_root: &Path) -> anyhow::Result<std::path::PathBuf> {
    let root = FerryPaths::find_root(repo_root)
        .ok_or_else(|| anyhow::anyhow!("No .ferry/ workspace found. Run `ferry init` first."))?;
    Ok(FerryPaths::discover(root).config_json)
}

/// Read config from `.ferry/config.json`. Returns empty map if file doesn't exist.
fn read_config(path: &Path) -> anyhow::Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let content = std::fs::read_to_string(path)?;
    let val: Value = serde_json::from_str(&content)?;
    match val {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

/// Write config to `.ferry/config.json` via a sibling temp file.
fn write_config(path: &Path, config: &Map<String, Value>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(&config)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Parse a string value into an appropriate JSON value (bool/number/array/string).
fn parse_value(s: &str) -> Value {
    match s {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => {
            if let Ok(n) = s.parse::<i64>() {
                Value::Number(n.into())
            } else if let Ok(f) = s.parse::<f64>() {
                serde_json::json!(f)
            } else if s.starts_with('[') || s.starts_with('{') {
                serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string()))
            } else {
                Value::String(s.to_string())
            }
        }
    }
}

fn lookup<'a>(config: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('.');
    let mut cur = config.get(parts.next()?)?;
    for part in parts {
        cur = cur.get(part)?;
    }
    Some(cur)
}

fn insert(config: &mut Map<String, Value>, key: &str, value: Value) -> anyhow::Result<()> {
    let mut parts: Vec<&str> = key.split('.').collect();
    let leaf = parts
        .pop()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| anyhow::anyhow!("empty config key"))?;
    let mut cur = config;
    for part in parts {
        let entry = cur
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        cur = entry
            .as_object_mut()
            .ok_or_else(|| anyhow::anyhow!("{part} is not an object"))?;
    }
    cur.insert(leaf.to_string(), value);
    Ok(())
}

/// `ferry config set <key> <value>`
pub fn set(repo_root: &Path, key: &str, value: &str) -> anyhow::Result<()> {
    let path = config_path(repo_root)?;
    let mut config = read_config(&path)?;
    insert(&mut config, key, parse_value(value))?;
    // Refuse to write a config the service could not load.
    FerryConfig::from_json(&Value::Object(config.clone()).to_string())?;
    write_config(&path, &config)?;
    println!("{key} = {value}");
    Ok(())
}

/// `ferry config get <key>`
pub fn get(repo_root: &Path, key: &str) -> anyhow::Result<()> {
    let path = config_path(repo_root)?;
    let config = read_config(&path)?;
    match lookup(&config, key) {
        Some(val) => println!("{val}"),
        None => println!("(not set)"),
    }
    Ok(())
}

/// `ferry config list`
pub fn list(repo_root: &Path) -> anyhow::Result<()> {
    let path = config_path(repo_root)?;
    let config = read_config(&path)?;
    if config.is_empty() {
        println!("(no config set)");
    } else {
        for (k, v) in &config {
            println!("{k} = {v}");
        }
    }
    Ok(())
}
