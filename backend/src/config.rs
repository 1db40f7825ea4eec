use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::uploads::DEFAULT_MAX_IMAGE_BYTES;

pub const DEFAULT_CONFIG_FILE: &str = "story.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "sqlite" => Ok(StoreBackend::Sqlite),
            other => bail!("unknown store backend {other:?}; expected memory or sqlite"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub store: StoreBackend,
    pub database_url: String,
    pub persist_path: Option<PathBuf>,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub code_seed: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".into(),
            store: StoreBackend::Memory,
            database_url: "sqlite://./data/story.db".into(),
            persist_path: None,
            upload_dir: PathBuf::from("./uploads"),
            max_upload_bytes: DEFAULT_MAX_IMAGE_BYTES,
            code_seed: None,
        }
    }
}

/// Defaults, then the TOML file (`STORY_CONFIG` or `story.toml`), then the
/// environment.
pub fn load_settings() -> anyhow::Result<Settings> {
    let path = std::env::var("STORY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
    let file = read_config_file(&path)?;
    let env: HashMap<String, String> = std::env::vars().collect();
    resolve(file, &env)
}

fn read_config_file(path: &Path) -> anyhow::Result<HashMap<String, toml::Value>> {
    match fs::read_to_string(path) {
        Ok(raw) => toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file {}", path.display()))
        }
    }
}

fn resolve(
    file: HashMap<String, toml::Value>,
    env: &HashMap<String, String>,
) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    let mut values: HashMap<&str, String> = HashMap::new();
    for (key, value) in &file {
        let text = match value {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        values.insert(key.as_str(), text);
    }
    for (key, var) in [
        ("bind_addr", "STORY_BIND"),
        ("store", "STORY_STORE"),
        ("database_url", "DATABASE_URL"),
        ("persist_path", "PERSIST_PATH"),
        ("upload_dir", "STORY_UPLOAD_DIR"),
        ("max_upload_bytes", "STORY_MAX_UPLOAD_BYTES"),
        ("code_seed", "STORY_CODE_SEED"),
    ] {
        if let Some(v) = env.get(var) {
            values.insert(key, v.clone());
        }
    }

    if let Some(v) = values.get("bind_addr") {
        settings.bind_addr = v.clone();
    }
    if let Some(v) = values.get("store") {
        settings.store = v.parse()?;
    }
    if let Some(v) = values.get("database_url") {
        settings.database_url = v.clone();
    }
    if let Some(v) = values.get("persist_path").filter(|v| !v.is_empty()) {
        settings.persist_path = Some(PathBuf::from(v));
    }
    if let Some(v) = values.get("upload_dir") {
        settings.upload_dir = PathBuf::from(v);
    }
    if let Some(v) = values.get("max_upload_bytes") {
        settings.max_upload_bytes = v
            .trim()
            .parse()
            .with_context(|| format!("max_upload_bytes must be a byte count, got {v:?}"))?;
    }
    if let Some(v) = values.get("code_seed").filter(|v| !v.is_empty()) {
        settings.code_seed = Some(
            v.trim()
                .parse()
                .with_context(|| format!("code_seed must be an unsigned integer, got {v:?}"))?,
        );
    }

    Ok(settings)
}
