//! Configuration sources and the loader that layers them.
//!
//! Each source yields a JSON object. Sources added first take priority:
//! objects are merged key by key, so a higher source only overrides the
//! leaves it actually sets.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::{ConfigError, ConfigResult, GovernorConfig};

pub const ENV_PREFIX: &str = "AGENT_GOVERNOR_";

#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Source name for logging
    fn name(&self) -> &str;

    /// The layer this source contributes.
    async fn load(&self) -> ConfigResult<Map<String, Value>>;
}

/// Code-defined values, addressed by dotted path (`retry.max_retries`).
#[derive(Debug)]
pub struct MemoryConfigSource {
    data: RwLock<Map<String, Value>>,
    name: String,
}

impl MemoryConfigSource {
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            data: RwLock::new(Map::new()),
            name: name.into(),
        }
    }

    /// Seed from a JSON object; anything else yields an empty source.
    pub fn from_value(value: Value) -> Self {
        let data = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            data: RwLock::new(data),
            name: "memory".into(),
        }
    }

    pub fn value(mut self, path: &str, value: impl Into<Value>) -> Self {
        set_path(self.data.get_mut(), path, value.into());
        self
    }

    pub async fn insert(&self, path: &str, value: impl Into<Value>) {
        set_path(&mut *self.data.write().await, path, value.into());
    }

    pub async fn clear(&self) {
        self.data.write().await.clear();
    }
}

impl Default for MemoryConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> ConfigResult<Map<String, Value>> {
        Ok(self.data.read().await.clone())
    }
}

/// Environment variables under a prefix; `__` separates nesting levels.
///
/// `AGENT_GOVERNOR_RETRY__MAX_RETRIES=5` sets `retry.max_retries`. Values
/// are parsed as JSON where possible and kept as strings otherwise.
#[derive(Debug, Clone)]
pub struct EnvConfigSource {
    prefix: String,
    vars: Option<Vec<(String, String)>>,
}

impl EnvConfigSource {
    pub fn new() -> Self {
        Self::prefixed(ENV_PREFIX)
    }

    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            vars: None,
        }
    }

    /// Read from the given pairs instead of the process environment.
    pub fn with_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.vars = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    fn key_from_env(&self, env_name: &str) -> Option<String> {
        let rest = env_name.strip_prefix(&self.prefix)?;
        if rest.is_empty() {
            return None;
        }
        Some(rest.to_lowercase().replace("__", "."))
    }
}

impl Default for EnvConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigSource for EnvConfigSource {
    fn name(&self) -> &str {
        "env"
    }

    async fn load(&self) -> ConfigResult<Map<String, Value>> {
        let vars: Vec<(String, String)> = match &self.vars {
            Some(vars) => vars.clone(),
            None => std::env::vars().collect(),
        };

        let mut map = Map::new();
        for (name, raw) in vars {
            if let Some(path) = self.key_from_env(&name) {
                let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                set_path(&mut map, &path, value);
            }
        }
        Ok(map)
    }
}

/// JSON file. A missing file is an empty layer unless marked required.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
    required: bool,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn load(&self) -> ConfigResult<Map<String, Value>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !self.required => {
                tracing::debug!(path = %self.path.display(), "Config file not found, skipping");
                return Ok(Map::new());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        match serde_json::from_str(&content)? {
            Value::Object(map) => Ok(map),
            _ => Err(ConfigError::Source {
                provider: self.path.display().to_string(),
                message: "top-level value must be an object".into(),
            }),
        }
    }
}

/// Builds a [`GovernorConfig`] from ordered sources (first added wins).
#[derive(Default)]
pub struct ConfigLoader {
    sources: Vec<Box<dyn ConfigSource>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn env(self) -> Self {
        self.source(EnvConfigSource::new())
    }

    pub fn env_with_prefix(self, prefix: &str) -> Self {
        self.source(EnvConfigSource::prefixed(prefix))
    }

    pub fn file(self, path: impl AsRef<Path>) -> Self {
        self.source(FileConfigSource::new(path.as_ref()))
    }

    pub fn memory(self, source: MemoryConfigSource) -> Self {
        self.source(source)
    }

    pub fn source(mut self, source: impl ConfigSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// The merged JSON object, before deserialisation.
    pub async fn merged(&self) -> ConfigResult<Value> {
        let mut merged = Map::new();
        for source in self.sources.iter().rev() {
            let layer = source.load().await?;
            tracing::debug!(source = source.name(), keys = layer.len(), "Loaded config layer");
            merge(&mut merged, layer);
        }
        Ok(Value::Object(merged))
    }

    pub async fn load(&self) -> ConfigResult<GovernorConfig> {
        let config: GovernorConfig = serde_json::from_value(self.merged().await?)?;
        config.validate()?;
        Ok(config)
    }
}

impl std::fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigLoader")
            .field("sources", &self.source_names())
            .finish()
    }
}

fn merge(base: &mut Map<String, Value>, upper: Map<String, Value>) {
    for (key, value) in upper {
        match (base.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => merge(existing, incoming),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn set_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts = path.split('.').filter(|p| !p.is_empty()).peekable();
    let mut current = map;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(next) => next,
            _ => return,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Enforcement;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_memory_source_paths() {
        let source = MemoryConfigSource::new()
            .value("retry.max_retries", 7)
            .value("retry.backoff", "constant");
        source.insert("budget.enforcement", "hard").await;

        let layer = source.load().await.unwrap();
        assert_eq!(layer["retry"]["max_retries"], json!(7));
        assert_eq!(layer["budget"]["enforcement"], json!("hard"));
    }

    #[tokio::test]
    async fn test_env_source_nesting_and_parsing() {
        let source = EnvConfigSource::new().with_vars([
            ("AGENT_GOVERNOR_RETRY__MAX_RETRIES", "5"),
            ("AGENT_GOVERNOR_BUDGET__ENFORCEMENT", "soft"),
            ("AGENT_GOVERNOR_FALLBACK_BACKENDS", r#"["haiku"]"#),
            ("UNRELATED", "x"),
        ]);

        let layer = source.load().await.unwrap();
        assert_eq!(layer["retry"]["max_retries"], json!(5));
        assert_eq!(layer["budget"]["enforcement"], json!("soft"));
        assert_eq!(layer["fallback_backends"], json!(["haiku"]));
        assert!(!layer.contains_key("unrelated"));
    }

    #[tokio::test]
    async fn test_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("governor.json");
        tokio::fs::write(&path, r#"{"circuit": {"failure_threshold": 2}}"#)
            .await
            .unwrap();

        let layer = FileConfigSource::new(&path).load().await.unwrap();
        assert_eq!(layer["circuit"]["failure_threshold"], json!(2));

        let missing = FileConfigSource::new(dir.path().join("absent.json"));
        assert!(missing.load().await.unwrap().is_empty());
        assert!(matches!(
            missing.required().load().await,
            Err(ConfigError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_file_source_rejects_non_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.json");
        tokio::fs::write(&path, "[1, 2]").await.unwrap();

        assert!(matches!(
            FileConfigSource::new(&path).load().await,
            Err(ConfigError::Source { .. })
        ));
    }

    #[tokio::test]
    async fn test_loader_priority_and_deep_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("governor.json");
        tokio::fs::write(
            &path,
            r#"{
                "budget": {"daily_limit": "10", "monthly_limit": "100"},
                "retry": {"max_retries": 1, "base_delay_ms": 100}
            }"#,
        )
        .await
        .unwrap();

        let config = ConfigLoader::new()
            .memory(MemoryConfigSource::new().value("budget.daily_limit", "2.5"))
            .source(EnvConfigSource::new().with_vars([("AGENT_GOVERNOR_BUDGET__ENFORCEMENT", "hard")]))
            .file(&path)
            .load()
            .await
            .unwrap();

        assert_eq!(config.budget.daily_limit, Some(dec!(2.5)));
        assert_eq!(config.budget.monthly_limit, Some(dec!(100)));
        assert_eq!(config.budget.enforcement, Some(Enforcement::Hard));
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(
            config.retry.to_policy().backoff.initial(),
            Duration::from_millis(100)
        );
    }

    #[tokio::test]
    async fn test_loader_validates() {
        let result = ConfigLoader::new()
            .memory(MemoryConfigSource::new().value("circuit.failure_threshold", 0))
            .load()
            .await;
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_loader_debug_lists_sources() {
        let loader = ConfigLoader::new()
            .memory(MemoryConfigSource::named("defaults"))
            .env();
        assert_eq!(loader.source_names(), vec!["defaults", "env"]);
        assert!(format!("{loader:?}").contains("defaults"));
    }
}
