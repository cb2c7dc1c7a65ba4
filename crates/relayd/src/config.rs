use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_kernel::ToolSpec;
use relay_provider::ChatCompletionsConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::graph::{EngineOptions, DEFAULT_MAX_STEPS};
use crate::transport::DEFAULT_HEARTBEAT;

pub const DEFAULT_ADDR: &str = "127.0.0.1:8100";
const DEFAULT_TOOL_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(rename = "$schema")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Tools the caller executes; a reasoning step that requests one suspends the run.
    #[serde(default)]
    pub client_tools: Vec<ToolSpec>,

    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServerConfig>,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<ApiKeySource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    Memory,
    Sqlite {
        /// Defaults to `<data_dir>/checkpoints.db`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
        /// Accept payloads that older writers stored as JSON strings.
        #[serde(default)]
        legacy_fragments: bool,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: None,
            legacy_fragments: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub url: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<ApiKeySource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_concurrency: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_ns: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ApiKeySource {
    Inline(String),
    Env { env: String },
}

impl ApiKeySource {
    pub fn resolve(&self) -> Option<String> {
        match self {
            Self::Inline(value) => (!value.trim().is_empty()).then(|| value.clone()),
            Self::Env { env } => env_var(env).filter(|v| !v.trim().is_empty()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(#[from] serde_json::Error),
}

impl RelayConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("data"))
    }

    pub fn addr(&self) -> String {
        self.server
            .addr
            .clone()
            .unwrap_or_else(|| DEFAULT_ADDR.to_string())
    }

    pub fn heartbeat(&self) -> Duration {
        self.server
            .heartbeat_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_HEARTBEAT)
    }

    pub fn tool_concurrency(&self) -> usize {
        self.engine
            .tool_concurrency
            .unwrap_or(DEFAULT_TOOL_CONCURRENCY)
    }

    pub fn sqlite_path(&self) -> Option<PathBuf> {
        match &self.store {
            StoreConfig::Memory => None,
            StoreConfig::Sqlite { path, .. } => Some(
                path.clone()
                    .unwrap_or_else(|| self.data_dir().join("checkpoints.db")),
            ),
        }
    }

    /// `None` when no reasoning endpoint is configured.
    pub fn provider_config(&self) -> Option<ChatCompletionsConfig> {
        let endpoint = self
            .provider
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())?
            .to_string();
        let api_key = self
            .provider
            .api_key
            .as_ref()
            .and_then(ApiKeySource::resolve)
            .or_else(|| api_key_for_endpoint(&endpoint));
        let mut config = ChatCompletionsConfig::new(endpoint)
            .with_api_key(api_key)
            .with_model(self.provider.model.clone());
        config.temperature = self.provider.temperature;
        Some(config)
    }

    pub fn engine_options(&self) -> EngineOptions {
        let defaults = EngineOptions::default();
        EngineOptions {
            system_prompt: self.system_prompt.clone(),
            client_tools: self.client_tools.clone(),
            max_steps: self.engine.max_steps.unwrap_or(DEFAULT_MAX_STEPS),
            tool_timeout_ms: self.engine.tool_timeout_ms,
            checkpoint_ns: self.engine.checkpoint_ns.clone().unwrap_or_default(),
            writer: defaults.writer,
        }
    }

    /// Environment values win over file values.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(endpoint) = get("RELAY_ENDPOINT") {
            self.provider.endpoint = Some(endpoint);
        }
        if let Some(model) = get("RELAY_MODEL") {
            self.provider.model = Some(model);
        }
        if let Some(key) = get("RELAY_API_KEY") {
            self.provider.api_key = Some(ApiKeySource::Inline(key));
        }
        if let Some(dir) = get("RELAY_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(addr) = get("RELAY_ADDR") {
            self.server.addr = Some(addr);
        }
        if let Some(raw) = get("RELAY_HEARTBEAT_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => self.server.heartbeat_ms = Some(ms),
                Err(err) => warn!("invalid RELAY_HEARTBEAT_MS={raw:?}: {err}; keeping default"),
            }
        }
        if let Some(raw) = get("RELAY_MAX_STEPS") {
            match raw.parse::<u32>() {
                Ok(steps) => self.engine.max_steps = Some(steps),
                Err(err) => warn!("invalid RELAY_MAX_STEPS={raw:?}: {err}; keeping default"),
            }
        }
    }
}

/// Reads the explicit file (or `RELAY_CONFIG`), otherwise `relay.json` and
/// `relay.jsonc` in `cwd`, layered in that order, then applies env overrides.
pub fn load_config(explicit: Option<&Path>, cwd: &Path) -> Result<RelayConfig, ConfigError> {
    let required = explicit
        .map(Path::to_path_buf)
        .or_else(|| env_var("RELAY_CONFIG").filter(|v| !v.trim().is_empty()).map(PathBuf::from));

    let sources: Vec<(PathBuf, bool)> = match required {
        Some(path) => vec![(path, true)],
        None => ["relay.json", "relay.jsonc"]
            .into_iter()
            .map(|name| (cwd.join(name), false))
            .collect(),
    };

    let mut merged = Value::Object(serde_json::Map::new());
    for (path, required) in sources {
        if !required && !path.exists() {
            continue;
        }
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let value = parse_jsonc(&contents).map_err(|message| ConfigError::Parse {
            path: path.clone(),
            message,
        })?;
        merge_json_value(&mut merged, value);
    }

    let mut config: RelayConfig = serde_json::from_value(merged)?;
    config.apply_overrides(env_var);
    Ok(config)
}

fn api_key_for_endpoint(endpoint: &str) -> Option<String> {
    if let Some(key) = env_var("RELAY_API_KEY").filter(|v| !v.trim().is_empty()) {
        return Some(key);
    }
    if endpoint.contains("openai.com") {
        return env_var("OPENAI_API_KEY").filter(|v| !v.trim().is_empty());
    }
    if endpoint.contains("openrouter.ai") {
        return env_var("OPENROUTER_API_KEY").filter(|v| !v.trim().is_empty());
    }
    None
}

fn env_var(key: &str) -> Option<String> {
    #[cfg(test)]
    {
        let _ = key;
        None
    }

    #[cfg(not(test))]
    {
        std::env::var(key).ok()
    }
}

fn parse_jsonc(raw: &str) -> Result<Value, String> {
    serde_json::from_str(&normalize_jsonc(raw)).map_err(|err| err.to_string())
}

/// Drops comments and trailing commas that sit outside string literals.
fn normalize_jsonc(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    let mut in_string = false;

    while let Some(ch) = chars.next() {
        if in_string {
            out.push(ch);
            match ch {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        let next = chars.peek().copied();
        match (ch, next) {
            ('"', _) => {
                in_string = true;
                out.push(ch);
            }
            ('/', Some('/')) => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                let _ = chars.next();
                let mut previous = '\0';
                for skipped in chars.by_ref() {
                    if previous == '*' && skipped == '/' {
                        break;
                    }
                    previous = skipped;
                }
            }
            (']' | '}', _) => {
                let kept = out.trim_end().len();
                if out[..kept].ends_with(',') {
                    out.truncate(kept - 1);
                }
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

fn merge_json_value(target: &mut Value, overlay: Value) {
    match (target, overlay) {
        (Value::Object(target), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match target.get_mut(&key) {
                    Some(existing) => merge_json_value(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
