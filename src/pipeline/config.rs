//! Graph description loaded from TOML or JSON
//!
//! ```toml
//! [pipeline]
//! name = "demo"
//!
//! connections = [["pattern.output", "console.input"]]
//!
//! [[blocks]]
//! name = "pattern"
//! type = "TestPatternSource"
//! parameters = { width = 320, height = 240, fps = 15 }
//!
//! [[blocks]]
//! name = "console"
//! type = "ConsoleSink"
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::block::BlockParams;
use crate::error::{PipelineError, Result};

pub const DEFAULT_OUTPUT: &str = "output";
pub const DEFAULT_INPUT: &str = "input";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInfo {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_platform")]
    pub platform: String,
}

impl Default for PipelineInfo {
    fn default() -> Self {
        Self {
            name: default_name(),
            platform: default_platform(),
        }
    }
}

fn default_name() -> String {
    "unnamed".to_string()
}

fn default_platform() -> String {
    "generic".to_string()
}

/// One block instance. Parameter keys are passed to the block as written;
/// the built-in blocks all use lowercase keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDef {
    pub name: String,
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default, alias = "params")]
    pub parameters: BlockParams,
}

impl BlockDef {
    pub fn new(name: impl Into<String>, block_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            block_type: block_type.into(),
            parameters: BlockParams::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.parameters.insert(key.into(), value.to_string());
        self
    }
}

/// Directed edge `source.output -> sink.input`.
///
/// Deserializes from either a table or a `["a.output", "b.input"]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ConnectionRepr")]
pub struct Connection {
    pub source: String,
    pub source_output: String,
    pub sink: String,
    pub sink_input: String,
}

impl Connection {
    pub fn new(source: impl Into<String>, sink: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_output: DEFAULT_OUTPUT.to_string(),
            sink: sink.into(),
            sink_input: DEFAULT_INPUT.to_string(),
        }
    }

    /// Parse `"a.output"`-style endpoints; a missing label takes the default.
    pub fn parse(source: &str, sink: &str) -> Self {
        let (source, source_output) = split_endpoint(source, DEFAULT_OUTPUT);
        let (sink, sink_input) = split_endpoint(sink, DEFAULT_INPUT);
        Self {
            source,
            source_output,
            sink,
            sink_input,
        }
    }
}

fn split_endpoint(endpoint: &str, default_label: &str) -> (String, String) {
    match endpoint.split_once('.') {
        Some((block, label)) if !label.is_empty() => (block.to_string(), label.to_string()),
        Some((block, _)) => (block.to_string(), default_label.to_string()),
        None => (endpoint.to_string(), default_label.to_string()),
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.source, self.source_output, self.sink, self.sink_input
        )
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConnectionRepr {
    Pair(String, String),
    Table {
        source: String,
        #[serde(default = "default_output")]
        source_output: String,
        sink: String,
        #[serde(default = "default_input")]
        sink_input: String,
    },
}

fn default_output() -> String {
    DEFAULT_OUTPUT.to_string()
}

fn default_input() -> String {
    DEFAULT_INPUT.to_string()
}

impl From<ConnectionRepr> for Connection {
    fn from(repr: ConnectionRepr) -> Self {
        match repr {
            ConnectionRepr::Pair(source, sink) => Connection::parse(&source, &sink),
            ConnectionRepr::Table {
                source,
                source_output,
                sink,
                sink_input,
            } => Connection {
                source,
                source_output,
                sink,
                sink_input,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Json,
}

impl ConfigFormat {
    /// `.json` files are JSON, everything else TOML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Toml,
        }
    }

    fn file_format(self) -> FileFormat {
        match self {
            ConfigFormat::Toml => FileFormat::Toml,
            ConfigFormat::Json => FileFormat::Json,
        }
    }
}

impl std::str::FromStr for ConfigFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            other => Err(PipelineError::config(format!(
                "unsupported configuration format '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default)]
    pub pipeline: PipelineInfo,
    #[serde(default)]
    pub blocks: Vec<BlockDef>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Free-form `[settings]` table. Keys are case-insensitive and stored
    /// lowercase; read them through [`GraphConfig::setting`].
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl GraphConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            pipeline: PipelineInfo {
                name: name.into(),
                ..PipelineInfo::default()
            },
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.pipeline.name
    }

    pub fn platform(&self) -> &str {
        &self.pipeline.platform
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn with_setting(mut self, key: &str, value: impl ToString) -> Self {
        self.settings
            .insert(key.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn block(mut self, def: BlockDef) -> Self {
        self.blocks.push(def);
        self
    }

    pub fn connect(mut self, source: &str, sink: &str) -> Self {
        self.connections.push(Connection::parse(source, sink));
        self
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path);
        Self::load(File::from(path).format(format.file_format()).required(true))
            .map_err(|e| PipelineError::config(format!("{}: {e}", path.display())))
    }

    pub fn from_str(content: &str, format: ConfigFormat) -> Result<Self> {
        Self::load(File::from_str(content, format.file_format()))
            .map_err(|e| PipelineError::config(e.to_string()))
    }

    fn load<S>(source: S) -> std::result::Result<Self, config::ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize::<Self>()
            .map(Self::normalize_settings)
    }

    fn normalize_settings(mut self) -> Self {
        self.settings = std::mem::take(&mut self.settings)
            .into_iter()
            .map(|(key, value)| (key.to_ascii_lowercase(), value))
            .collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_with_pairs_and_defaults() {
        let toml = r#"
            connections = [["cam.output", "view"]]

            [pipeline]
            name = "demo"

            [[blocks]]
            name = "cam"
            type = "TestPatternSource"
            parameters = { width = 320, fps = 12.5, pattern = "bars", use_pool = true }

            [[blocks]]
            name = "view"
            type = "NullSink"
        "#;
        let config = GraphConfig::from_str(toml, ConfigFormat::Toml).unwrap();
        assert_eq!(config.name(), "demo");
        assert_eq!(config.platform(), "generic");
        assert_eq!(config.blocks.len(), 2);
        assert_eq!(config.blocks[0].block_type, "TestPatternSource");
        assert_eq!(config.blocks[0].parameters["width"], "320");
        assert_eq!(config.blocks[0].parameters["fps"], "12.5");
        assert_eq!(config.blocks[0].parameters["use_pool"], "true");
        assert!(config.blocks[1].parameters.is_empty());
        assert_eq!(config.connections, vec![Connection::new("cam", "view")]);
    }

    #[test]
    fn json_with_tables() {
        let json = r#"{
            "blocks": [
                {"name": "src", "type": "A", "params": {"width": "64"}},
                {"name": "dst", "type": "B"}
            ],
            "connections": [
                {"source": "src", "sink": "dst", "sink_input": "left"}
            ],
            "settings": {"log": "debug"}
        }"#;
        let config = GraphConfig::from_str(json, ConfigFormat::Json).unwrap();
        assert_eq!(config.name(), "unnamed");
        assert_eq!(config.blocks[0].parameters["width"], "64");
        assert_eq!(config.connections[0].to_string(), "src.output -> dst.left");
        assert_eq!(config.settings["log"], "debug");
    }

    #[test]
    fn setting_keys_ignore_case() {
        let toml = r#"
            [settings]
            LogLevel = "debug"
            stats_interval = "5"
        "#;
        let config = GraphConfig::from_str(toml, ConfigFormat::Toml).unwrap();
        assert_eq!(config.setting("LogLevel"), Some("debug"));
        assert_eq!(config.setting("loglevel"), Some("debug"));
        assert_eq!(config.setting("STATS_INTERVAL"), Some("5"));
        assert!(config.settings.contains_key("loglevel"));

        let json = r#"{"settings": {"LogLevel": "trace"}}"#;
        let config = GraphConfig::from_str(json, ConfigFormat::Json).unwrap();
        assert_eq!(config.setting("logLevel"), Some("trace"));

        let built = GraphConfig::new("built").with_setting("Mode", "fast");
        assert_eq!(built.setting("mode"), Some("fast"));
    }

    #[test]
    fn malformed_content_is_a_config_error() {
        let err = GraphConfig::from_str("[[blocks]]\nname = ", ConfigFormat::Toml).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        let err = GraphConfig::from_str(r#"{"blocks": [{"name": "x"}]}"#, ConfigFormat::Json)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn endpoints_and_builder() {
        let config = GraphConfig::new("built")
            .block(BlockDef::new("a", "A").param("fps", 5))
            .block(BlockDef::new("b", "B"))
            .connect("a.", "b.in0");
        assert_eq!(config.connections[0].to_string(), "a.output -> b.in0");
        assert_eq!(config.blocks[0].parameters["fps"], "5");
        assert_eq!("JSON".parse::<ConfigFormat>().unwrap(), ConfigFormat::Json);
        assert!("yaml".parse::<ConfigFormat>().is_err());
        assert_eq!(
            ConfigFormat::from_path(Path::new("graph.JSON")),
            ConfigFormat::Json
        );
        assert_eq!(ConfigFormat::from_path(Path::new("graph.conf")), ConfigFormat::Toml);
    }
}
