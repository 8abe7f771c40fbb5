//! Configuration loading and parsing

use anyhow::{Context, Result};
use can_telemetry::{ChannelTags, ExportConfig, Framing, IngestConfig};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Extra port schema files, loaded after the built-in table
    #[serde(default)]
    pub schema_files: Vec<PathBuf>,
    /// Start from the built-in vehicle control unit messages
    #[serde(default = "default_true")]
    pub builtin_schemas: bool,
    #[serde(default)]
    pub input: InputConfig,
    /// Tags applied to every channel of the ingested sessions
    #[serde(default)]
    pub session: ChannelTags,
    #[serde(default = "default_transport", deserialize_with = "deserialize_transport")]
    pub transport: IngestConfig,
    #[serde(default)]
    pub export: ExportSection,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InputConfig {
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Session identifier for every input; defaults to each file's stem
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExportSection {
    #[serde(flatten)]
    pub batching: ExportConfig,
    /// Directory receiving line-protocol batch files; no export when unset
    pub output_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

/// Capture files are byte streams
fn default_transport() -> IngestConfig {
    IngestConfig::new().with_framing(Framing::Stream)
}

/// `[transport]` as written in the file; absent keys keep the CLI defaults
#[derive(Debug, Default, Deserialize)]
struct TransportSection {
    extent_bytes: Option<usize>,
    transfer_id_timeout_us: Option<u64>,
    framing: Option<Framing>,
    read_chunk_bytes: Option<usize>,
}

impl TransportSection {
    fn resolve(self) -> IngestConfig {
        let defaults = default_transport();
        IngestConfig {
            extent_bytes: self.extent_bytes.unwrap_or(defaults.extent_bytes),
            transfer_id_timeout_us: self
                .transfer_id_timeout_us
                .unwrap_or(defaults.transfer_id_timeout_us),
            framing: self.framing.unwrap_or(defaults.framing),
            read_chunk_bytes: self.read_chunk_bytes.unwrap_or(defaults.read_chunk_bytes),
        }
    }
}

fn deserialize_transport<'de, D>(deserializer: D) -> std::result::Result<IngestConfig, D::Error>
where
    D: Deserializer<'de>,
{
    TransportSection::deserialize(deserializer).map(TransportSection::resolve)
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_files: Vec::new(),
            builtin_schemas: true,
            input: InputConfig::default(),
            session: ChannelTags::default(),
            transport: default_transport(),
            export: ExportSection::default(),
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    config
        .transport
        .validate()
        .with_context(|| format!("Invalid [transport] section in {:?}", path))?;
    config
        .export
        .batching
        .validate()
        .with_context(|| format!("Invalid [export] section in {:?}", path))?;

    Ok(config)
}
