use anyhow::Context;
use clap::Parser;
use configurator_core::{
    ConfigStore, FileStore, KvStore, KvStoreSettings, MemoryKv, PipelineSettings, StoreError,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_SETTINGS_NAME: &str = "configurator.json";

/// Keep a rendered configuration file in sync with a shared JSON document
#[derive(Parser, Debug)]
#[command(name = "configurator")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Where the document lives: file:///path/to/config.json or memory://prefix
    pub store: StoreUri,

    /// Command that reads the document on stdin and prints the artifact
    pub transform: String,

    /// File the artifact is written to
    pub target: PathBuf,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Config check command, run with FILE set to the candidate artifact
    #[arg(short = 'c', long = "check")]
    pub check: Option<String>,

    /// Reload command, run after the artifact is written
    #[arg(short, long)]
    pub reload: Option<String>,

    /// Settings file, defaults to ./configurator.json if present
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Pipeline settings from the arguments, with the rest from `settings`
    pub fn pipeline_settings(&self, settings: &ServerSettings) -> PipelineSettings {
        let mut pipeline = PipelineSettings::new(&self.target, self.transform.as_str());
        pipeline.validate = self.check.clone();
        pipeline.reload = self.reload.clone();
        pipeline.command_timeout_secs = settings.command_timeout_secs;
        pipeline.shell = settings.shell.clone();
        pipeline
    }

    pub fn port(&self, settings: &ServerSettings) -> u16 {
        self.port.unwrap_or(settings.port)
    }
}

/// Settings file format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub command_timeout_secs: u64,
    /// Shell for command lines, `$SHELL` if unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    pub store: KvStoreSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8881,
            command_timeout_secs: configurator_core::DEFAULT_COMMAND_TIMEOUT_SECS,
            shell: None,
            store: KvStoreSettings::default(),
        }
    }
}

impl ServerSettings {
    /// Load `path`, or `./configurator.json` if it exists, or the defaults
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let fallback = PathBuf::from(DEFAULT_SETTINGS_NAME);
                if !fallback.exists() {
                    return Ok(Self::default());
                }
                fallback
            }
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        let settings = serde_json::from_str(&content)
            .with_context(|| format!("parsing settings in {}", path.display()))?;
        Ok(settings)
    }

    pub fn address(&self, port: u16) -> String {
        format!("{}:{}", self.host, port)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreUriError {
    #[error("Unsupported store scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Store URI has no path: {0}")]
    MissingPath(String),

    #[error("Not a store URI: {0}")]
    Malformed(String),
}

/// Which backend to keep the document in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUri {
    /// A JSON file, edited in place
    File(PathBuf),
    /// An in-process key/value store, document under `<prefix>/config`
    Memory(String),
}

impl FromStr for StoreUri {
    type Err = StoreUriError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| StoreUriError::Malformed(uri.to_string()))?;

        match scheme {
            "file" => {
                if rest.is_empty() {
                    return Err(StoreUriError::MissingPath(uri.to_string()));
                }
                Ok(StoreUri::File(PathBuf::from(rest)))
            }
            "memory" => {
                let prefix = rest.trim_matches('/');
                if prefix.is_empty() {
                    Ok(StoreUri::Memory(String::new()))
                } else {
                    Ok(StoreUri::Memory(format!("/{}", prefix)))
                }
            }
            other => Err(StoreUriError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// Open the store `uri` points at
///
/// A memory URI's prefix overrides the prefix in `kv` when it has one.
pub fn open_store(uri: &StoreUri, kv: &KvStoreSettings) -> Result<Arc<dyn ConfigStore>, StoreError> {
    match uri {
        StoreUri::File(path) => Ok(Arc::new(FileStore::open(path)?)),
        StoreUri::Memory(prefix) => {
            let mut settings = kv.clone();
            if !prefix.is_empty() {
                settings.prefix = prefix.clone();
            }
            Ok(Arc::new(KvStore::new(Arc::new(MemoryKv::new()), settings)))
        }
    }
}
