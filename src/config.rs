//! Launch configuration.
//!
//! Read from a JSON file or taken straight from the `launch` arguments an IDE
//! sends. Every key is optional.

use crate::debugger::DEFAULT_INTERRUPT_VECTORS;
use crate::error::{DebugError, Result};
use crate::parser::LabelTable;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Offline trace file to replay.
    pub trace: Option<PathBuf>,
    pub remote: Option<RemoteConfig>,
    pub history: HistoryConfig,
    /// Addresses an interrupt can land on. Empty accepts any address.
    pub interrupt_vectors: Vec<u16>,
    pub labels: BTreeMap<String, u16>,
    /// Highest stack address; limits how far the real call stack is read.
    pub top_of_stack: Option<u16>,
    pub stop_on_entry: bool,
    pub log: LogConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            trace: None,
            remote: None,
            history: HistoryConfig::default(),
            interrupt_vectors: DEFAULT_INTERRUPT_VECTORS.to_vec(),
            labels: BTreeMap::new(),
            top_of_stack: None,
            stop_on_entry: true,
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 10000,
        }
    }
}

impl RemoteConfig {
    /// Parses `host:port`, or a bare host with the default port.
    pub fn parse(text: &str) -> Result<Self> {
        match text.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| DebugError::Config(format!("invalid port in '{}'", text)))?;
                Ok(Self {
                    host: host.to_string(),
                    port,
                })
            }
            None => Ok(Self {
                host: text.to_string(),
                ..Self::default()
            }),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryConfig {
    /// How many instructions can be stepped back. 0 means unlimited.
    pub reverse_debug_instruction_count: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            reverse_debug_instruction_count: 10000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    pub level: String,
    /// Appended to when set, stderr otherwise.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// What the session attaches to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSource {
    Trace(PathBuf),
    Remote(RemoteConfig),
}

impl SessionConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| DebugError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn from_launch_arguments(arguments: &Value) -> Result<Self> {
        Ok(serde_json::from_value(arguments.clone())?)
    }

    pub fn target_source(&self) -> Result<TargetSource> {
        match (&self.trace, &self.remote) {
            (Some(path), None) => Ok(TargetSource::Trace(path.clone())),
            (None, Some(remote)) => Ok(TargetSource::Remote(remote.clone())),
            (Some(_), Some(_)) => Err(DebugError::Config(
                "both 'trace' and 'remote' are set".to_string(),
            )),
            (None, None) => Err(DebugError::Config(
                "neither 'trace' nor 'remote' is set".to_string(),
            )),
        }
    }

    pub fn label_table(&self) -> LabelTable {
        LabelTable::from(&self.labels)
    }
}
