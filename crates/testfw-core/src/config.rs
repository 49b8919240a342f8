//! Settings file listing the servers a script is run against.
//!
//! ```yaml
//! servers:
//!   ergo:
//!     name: Ergo
//!     address: localhost:6667
//!   inspircd:
//!     address: localhost:6697
//!     tls: true
//!     tls-skip-verify: true
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{FrameworkError, FrameworkResult};

/// Connection details for one server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Display name; defaults to the server's ID
    #[serde(rename = "name", default)]
    pub display_name: String,
    pub address: String,
    #[serde(rename = "tls", default)]
    pub use_tls: bool,
    #[serde(default)]
    pub tls_skip_verify: bool,
}

impl ServerConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            display_name: String::new(),
            address: address.into(),
            use_tls: false,
            tls_skip_verify: false,
        }
    }
}

/// Parsed settings. Servers are keyed, and so iterated, by ID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl Config {
    /// Parse settings from YAML text.
    pub fn load(data: &str) -> FrameworkResult<Self> {
        let mut config: Config = serde_yaml::from_str(data)
            .map_err(|e| FrameworkError::Config(format!("Failed to parse YAML: {}", e)))?;

        for (id, info) in config.servers.iter_mut() {
            if id.is_empty() {
                return Err(FrameworkError::Config("Server IDs cannot be empty".into()));
            }
            if info.display_name.is_empty() {
                info.display_name = id.clone();
            }
        }

        Ok(config)
    }

    /// Read and parse a settings file.
    pub fn load_from_file(path: impl AsRef<Path>) -> FrameworkResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            FrameworkError::Config(format!("Could not read {}: {}", path.display(), e))
        })?;
        Self::load(&data)
    }
}
