// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "bluetooth-serial";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Discovery settings.
    pub discovery: DiscoveryConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Adapter to use, e.g. "hci0". Defaults to the system default adapter.
    pub adapter: Option<String>,

    /// Accept incoming connections while idle. When set, a failed or lost
    /// connection returns to listening instead of staying idle.
    pub accept_incoming: bool,

    /// RFCOMM channel dialled on the remote device.
    pub connect_channel: u8,

    /// Local channel for the authenticated listener.
    pub secure_channel: u8,

    /// Local channel for the unauthenticated listener.
    pub insecure_channel: u8,

    /// Maximum bytes taken from the socket per read.
    pub read_chunk_size: usize,

    /// Depth of the manager event queue.
    pub event_queue_depth: usize,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            accept_incoming: false,
            connect_channel: 1,
            secure_channel: 1,
            insecure_channel: 2,
            read_chunk_size: 1024,
            event_queue_depth: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Only report devices with this name (case-insensitive).
    pub name_filter: Option<String>,

    /// Scan length in seconds before discovery finishes on its own.
    pub duration_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            name_filter: None,
            duration_secs: 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing directive, overridden by RUST_LOG.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "bluetooth_serial=info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        std::fs::create_dir_all(&config_dir)?;

        Self::load_from(&config_dir.join("config.toml"))
    }

    /// Load configuration from `path`, writing defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
