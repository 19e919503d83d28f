// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Client configuration.
//!
//! [`ClientConfig`] is plain data: it deserializes from JSON with every
//! field optional, and the command-line driver overrides individual fields
//! from its flags.

use super::*;
use crate::lwm2m::Lwm2mVersion;
use crate::observe::NotificationDefaults;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors from loading a [`ClientConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid JSON for a configuration.
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// A field has a value the client cannot run with.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Static values exposed by the Device object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    /// Manufacturer, `/3/0/0`.
    pub manufacturer: String,
    /// Model number, `/3/0/1`.
    pub model_number: String,
    /// Serial number, `/3/0/2`.
    pub serial_number: String,
    /// Firmware version, `/3/0/3`.
    pub firmware_version: String,
    /// Power source voltages in millivolts, `/3/0/7`.
    pub power_source_voltage: Vec<i64>,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        DeviceInfo {
            manufacturer: "0023C7".into(),
            model_number: "lwm2m-client".into(),
            serial_number: "000001".into(),
            firmware_version: env!("CARGO_PKG_VERSION").into(),
            power_source_voltage: vec![3800],
        }
    }
}

/// One Advanced Firmware Update partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Component name.
    pub name: String,
    /// Eight-character package magic.
    pub magic: String,
    /// Version of the running image.
    #[serde(default)]
    pub current_version: String,
}

/// Everything the client needs to know before it starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Endpoint client name sent with Register.
    pub endpoint_name: String,
    /// Registration lifetime in seconds.
    pub lifetime: u32,
    /// Binding mode; derived from the server URI when absent.
    pub binding: Option<String>,
    /// LwM2M 1.1 queue mode.
    pub queue_mode: bool,
    /// Protocol version.
    pub version: Lwm2mVersion,

    /// `ACK_TIMEOUT` in milliseconds.
    pub ack_timeout_ms: u64,
    /// `ACK_RANDOM_FACTOR`.
    pub ack_random_factor: f32,
    /// `MAX_RETRANSMIT`.
    pub max_retransmit: u32,
    /// `NSTART`.
    pub nstart: usize,
    /// Preferred block size for block-wise transfers, 16 to 1024.
    pub block_size: usize,
    /// Payload bytes of BLOCK1 responses kept for answering duplicates.
    pub block1_cache_budget: usize,

    /// Notifications kept while offline; the oldest are dropped beyond this.
    pub stored_notification_limit: usize,
    /// Whether notifications are stored at all while offline.
    pub notification_storing: bool,
    /// Default minimum notification period, in seconds.
    pub default_pmin: u32,
    /// Default maximum notification period, in seconds.
    pub default_pmax: Option<u32>,

    /// Directory for persisted state and downloaded packages. State is kept
    /// in memory when absent.
    pub persistence_dir: Option<PathBuf>,
    /// Firmware package file; defaults to `firmware.pkg` in the
    /// persistence directory.
    pub fw_package_path: Option<PathBuf>,
    /// Report update results with a LwM2M Send.
    pub send_on_update: bool,
    /// Repeating the current activation state fails with 4.05.
    pub sw_disable_repeated_activation: bool,
    /// Advanced Firmware Update partitions. The usual four when empty.
    pub afu_partitions: Vec<PartitionConfig>,
    /// Seconds to wait before trying to register again.
    pub register_retry_secs: u64,

    /// Device object values.
    pub device: DeviceInfo,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let params = TransParams::default();
        ClientConfig {
            endpoint_name: "urn:dev:os:0023C7-000001".into(),
            lifetime: 86400,
            binding: None,
            queue_mode: false,
            version: Lwm2mVersion::default(),
            ack_timeout_ms: params.ack_timeout.as_millis() as u64,
            ack_random_factor: params.ack_random_factor,
            max_retransmit: params.max_retransmit,
            nstart: params.nstart,
            block_size: BlockInfo::MAX_SIZE,
            block1_cache_budget: 4096,
            stored_notification_limit: 0,
            notification_storing: true,
            default_pmin: 0,
            default_pmax: None,
            persistence_dir: None,
            fw_package_path: None,
            send_on_update: false,
            sw_disable_repeated_activation: false,
            afu_partitions: Vec::new(),
            register_retry_secs: 5,
            device: DeviceInfo::default(),
        }
    }
}

impl ClientConfig {
    /// Reads a JSON configuration file. Absent fields take their defaults.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<ClientConfig, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parses a JSON configuration.
    pub fn from_json_str(text: &str) -> Result<ClientConfig, ConfigError> {
        let config: ClientConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would otherwise fail later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint_name.is_empty() {
            return Err(ConfigError::Invalid("endpoint name is empty"));
        }
        if self.lifetime == 0 {
            return Err(ConfigError::Invalid("lifetime must be positive"));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid("ack timeout must be positive"));
        }
        if self.max_retransmit > MAX_RETRANSMIT_LIMIT {
            return Err(ConfigError::Invalid("max retransmit is too large"));
        }
        if !(1.0..=MAX_ACK_RANDOM_FACTOR).contains(&self.ack_random_factor) {
            return Err(ConfigError::Invalid(
                "ack random factor must be between 1 and 10",
            ));
        }
        if self.nstart == 0 {
            return Err(ConfigError::Invalid("nstart must be positive"));
        }
        if BlockInfo::szx_for_size(self.block_size).is_none() {
            return Err(ConfigError::Invalid(
                "block size must be a power of two from 16 to 1024",
            ));
        }
        if self.afu_partitions.iter().any(|p| p.magic.len() != 8) {
            return Err(ConfigError::Invalid("partition magic must be 8 bytes"));
        }
        Ok(())
    }

    /// CoAP transmission parameters.
    pub fn trans_params(&self) -> TransParams {
        TransParams {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            ack_random_factor: self.ack_random_factor,
            max_retransmit: self.max_retransmit,
            nstart: self.nstart,
            ..TransParams::default()
        }
    }

    /// Block size exponent for uploads and downloads.
    pub fn block_szx(&self) -> u8 {
        BlockInfo::szx_for_size(self.block_size).unwrap_or(BlockInfo::SZX_MAX)
    }

    /// Server-level notification defaults.
    pub fn notification_defaults(&self) -> NotificationDefaults {
        NotificationDefaults {
            pmin: self.default_pmin,
            pmax: self.default_pmax,
            storing: self.notification_storing,
        }
    }

    /// Partition names and magics, falling back to the usual four.
    pub fn partitions(&self) -> Vec<(String, [u8; 8], String)> {
        if self.afu_partitions.is_empty() {
            return crate::update::DEFAULT_PARTITIONS
                .iter()
                .map(|(name, magic)| (name.to_string(), *magic, String::new()))
                .collect();
        }
        self.afu_partitions
            .iter()
            .filter_map(|p| {
                let magic: [u8; 8] = p.magic.as_bytes().try_into().ok()?;
                Some((p.name.clone(), magic, p.current_version.clone()))
            })
            .collect()
    }

    /// Where the firmware package is stored, if on disk.
    pub fn fw_package_file(&self) -> Option<PathBuf> {
        self.fw_package_path.clone().or_else(|| {
            self.persistence_dir
                .as_ref()
                .map(|dir| dir.join("firmware.pkg"))
        })
    }
}
