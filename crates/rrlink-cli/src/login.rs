// Copyright 2025 rrlink Authors
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

//! Login File
//!
//! Commands that need an account read a JSON file holding the login result
//! and the per-device keys:
//!
//! ```json
//! {
//!   "email": "user@example.com",
//!   "user_data": { "token": "...", "rriot": { "u": "...", "s": "...", "h": "...", "k": "...", "r": { "a": "https://..." } } },
//!   "broker": { "url": "ssl://mqtt.example.com:8883", "username": "...", "password": "..." },
//!   "devices": [ { "duid": "...", "local_key": "...", "ip": "192.168.1.20" } ]
//! }
//! ```
//!
//! `rrlink login` prints a file of this shape; the CLI never writes it.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use rrlink_client::transport::BrokerParams;
use rrlink_client::UserData;
use rrlink_common::auth::SigningCredential;
use serde::{Deserialize, Serialize};

/// Environment variable naming the login file.
pub const LOGIN_FILE_ENV: &str = "RRLINK_LOGIN_FILE";

/// Login file used when neither the flag nor the environment names one.
pub const DEFAULT_LOGIN_FILE: &str = "rrlink-login.json";

/// Broker account details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerLogin {
    pub url: String,
    pub username: String,
    pub password: String,
}

/// One known device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub duid: String,
    pub local_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginData {
    pub email: String,
    pub user_data: UserData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<BrokerLogin>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

impl LoginData {
    /// Login data with no broker and no devices yet.
    pub fn new(email: impl Into<String>, user_data: UserData) -> Self {
        Self {
            email: email.into(),
            user_data,
            broker: None,
            devices: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read login file {}: {}", path.display(), e))?;
        serde_json::from_str(&contents)
            .map_err(|e| anyhow!("Invalid login file {}: {}", path.display(), e))
    }

    pub fn credential(&self) -> SigningCredential {
        self.user_data.credential()
    }

    pub fn device(&self, duid: &str) -> Result<&DeviceEntry> {
        self.devices
            .iter()
            .find(|d| d.duid == duid)
            .ok_or_else(|| anyhow!("Device '{}' is not listed in the login file", duid))
    }

    pub fn broker_params(&self) -> Result<BrokerParams> {
        let broker = self
            .broker
            .as_ref()
            .ok_or_else(|| anyhow!("The login file has no broker section"))?;
        Ok(BrokerParams::from_url(
            &broker.url,
            broker.username.clone(),
            broker.password.clone(),
            self.user_data.rriot.u.clone(),
        )?)
    }
}

/// Picks the login file path.
///
/// Priority: CLI flag > `RRLINK_LOGIN_FILE` > [`DEFAULT_LOGIN_FILE`].
pub fn resolve_path(flag: Option<&str>) -> PathBuf {
    flag.map(PathBuf::from)
        .or_else(|| std::env::var(LOGIN_FILE_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOGIN_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_wins() {
        assert_eq!(resolve_path(Some("/tmp/a.json")), PathBuf::from("/tmp/a.json"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = LoginData::load(Path::new("/nonexistent/rrlink-login.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read login file"));
    }
}
