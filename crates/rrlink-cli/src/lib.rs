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

//! # rrlink CLI
//!
//! Command-line front end for talking to devices and the cloud REST API.
//!
//! ## Architecture
//!
//! The CLI uses the `argh` crate for argument parsing and dispatches to
//! `rrlink-client`. Everything that needs an account reads a login file
//! (see [`login`]) produced from the output of `rrlink login`.
//!
//! ## Key Commands
//!
//! - `rrlink local`: Send one command over the local socket
//! - `rrlink command`: Send one command through the cloud broker
//! - `rrlink listen`: Print everything a device publishes on the broker
//! - `rrlink home`, `rooms`, `scenes`, `execute-scene`, `products`: REST calls
//! - `rrlink request-code`, `login`: Obtain account credentials
//! - `rrlink sign`: Print the `Authorization` header for a path

pub mod login;

use anyhow::{anyhow, Result};
use rrlink_common::auth::Params;

/// Parses a JSON string of command parameters.
///
/// An empty string means no parameters.
pub fn parse_params(raw: &str) -> Result<serde_json::Value> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Array(Vec::new()));
    }
    serde_json::from_str(raw).map_err(|e| anyhow!("Invalid JSON in params: {}", e))
}

/// Parses repeated `key=value` arguments.
pub fn parse_pairs(pairs: &[String]) -> Result<Option<Params>> {
    if pairs.is_empty() {
        return Ok(None);
    }
    let mut params = Params::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected key=value, got '{}'", pair))?;
        params.insert(key.to_string(), value.to_string());
    }
    Ok(Some(params))
}
