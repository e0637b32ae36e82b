// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Settings shared by the `target` and `query` commands.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use bypass::CallbackDelivery;
use serde::Deserialize;
use serde::Serialize;
use shim_transport::CommMode;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:7100";
pub const DEFAULT_XLINK_DIR: &str = "/tmp/vpl_bypass";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShimConfig {
    /// Transport of the main channel and of the allocator sub-channels.
    pub mode: CommMode,
    /// `host:port` the target listens on or the host connects to. Sub-channel `n` uses port
    /// `port + n`.
    pub address: String,
    /// Directory holding the datagram sockets in xlink mode.
    pub xlink_dir: PathBuf,
    pub delivery: CallbackDelivery,
    /// Host side: split waits longer than this many milliseconds into shorter sync calls.
    pub sync_chunk_ms: Option<u32>,
    pub log_level: String,
}

impl Default for ShimConfig {
    fn default() -> Self {
        ShimConfig {
            mode: CommMode::Tcp,
            address: DEFAULT_ADDRESS.to_string(),
            xlink_dir: PathBuf::from(DEFAULT_XLINK_DIR),
            delivery: CallbackDelivery::Inplace,
            sync_chunk_ms: None,
            log_level: "info".to_string(),
        }
    }
}

impl ShimConfig {
    /// Reads a JSON config file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<ShimConfig> {
        let file = File::open(path)
            .with_context(|| format!("failed to open config file {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Loads `path` if given, otherwise returns the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<ShimConfig> {
        match path {
            Some(path) => ShimConfig::load(path),
            None => Ok(ShimConfig::default()),
        }
    }
}
