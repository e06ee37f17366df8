// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::transport::uri::DeviceUri;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Where the stub lives.
    pub device: DeviceConfig,
    /// Host-side runtime knobs that never travel over the wire.
    pub runtime: RuntimeConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DeviceConfig {
    #[serde(rename = "Uri")]
    /// Device URI, `scheme://details`; see the transport factory for the
    /// supported schemes.
    pub uri: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    #[serde(rename = "TimeoutConnect", with = "serde_millis")]
    /// Budget for the beacon wait plus the connect round trip.
    pub timeout_connect: Duration,

    #[serde(rename = "TimeoutRequest", with = "serde_millis")]
    /// Default per-request budget; chunked operations re-arm it per chunk.
    pub timeout_request: Duration,

    #[serde(default, rename = "CcdDefault")]
    /// CCD requests go to unless the caller picks one explicitly.
    pub default_ccd: u32,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.device
            .uri
            .parse::<DeviceUri>()
            .with_context(|| format!("bad device URI {:?}", self.device.uri))?;
        ensure!(
            !self.runtime.timeout_connect.is_zero(),
            "TimeoutConnect must be non-zero"
        );
        ensure!(
            !self.runtime.timeout_request.is_zero(),
            "TimeoutRequest must be non-zero"
        );
        Ok(())
    }
}

/// Turns a relative config path into an absolute, canonical one.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };
    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}

/// Serde helpers representing `Duration` as integral milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
