// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-engine storage tier configuration.
//!
//! An engine's storage is described as an ordered list of tiers: a memory
//! tier at index 0 followed by zero or more bdev tiers. Validation checks
//! the tier layout, optionally assigns MD-on-SSD roles, and computes the
//! fields derived from the layout.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use bdev_types::{Fault, FaultCode};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

mod error;
mod props;
mod provider;
mod roles;
mod tier;

pub use error::ConfigError;
pub use props::{
    AccelEngine, AccelOptions, AccelProps, AutoFaultyProps, ControlMetadata,
    SpdkRpcServer,
};
pub use provider::ProviderConfig;
pub use roles::BdevRoles;
pub use tier::{
    BdevClass, BdevParams, Class, DeviceList, ScmClass, ScmParams, TierConfig,
    TierConfigs, VosEnv, MAX_ROLE_TIERS,
};

/// File name of the generated device configuration.
pub const NVME_CONF_NAME: &str = "daos_nvme.conf";

/// Storage configuration of a single engine.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStorageConfig {
    #[serde(default)]
    pub engine_idx: u32,

    #[serde(default)]
    pub hostname: String,

    #[serde(default, rename = "tier")]
    pub tiers: TierConfigs,

    #[serde(default)]
    pub control_metadata: ControlMetadata,

    #[serde(default)]
    pub enable_hotplug: bool,

    /// NUMA node the engine is pinned to.
    #[serde(default)]
    pub numa_node: u32,

    #[serde(default)]
    pub accel: AccelProps,

    #[serde(default)]
    pub spdk_rpc_server: SpdkRpcServer,

    #[serde(default)]
    pub auto_faulty: AutoFaultyProps,

    /// Derived during validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vos_env: Option<VosEnv>,

    /// Derived during validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_output_path: Option<PathBuf>,
}

impl EngineStorageConfig {
    pub fn new(engine_idx: u32, hostname: impl Into<String>) -> Self {
        Self { engine_idx, hostname: hostname.into(), ..Default::default() }
    }

    pub fn with_tiers(mut self, tiers: Vec<TierConfig>) -> Self {
        self.tiers = TierConfigs::new(tiers);
        self
    }

    pub fn with_control_metadata(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_metadata.path = Some(path.into());
        self
    }

    /// Validates the tier layout and computes the derived fields.
    ///
    /// Roles are assigned implicitly only when a control metadata path has
    /// been configured; otherwise the tiers are checked as given.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.tiers.validate()?;

        if self.control_metadata.has_path() {
            self.tiers.assign_bdev_roles()?;
        }
        self.tiers.validate_bdev_roles()?;

        let has_meta = self.tiers.has_bdev_role(BdevRoles::META);
        match (has_meta, self.control_metadata.has_path()) {
            (true, false) => return Err(ConfigError::ControlMetadataMissing),
            (false, true) => {
                return Err(ConfigError::ControlMetadataWithoutRoles)
            }
            _ => {}
        }

        self.vos_env = self.tiers.vos_env();
        self.config_output_path = self.output_path();
        Ok(())
    }

    /// MD-on-SSD mode is in effect.
    pub fn md_on_ssd(&self) -> bool {
        self.control_metadata.has_path() && self.tiers.has_roles()
    }

    fn output_path(&self) -> Option<PathBuf> {
        if let Some(dir) =
            self.control_metadata.engine_directory(self.engine_idx)
        {
            return Some(dir.join(NVME_CONF_NAME));
        }
        self.tiers
            .scm_config()
            .and_then(|t| t.scm.mount_point.as_ref())
            .map(|m| m.join(NVME_CONF_NAME))
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid storage configuration: {0}")]
    Validation(#[from] ConfigError),
}

impl ParseError {
    pub fn to_fault(&self) -> Fault {
        match self {
            ParseError::Validation(e) => e.to_fault(),
            ParseError::Toml(_) | ParseError::Io(_) => Fault::new(
                FaultCode::BdevConfigParseFailure,
                self.to_string(),
                "check that the storage configuration file is readable and \
                 is valid TOML",
            ),
        }
    }
}

impl From<ParseError> for Fault {
    fn from(err: ParseError) -> Self {
        err.to_fault()
    }
}

fn string_array(tier: &toml::Value, key: &str) -> Option<Vec<String>> {
    tier.get(key)?
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

/// Checks the tier fields whose typed decoding would otherwise report a
/// configuration fault as a bare TOML error.
fn check_tier_fields(doc: &toml::Value) -> Result<(), ConfigError> {
    let Some(tiers) = doc.get("tier").and_then(toml::Value::as_array) else {
        return Ok(());
    };
    for tier in tiers {
        if let Some(list) = string_array(tier, "bdev_list") {
            DeviceList::try_from(list)?;
        }
        if let Some(roles) = string_array(tier, "bdev_roles") {
            BdevRoles::from_str(&roles.join(","))?;
        }
    }
    Ok(())
}

/// Loads and validates an engine storage configuration.
pub fn parse<P: AsRef<Path>>(
    path: P,
) -> Result<EngineStorageConfig, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let doc: toml::Value = toml::from_str(&contents)?;
    check_tier_fields(&doc)?;
    let mut cfg = doc.try_into::<EngineStorageConfig>()?;
    cfg.validate()?;
    Ok(cfg)
}
