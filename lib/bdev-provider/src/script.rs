// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver (un)binding through the acceleration library's setup script.

use std::path::PathBuf;
use std::process::Command;

use bdev_types::PciAddressSet;
use slog::{debug, Logger};
use thiserror::Error;

pub const ENV_NRHUGE: &str = "_NRHUGE";
pub const ENV_HUGENODE: &str = "_HUGENODE";
pub const ENV_TARGET_USER: &str = "_TARGET_USER";
pub const ENV_PCI_ALLOWED: &str = "_PCI_ALLOWED";
pub const ENV_PCI_BLOCKED: &str = "_PCI_BLOCKED";
pub const ENV_DRIVER_OVERRIDE: &str = "_DRIVER_OVERRIDE";

/// Driver override used when VFIO is unavailable or disabled.
pub const DRIVER_UIO: &str = "uio_pci_generic";
/// Driver override that leaves devices unbound.
pub const DRIVER_NONE: &str = "none";

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to run {}: {source}", .path.display())]
    Spawn { path: PathBuf, source: std::io::Error },

    #[error("{} {mode} exited with {status}: {stderr}", .path.display())]
    Failed {
        path: PathBuf,
        mode: &'static str,
        status: String,
        stderr: String,
    },
}

/// Environment handed to the script.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptEnv {
    pub nr_hugepages: u32,
    /// Comma separated NUMA node list.
    pub huge_node: Option<String>,
    pub target_user: Option<String>,
    pub pci_allowed: PciAddressSet,
    pub pci_blocked: PciAddressSet,
    pub driver_override: Option<String>,
}

impl ScriptEnv {
    pub fn vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![(ENV_NRHUGE, self.nr_hugepages.to_string())];
        if let Some(node) = &self.huge_node {
            vars.push((ENV_HUGENODE, node.clone()));
        }
        if let Some(user) = &self.target_user {
            vars.push((ENV_TARGET_USER, user.clone()));
        }
        if !self.pci_allowed.is_empty() {
            vars.push((ENV_PCI_ALLOWED, self.pci_allowed.to_string()));
        }
        if !self.pci_blocked.is_empty() {
            vars.push((ENV_PCI_BLOCKED, self.pci_blocked.to_string()));
        }
        if let Some(driver) = &self.driver_override {
            vars.push((ENV_DRIVER_OVERRIDE, driver.clone()));
        }
        vars
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait Script: Send + Sync {
    /// Allocates hugepages and binds devices to a user-space driver.
    fn prepare(&self, env: &ScriptEnv) -> Result<(), ScriptError>;

    /// Returns devices to their kernel drivers.
    fn reset(&self, env: &ScriptEnv) -> Result<(), ScriptError>;
}

pub struct SetupScript {
    path: PathBuf,
    log: Logger,
}

impl SetupScript {
    pub fn new(path: impl Into<PathBuf>, log: Logger) -> Self {
        Self { path: path.into(), log }
    }

    fn run(
        &self,
        mode: &'static str,
        env: &ScriptEnv,
    ) -> Result<(), ScriptError> {
        let mut cmd = Command::new(&self.path);
        if mode == "reset" {
            cmd.arg("reset");
        }
        let vars = env.vars();
        debug!(self.log, "running setup script";
            "mode" => mode, "env" => ?vars);
        cmd.envs(vars);

        let out = cmd.output().map_err(|source| ScriptError::Spawn {
            path: self.path.clone(),
            source,
        })?;
        if !out.status.success() {
            return Err(ScriptError::Failed {
                path: self.path.clone(),
                mode,
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

impl Script for SetupScript {
    fn prepare(&self, env: &ScriptEnv) -> Result<(), ScriptError> {
        self.run("prepare", env)
    }

    fn reset(&self, env: &ScriptEnv) -> Result<(), ScriptError> {
        self.run("reset", env)
    }
}
