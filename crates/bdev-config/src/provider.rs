// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};

use crate::ParseError;

/// Host-level settings for the bdev provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Privileged helper that mutating requests are forwarded to.
    pub helper_path: PathBuf,

    /// Device (un)binding script shipped with the acceleration library.
    pub setup_script: PathBuf,

    pub hugepage_dir: PathBuf,

    /// Directory holding the acceleration library's per-device lockfiles.
    pub lockfile_dir: PathBuf,

    pub sysfs_root: PathBuf,

    /// Never forward, even when running unprivileged.
    pub disable_forwarding: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            helper_path: PathBuf::from("/usr/libexec/bdev-helper"),
            setup_script: PathBuf::from("/usr/share/spdk/scripts/setup.sh"),
            hugepage_dir: PathBuf::from("/dev/hugepages"),
            lockfile_dir: PathBuf::from("/var/tmp"),
            sysfs_root: PathBuf::from("/sys"),
            disable_forwarding: false,
        }
    }
}

impl ProviderConfig {
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self, ParseError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str::<Self>(&contents)?)
    }
}
