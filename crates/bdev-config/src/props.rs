// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Engine-wide options that end up in the generated device configuration.

use std::path::{Path, PathBuf};

use bitflags::bitflags;
use serde::{de, Deserializer, Serializer};
use serde_derive::{Deserialize, Serialize};

/// Acceleration engine used for data movement and checksums.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AccelEngine {
    #[default]
    None,
    Spdk,
    Dml,
}

bitflags! {
    /// Capabilities to offload to the acceleration engine.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct AccelOptions: u16 {
        const MOVE = 1 << 0;
        const CRC = 1 << 1;
    }
}

const ACCEL_OPT_NAMES: [(AccelOptions, &str); 2] =
    [(AccelOptions::MOVE, "move"), (AccelOptions::CRC, "crc")];

impl serde::Serialize for AccelOptions {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(
            ACCEL_OPT_NAMES
                .iter()
                .filter(|(o, _)| self.contains(*o))
                .map(|(_, n)| *n),
        )
    }
}

impl<'d> serde::Deserialize<'d> for AccelOptions {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let mut opts = AccelOptions::empty();
        let names =
            <Vec<String> as serde::Deserialize>::deserialize(deserializer)?;
        for name in names {
            let Some((opt, _)) = ACCEL_OPT_NAMES
                .iter()
                .find(|(_, n)| n.eq_ignore_ascii_case(&name))
            else {
                return Err(de::Error::custom(format!(
                    "unknown acceleration option {name:?}"
                )));
            };
            opts |= *opt;
        }
        Ok(opts)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccelProps {
    #[serde(default)]
    pub engine: AccelEngine,

    #[serde(default)]
    pub options: AccelOptions,
}

impl AccelProps {
    /// Only a non-default engine with some capability selected needs to be
    /// passed on to the acceleration library.
    pub fn is_active(&self) -> bool {
        self.engine != AccelEngine::None && !self.options.is_empty()
    }
}

/// Exposure of the acceleration library's JSON-RPC server.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpdkRpcServer {
    #[serde(default)]
    pub enable: bool,

    #[serde(default)]
    pub sock_addr: Option<PathBuf>,
}

/// Thresholds beyond which a device is automatically marked faulty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AutoFaultyProps {
    #[serde(default)]
    pub enable: bool,

    #[serde(default = "AutoFaultyProps::default_max_errs")]
    pub max_io_errs: u32,

    #[serde(default = "AutoFaultyProps::default_max_errs")]
    pub max_csum_errs: u32,
}

impl AutoFaultyProps {
    fn default_max_errs() -> u32 {
        10
    }
}

impl Default for AutoFaultyProps {
    fn default() -> Self {
        Self {
            enable: false,
            max_io_errs: Self::default_max_errs(),
            max_csum_errs: Self::default_max_errs(),
        }
    }
}

/// Location of engine control metadata when it lives outside the memory
/// tier (MD-on-SSD).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlMetadata {
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub device_path: Option<PathBuf>,
}

impl ControlMetadata {
    pub fn has_path(&self) -> bool {
        self.path.as_deref().is_some_and(|p| !p.as_os_str().is_empty())
    }

    /// Per-engine directory under the control metadata path.
    pub fn engine_directory(&self, engine_idx: u32) -> Option<PathBuf> {
        self.path
            .as_deref()
            .filter(|_| self.has_path())
            .map(|p: &Path| p.join(format!("engine{engine_idx}")))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        accel: AccelProps,
    }

    #[test]
    fn accel_props_from_toml() {
        let w: Wrapper = toml::from_str(
            r#"
[accel]
engine = "dml"
options = ["crc", "MOVE"]
"#,
        )
        .unwrap();
        assert_eq!(w.accel.engine, AccelEngine::Dml);
        assert_eq!(w.accel.options, AccelOptions::all());
        assert!(w.accel.is_active());

        let w: Wrapper =
            toml::from_str("[accel]\nengine = \"spdk\"\n").unwrap();
        assert!(!w.accel.is_active());

        let bad_opt = "[accel]\noptions = [\"zip\"]\n";
        assert!(toml::from_str::<Wrapper>(bad_opt).is_err());
    }

    #[test]
    fn control_metadata_engine_directory() {
        assert_eq!(ControlMetadata::default().engine_directory(0), None);
        let md = ControlMetadata {
            path: Some("/var/daos/md".into()),
            device_path: None,
        };
        assert_eq!(
            md.engine_directory(1),
            Some(PathBuf::from("/var/daos/md/engine1"))
        );
    }
}
