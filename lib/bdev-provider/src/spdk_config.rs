// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The JSON device configuration consumed by the acceleration library.
//!
//! The document holds an ordered list of subsystems, each an ordered list
//! of `{method, params}` directives, plus a section of engine-specific
//! directives the library passes through untouched. Method and field names
//! are fixed by the library and must match exactly.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bdev_config::{BdevClass, EngineStorageConfig, TierConfig};
use bdev_types::{BusRange, Fault, FaultCode};
use serde_derive::{Deserialize, Serialize};
use slog::{debug, Logger};
use thiserror::Error;

use crate::controller::{BdevKind, BdevName};

pub const SUBSYSTEM_BDEV: &str = "bdev";
pub const SUBSYSTEM_VMD: &str = "vmd";

const BDEV_IO_POOL_SIZE: u64 = 65536;
const BDEV_IO_CACHE_SIZE: u64 = 256;
const NVME_RETRY_COUNT: u32 = 4;
const NVME_ADMINQ_POLL_PERIOD_US: u64 = 100_000;
const HOTPLUG_PERIOD_US: u64 = 5_000_000;
const AIO_BLOCK_SIZE: u32 = 4096;

#[derive(Debug, Error)]
pub enum SpdkConfigError {
    #[error("no PCI buses known on NUMA node {0} to bound hotplug events")]
    NoHotplugBuses(u32),

    #[error("engine {0} has no output path for its device configuration")]
    NoOutputPath(u32),

    #[error("{}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("{}: {source}", .path.display())]
    Parse { path: PathBuf, source: serde_json::Error },

    #[error("cannot encode device configuration: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SpdkConfigError {
    pub fn to_fault(&self) -> Fault {
        match self {
            SpdkConfigError::NoHotplugBuses(_) => Fault::new(
                FaultCode::BdevConfigNoHotplugBuses,
                self.to_string(),
                "set bdev_busid_range on the nvme tiers or pin the engine \
                 to a NUMA node with NVMe devices",
            ),
            SpdkConfigError::Io { .. } | SpdkConfigError::Parse { .. } => {
                Fault::new(
                    FaultCode::BdevConfigReadFailure,
                    self.to_string(),
                    "regenerate the device configuration by restarting the \
                     engine",
                )
            }
            SpdkConfigError::NoOutputPath(_) | SpdkConfigError::Encode(_) => {
                Fault::unknown(self.to_string())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BdevSetOptions {
    pub bdev_io_pool_size: u64,
    pub bdev_io_cache_size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NvmeSetOptions {
    pub retry_count: u32,
    pub timeout_us: u64,
    pub nvme_adminq_poll_period_us: u64,
    pub action_on_timeout: String,
    pub nvme_ioq_poll_period_us: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NvmeAttachController {
    pub trtype: String,
    pub name: String,
    pub traddr: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AioCreate {
    pub filename: String,
    pub name: String,
    pub block_size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NvmeSetHotplug {
    pub period_us: u64,
    pub enable: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoParams {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HotplugBusIdRange {
    pub begin: u8,
    pub end: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccelPropsParams {
    pub accel_engine: String,
    pub accel_opts: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcServerParams {
    pub enable: bool,
    pub sock_addr: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoFaultyParams {
    pub enable: bool,
    pub max_io_errs: u32,
    pub max_csum_errs: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "params",
    rename_all = "snake_case",
    deny_unknown_fields
)]
pub enum Directive {
    BdevSetOptions(BdevSetOptions),
    BdevNvmeSetOptions(NvmeSetOptions),
    BdevNvmeAttachController(NvmeAttachController),
    BdevAioCreate(AioCreate),
    BdevNvmeSetHotplug(NvmeSetHotplug),
    EnableVmd(NoParams),
    HotplugBusidRange(HotplugBusIdRange),
    AccelProps(AccelPropsParams),
    SpdkRpcSrv(RpcServerParams),
    AutoFaulty(AutoFaultyParams),
}

impl Directive {
    /// Name of the bdev this directive creates, if any.
    pub fn bdev_name(&self) -> Option<&str> {
        match self {
            Directive::BdevNvmeAttachController(p) => Some(p.name.as_str()),
            Directive::BdevAioCreate(p) => Some(p.name.as_str()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Subsystem {
    pub subsystem: String,
    pub config: Vec<Directive>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaosData {
    pub config: Vec<Directive>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpdkConfig {
    pub daos_data: DaosData,
    pub subsystems: Vec<Subsystem>,
}

impl SpdkConfig {
    pub fn subsystem(&self, name: &str) -> Option<&Subsystem> {
        self.subsystems.iter().find(|s| s.subsystem == name)
    }

    /// Structured names of every bdev the document creates. Names that do
    /// not follow the generated scheme are skipped.
    pub fn bdev_names(&self) -> Vec<BdevName> {
        self.subsystem(SUBSYSTEM_BDEV)
            .into_iter()
            .flat_map(|s| s.config.iter())
            .filter_map(Directive::bdev_name)
            .filter_map(|n| n.parse().ok())
            .collect()
    }

    /// Parses a document, refusing unknown fields.
    pub fn read(path: &Path) -> Result<Self, SpdkConfigError> {
        let raw = fs::read(path).map_err(|source| SpdkConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| SpdkConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn write(&self, path: &Path) -> Result<(), SpdkConfigError> {
        let io_err = |source| SpdkConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let buf = serde_json::to_vec_pretty(self)?;
        fs::write(path, buf).map_err(io_err)
    }
}

/// Inputs for generating one engine's document.
#[derive(Clone, Debug)]
pub struct ConfigInput<'a> {
    /// Validated engine configuration. Device lists of nvme tiers must
    /// already name VMD backing devices rather than endpoints.
    pub engine: &'a EngineStorageConfig,
    pub vmd_enabled: bool,
    /// Bus span of the engine's NUMA node, from the host topology.
    pub numa_bus_range: Option<BusRange>,
}

impl ConfigInput<'_> {
    /// Bus range honored for hotplug events.
    pub fn hotplug_bus_range(&self) -> Result<BusRange, SpdkConfigError> {
        if self.vmd_enabled {
            return Ok(BusRange::FULL);
        }
        if let Some(range) =
            self.engine.tiers.bdev_configs().find_map(|t| t.bdev.bus_id_range)
        {
            return Ok(range);
        }
        self.numa_bus_range
            .ok_or(SpdkConfigError::NoHotplugBuses(self.engine.numa_node))
    }
}

fn tier_directives(hostname: &str, tier: &TierConfig) -> Vec<Directive> {
    let class = tier.class.bdev_class();
    let Some(kind) = BdevKind::for_class(class) else {
        return Vec::new();
    };
    let name = |index| {
        BdevName {
            kind,
            hostname: hostname.to_string(),
            index,
            tier: tier.tier,
            roles: tier.bdev.roles,
        }
        .to_string()
    };

    match class {
        BdevClass::Nvme => tier
            .bdev
            .device_list
            .pci()
            .into_iter()
            .flat_map(|set| set.iter())
            .enumerate()
            .map(|(idx, addr)| {
                Directive::BdevNvmeAttachController(NvmeAttachController {
                    trtype: "PCIe".to_string(),
                    name: name(idx),
                    traddr: addr.to_string(),
                })
            })
            .collect(),
        BdevClass::File | BdevClass::Kdev => tier
            .bdev
            .device_list
            .paths()
            .iter()
            .enumerate()
            .map(|(idx, path)| {
                Directive::BdevAioCreate(AioCreate {
                    filename: path.clone(),
                    name: name(idx),
                    block_size: AIO_BLOCK_SIZE,
                })
            })
            .collect(),
        BdevClass::None => Vec::new(),
    }
}

/// Assembles the device configuration document for an engine.
///
/// Hotplug enablement is always the last bdev directive: the library races
/// attaching controllers against hotplug monitoring otherwise, which shows
/// up with VMD.
pub fn generate(
    log: &Logger,
    input: &ConfigInput<'_>,
) -> Result<SpdkConfig, SpdkConfigError> {
    let engine = input.engine;
    let mut bdev = vec![
        Directive::BdevSetOptions(BdevSetOptions {
            bdev_io_pool_size: BDEV_IO_POOL_SIZE,
            bdev_io_cache_size: BDEV_IO_CACHE_SIZE,
        }),
        Directive::BdevNvmeSetOptions(NvmeSetOptions {
            retry_count: NVME_RETRY_COUNT,
            timeout_us: 0,
            nvme_adminq_poll_period_us: NVME_ADMINQ_POLL_PERIOD_US,
            action_on_timeout: "none".to_string(),
            nvme_ioq_poll_period_us: 0,
        }),
    ];
    let mut daos = Vec::new();

    if engine.accel.is_active() {
        daos.push(Directive::AccelProps(AccelPropsParams {
            accel_engine: engine.accel.engine.to_string(),
            accel_opts: engine.accel.options.bits(),
        }));
    }
    if engine.spdk_rpc_server.enable {
        daos.push(Directive::SpdkRpcSrv(RpcServerParams {
            enable: true,
            sock_addr: engine
                .spdk_rpc_server
                .sock_addr
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        }));
    }
    if engine.auto_faulty.enable {
        daos.push(Directive::AutoFaulty(AutoFaultyParams {
            enable: true,
            max_io_errs: engine.auto_faulty.max_io_errs,
            max_csum_errs: engine.auto_faulty.max_csum_errs,
        }));
    }

    for tier in engine.tiers.bdev_configs() {
        bdev.extend(tier_directives(&engine.hostname, tier));
    }

    if engine.enable_hotplug && engine.tiers.have_real_nvme() {
        let range = input.hotplug_bus_range()?;
        debug!(log, "hotplug enabled";
            "engine" => engine.engine_idx,
            "bus_range" => %range
        );
        daos.push(Directive::HotplugBusidRange(HotplugBusIdRange {
            begin: range.begin(),
            end: range.end(),
        }));
        bdev.push(Directive::BdevNvmeSetHotplug(NvmeSetHotplug {
            period_us: HOTPLUG_PERIOD_US,
            enable: true,
        }));
    }

    let mut subsystems =
        vec![Subsystem { subsystem: SUBSYSTEM_BDEV.to_string(), config: bdev }];
    if input.vmd_enabled && engine.tiers.have_real_nvme() {
        subsystems.push(Subsystem {
            subsystem: SUBSYSTEM_VMD.to_string(),
            config: vec![Directive::EnableVmd(NoParams {})],
        });
    }

    Ok(SpdkConfig { daos_data: DaosData { config: daos }, subsystems })
}
