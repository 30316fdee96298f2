// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The operations every bdev backend provides, and their request and
//! response types.
//!
//! Requests are serializable so that they can be handed to the privileged
//! helper as-is. Each carries a `forwarded` flag, set once by the forwarder
//! so that a forwarded request is never forwarded again.

use std::collections::BTreeMap;
use std::path::PathBuf;

use bdev_config::{
    BdevClass, BdevRoles, DeviceList, EngineStorageConfig, TierConfig,
};
use bdev_types::{BusRange, Fault, FaultCode, PciAddress, PciAddressSet};
use serde_derive::{Deserialize, Serialize};

use crate::controller::{Controller, Controllers};
use crate::spdk_config::SpdkConfig;
use crate::Error;

/// Access to the flag preventing a request from being forwarded twice.
pub trait Forwardable {
    fn forwarded(&self) -> bool;
    fn set_forwarded(&mut self);
}

macro_rules! impl_forwardable {
    ($($req:ty),* $(,)?) => {
        $(
            impl Forwardable for $req {
                fn forwarded(&self) -> bool {
                    self.forwarded
                }

                fn set_forwarded(&mut self) {
                    self.forwarded = true;
                }
            }
        )*
    };
}

impl_forwardable!(
    ScanRequest,
    PrepareRequest,
    FormatRequest,
    WriteConfigRequest,
    ReadConfigRequest,
    FirmwareQueryRequest,
    FirmwareUpdateRequest,
);

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub forwarded: bool,
    /// Restrict discovery to these devices; empty means all.
    pub device_list: PciAddressSet,
    pub vmd_enabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResponse {
    pub controllers: Controllers,
    pub vmd_enabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    #[serde(default)]
    pub forwarded: bool,
    pub hugepage_count: u32,
    /// Comma separated NUMA nodes to allocate hugepages on.
    pub huge_nodes: Option<String>,
    /// Owner of the devices and hugepages once bound.
    pub target_user: Option<String>,
    pub pci_allowlist: PciAddressSet,
    pub pci_blocklist: PciAddressSet,
    pub disable_vfio: bool,
    pub enable_vmd: bool,
    /// Only reclaim orphaned hugepages; leave driver bindings alone.
    pub clean_hugepages_only: bool,
    /// Return devices to the kernel instead of binding them.
    pub reset: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub hugepages_removed: usize,
    pub vmd_prepared: bool,
}

/// What a backend needs to know about one bdev tier.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierProperties {
    pub tier: usize,
    pub class: BdevClass,
    pub device_list: DeviceList,
    /// Size of emulated backing files, in GiB.
    pub file_size: u64,
    pub roles: BdevRoles,
}

impl From<&TierConfig> for TierProperties {
    fn from(cfg: &TierConfig) -> Self {
        Self {
            tier: cfg.tier,
            class: cfg.class.bdev_class(),
            device_list: cfg.bdev.device_list.clone(),
            file_size: cfg.bdev.file_size,
            roles: cfg.bdev.roles,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatRequest {
    #[serde(default)]
    pub forwarded: bool,
    pub properties: TierProperties,
    /// Owner given to emulated backing files.
    pub owner_uid: u32,
    pub owner_gid: u32,
    pub vmd_enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFormatResult {
    pub formatted: bool,
    pub error: Option<Fault>,
}

impl DeviceFormatResult {
    pub fn ok() -> Self {
        Self { formatted: true, error: None }
    }

    pub fn failed(fault: Fault) -> Self {
        Self { formatted: false, error: Some(fault) }
    }
}

/// Per-device outcomes, keyed by PCI address or path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatResponse {
    pub devices: BTreeMap<String, DeviceFormatResult>,
}

impl FormatResponse {
    pub fn all_formatted(&self) -> bool {
        self.devices.values().all(|r| r.formatted)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&String, &Fault)> {
        self.devices
            .iter()
            .filter_map(|(dev, r)| r.error.as_ref().map(|f| (dev, f)))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteConfigRequest {
    #[serde(default)]
    pub forwarded: bool,
    /// Validated engine configuration.
    pub engine: EngineStorageConfig,
    pub vmd_enabled: bool,
    pub numa_bus_range: Option<BusRange>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteConfigResponse {
    /// Where the document was written; `None` when the engine has no bdevs.
    pub path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadConfigRequest {
    #[serde(default)]
    pub forwarded: bool,
    pub path: PathBuf,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadConfigResponse {
    pub config: SpdkConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareQueryRequest {
    #[serde(default)]
    pub forwarded: bool,
    pub device_list: PciAddressSet,
    /// Whether the last prepare set up VMD, so that endpoints in
    /// `device_list` are expanded to their backing devices.
    #[serde(default)]
    pub vmd_enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub address: PciAddress,
    pub model: String,
    pub serial: String,
    pub fw_rev: String,
}

impl From<&Controller> for FirmwareInfo {
    fn from(c: &Controller) -> Self {
        Self {
            address: c.pci_addr,
            model: c.model.clone(),
            serial: c.serial.clone(),
            fw_rev: c.fw_rev.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareQueryResponse {
    pub devices: Vec<FirmwareInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareUpdateRequest {
    #[serde(default)]
    pub forwarded: bool,
    /// Kept as given so that an empty address can be reported as such.
    pub address: String,
    pub image_path: PathBuf,
    pub slot: u32,
}

/// Parses the controller address of a firmware update.
pub(crate) fn firmware_address(address: &str) -> Result<PciAddress, Error> {
    let address = address.trim();
    if address.is_empty() {
        return Err(Fault::new(
            FaultCode::BdevNoAddress,
            "firmware update names no controller",
            "specify the PCI address of the controller to update",
        )
        .into());
    }
    address.parse::<PciAddress>().map_err(|e| Error::Config(e.into()))
}

pub(crate) fn unknown_class_fault(tier: usize) -> Fault {
    Fault::new(
        FaultCode::BdevFormatUnknownClass,
        format!("tier {tier} has no bdev class to format"),
        "only nvme, file and kdev tiers can be formatted",
    )
}

/// A bdev backend.
///
/// Implementations report per-device failures inside their responses and
/// reserve `Err` for failures of the request as a whole.
pub trait Backend: Send + Sync {
    fn scan(&self, req: ScanRequest) -> Result<ScanResponse, Error>;

    fn format(&self, req: FormatRequest) -> Result<FormatResponse, Error>;

    fn prepare(&self, req: PrepareRequest) -> Result<PrepareResponse, Error>;

    fn reset(&self, req: PrepareRequest) -> Result<(), Error>;

    fn write_config(
        &self,
        req: WriteConfigRequest,
    ) -> Result<WriteConfigResponse, Error>;

    fn read_config(
        &self,
        req: ReadConfigRequest,
    ) -> Result<ReadConfigResponse, Error>;

    fn update_firmware(&self, req: FirmwareUpdateRequest) -> Result<(), Error>;
}

#[cfg(test)]
mod test {
    use super::*;
    use bdev_config::Class;

    #[test]
    fn forwarded_flag_set_once() {
        let mut req = ScanRequest::default();
        assert!(!req.forwarded());
        req.set_forwarded();
        assert!(req.forwarded());

        let wire: ScanRequest =
            serde_json::from_str(r#"{"device_list": [], "vmd_enabled": true}"#)
                .unwrap();
        assert!(!wire.forwarded);
    }

    #[test]
    fn tier_properties_from_config() {
        let cfg = TierConfig::new(Class::Nvme)
            .with_bdev_devices(["0000:81:00.0"])
            .unwrap()
            .with_roles(BdevRoles::all());
        let props = TierProperties::from(&cfg);
        assert_eq!(props.class, BdevClass::Nvme);
        assert_eq!(props.roles, BdevRoles::all());
        assert_eq!(props.device_list.strings(), ["0000:81:00.0"]);
    }

    #[test]
    fn write_config_request_survives_the_wire() {
        let mut engine = EngineStorageConfig::new(2, "host-a")
            .with_tiers(vec![
                TierConfig::new(Class::Ram).with_scm_mount("/mnt/daos2"),
                TierConfig::new(Class::Nvme)
                    .with_bdev_devices(["0000:81:00.0", "5d0505:01:00.0"])
                    .unwrap(),
            ])
            .with_control_metadata("/var/daos/md");
        engine.validate().unwrap();
        let req = WriteConfigRequest {
            forwarded: true,
            engine,
            vmd_enabled: true,
            numa_bus_range: Some(BusRange::new(0x80, 0xff).unwrap()),
        };

        let wire = serde_json::to_string(&req).unwrap();
        let back: WriteConfigRequest = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn format_response_summaries() {
        let mut resp = FormatResponse::default();
        resp.devices.insert("0000:81:00.0".into(), DeviceFormatResult::ok());
        assert!(resp.all_formatted());
        resp.devices.insert(
            "0000:82:00.0".into(),
            DeviceFormatResult::failed(Fault::unknown("boom")),
        );
        assert!(!resp.all_formatted());
        let failed: Vec<_> = resp.failures().map(|(d, _)| d.as_str()).collect();
        assert_eq!(failed, ["0000:82:00.0"]);
    }
}
