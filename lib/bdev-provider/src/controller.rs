// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Discovered NVMe controllers and the records hanging off them.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use bdev_config::{BdevClass, BdevRoles};
use bdev_types::{PciAddress, PciAddressSet};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

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
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ControllerState {
    #[default]
    Unknown,
    Normal,
    New,
    Faulty,
    Unplugged,
}

/// State of the status indicator LED on a device slot.
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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LedState {
    #[default]
    Unknown,
    Off,
    On,
    QuickBlink,
    SlowBlink,
}

/// SMART/health log of a controller plus the engine's own error counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStats {
    /// Composite temperature, in Kelvin.
    pub temperature: u32,
    pub temp_warn: bool,
    pub avail_spare_warn: bool,
    pub reliability_warn: bool,
    pub read_only_warn: bool,
    pub volatile_warn: bool,

    pub power_cycles: u64,
    pub power_on_hours: u64,
    pub unsafe_shutdowns: u64,
    pub media_errors: u64,
    pub err_log_entries: u64,

    pub bio_read_errs: u32,
    pub bio_write_errs: u32,
    pub bio_unmap_errs: u32,
    pub checksum_errs: u32,
}

impl HealthStats {
    pub fn temperature_celsius(&self) -> i64 {
        i64::from(self.temperature) - 273
    }

    pub fn has_warnings(&self) -> bool {
        self.temp_warn
            || self.avail_spare_warn
            || self.reliability_warn
            || self.read_only_warn
            || self.volatile_warn
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: u32,
    /// Size in bytes.
    pub size: u64,
}

/// A blobstore device as registered in the engine's SMD table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmdDevice {
    pub uuid: Uuid,
    pub target_ids: Vec<i32>,
    pub roles: BdevRoles,
    pub rank: u32,
    pub total_bytes: u64,
    pub avail_bytes: u64,
    pub state: ControllerState,
    pub led: LedState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Controller {
    pub pci_addr: PciAddress,
    pub model: String,
    pub serial: String,
    pub fw_rev: String,
    pub vendor_id: String,
    pub socket_id: u32,
    #[serde(default)]
    pub health: Option<HealthStats>,
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
    #[serde(default)]
    pub smd_devices: Vec<SmdDevice>,
    #[serde(default)]
    pub state: ControllerState,
    #[serde(default)]
    pub led: LedState,
}

impl Controller {
    pub fn new(pci_addr: PciAddress) -> Self {
        Self {
            pci_addr,
            model: String::new(),
            serial: String::new(),
            fw_rev: String::new(),
            vendor_id: String::new(),
            socket_id: 0,
            health: None,
            namespaces: Vec::new(),
            smd_devices: Vec::new(),
            state: ControllerState::Unknown,
            led: LedState::Unknown,
        }
    }

    /// Sum of namespace sizes, in bytes.
    pub fn capacity(&self) -> u64 {
        self.namespaces.iter().map(|ns| ns.size).sum()
    }

    pub fn is_vmd_backing(&self) -> bool {
        self.pci_addr.is_vmd_backing_address()
    }
}

/// Controller inventory, unique by PCI address.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Controllers(Vec<Controller>);

impl Controllers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Controller> {
        self.0.iter()
    }

    pub fn get(&self, addr: &PciAddress) -> Option<&Controller> {
        self.0.iter().find(|c| &c.pci_addr == addr)
    }

    pub fn addresses(&self) -> PciAddressSet {
        self.0.iter().map(|c| c.pci_addr).collect()
    }

    pub fn capacity(&self) -> u64 {
        self.0.iter().map(Controller::capacity).sum()
    }

    /// Replaces the record with the same address, or appends it.
    pub fn update(&mut self, ctrlr: Controller) {
        match self.0.iter_mut().find(|c| c.pci_addr == ctrlr.pci_addr) {
            Some(existing) => *existing = ctrlr,
            None => self.0.push(ctrlr),
        }
    }

    /// Folds a fresh scan into the inventory.
    pub fn refresh(&mut self, scanned: Controllers) {
        for ctrlr in scanned {
            self.update(ctrlr);
        }
    }
}

impl FromIterator<Controller> for Controllers {
    fn from_iter<T: IntoIterator<Item = Controller>>(iter: T) -> Self {
        let mut out = Controllers::new();
        for ctrlr in iter {
            out.update(ctrlr);
        }
        out
    }
}

impl IntoIterator for Controllers {
    type Item = Controller;
    type IntoIter = std::vec::IntoIter<Controller>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Controllers {
    type Item = &'a Controller;
    type IntoIter = std::slice::Iter<'a, Controller>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Device-name prefix chosen by the kind of bdev being attached.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum BdevKind {
    #[strum(serialize = "Nvme")]
    Nvme,
    #[strum(serialize = "AIO")]
    Aio,
}

impl BdevKind {
    pub fn for_class(class: BdevClass) -> Option<BdevKind> {
        match class {
            BdevClass::Nvme => Some(BdevKind::Nvme),
            BdevClass::File | BdevClass::Kdev => Some(BdevKind::Aio),
            BdevClass::None => None,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("malformed bdev name {0:?}")]
pub struct BadBdevName(pub String);

/// Structured form of a generated bdev name,
/// `<kind>_<hostname>_<index>_<tier>_<rolebits>`.
///
/// Names travel through the acceleration library and the engine, which
/// recover tier and role context from them; the library may append a
/// namespace suffix (`n1`) which is ignored on parse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BdevName {
    pub kind: BdevKind,
    pub hostname: String,
    pub index: usize,
    pub tier: usize,
    pub roles: BdevRoles,
}

impl Display for BdevName {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(
            f,
            "{}_{}_{}_{}_{}",
            self.kind,
            self.hostname,
            self.index,
            self.tier,
            self.roles.bits()
        )
    }
}

impl FromStr for BdevName {
    type Err = BadBdevName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || BadBdevName(s.to_string());

        let mut fields = s.rsplitn(4, '_');
        let roles = fields.next().ok_or_else(bad)?;
        let tier = fields.next().ok_or_else(bad)?;
        let index = fields.next().ok_or_else(bad)?;
        let (kind, hostname) =
            fields.next().and_then(|r| r.split_once('_')).ok_or_else(bad)?;

        // Strip a namespace suffix appended by the library.
        let roles = roles.split_once('n').map_or(roles, |(r, _)| r);
        let roles = roles
            .parse::<u16>()
            .ok()
            .and_then(BdevRoles::from_bits)
            .ok_or_else(bad)?;

        if hostname.is_empty() {
            return Err(bad());
        }
        Ok(BdevName {
            kind: kind.parse().map_err(|_| bad())?,
            hostname: hostname.to_string(),
            index: index.parse().map_err(|_| bad())?,
            tier: tier.parse().map_err(|_| bad())?,
            roles,
        })
    }
}
