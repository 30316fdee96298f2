// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage tier configuration and bdev role validation.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;

use bdev_types::{BusRange, PciAddress, PciAddressSet};
use serde_derive::{Deserialize, Serialize};

use crate::{BdevRoles, ConfigError};

/// Most bdev tiers that can take part in MD-on-SSD role assignment.
pub const MAX_ROLE_TIERS: usize = 3;

/// Storage class of a configured tier.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Class {
    Ram,
    Dcpm,
    Nvme,
    File,
    Kdev,
}

impl Class {
    pub fn is_scm(self) -> bool {
        matches!(self, Class::Ram | Class::Dcpm)
    }

    pub fn scm_class(self) -> Option<ScmClass> {
        match self {
            Class::Ram => Some(ScmClass::Ram),
            Class::Dcpm => Some(ScmClass::Dcpm),
            Class::Nvme | Class::File | Class::Kdev => None,
        }
    }

    pub fn bdev_class(self) -> BdevClass {
        match self {
            Class::Nvme => BdevClass::Nvme,
            Class::File => BdevClass::File,
            Class::Kdev => BdevClass::Kdev,
            Class::Ram | Class::Dcpm => BdevClass::None,
        }
    }
}

/// Class of the memory tier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ScmClass {
    Ram,
    Dcpm,
}

/// Class of a bdev tier, as dispatched on by the provider backends.
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
pub enum BdevClass {
    #[default]
    None,
    Nvme,
    File,
    Kdev,
}

impl BdevClass {
    /// Classes emulated on top of kernel files or block devices.
    pub fn is_emulated(self) -> bool {
        matches!(self, BdevClass::File | BdevClass::Kdev)
    }
}

/// Storage environment the engine's VOS layer is started in.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum VosEnv {
    Nvme,
    Aio,
}

/// The devices backing a bdev tier: either all PCI addresses or all
/// filesystem paths.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub enum DeviceList {
    Pci(PciAddressSet),
    Paths(Vec<String>),
}

impl Default for DeviceList {
    fn default() -> Self {
        DeviceList::Pci(PciAddressSet::new())
    }
}

impl DeviceList {
    pub fn len(&self) -> usize {
        match self {
            DeviceList::Pci(set) => set.len(),
            DeviceList::Paths(paths) => paths.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pci(&self) -> Option<&PciAddressSet> {
        match self {
            DeviceList::Pci(set) => Some(set),
            DeviceList::Paths(_) => None,
        }
    }

    pub fn paths(&self) -> &[String] {
        match self {
            DeviceList::Pci(_) => &[],
            DeviceList::Paths(paths) => paths,
        }
    }

    pub fn strings(&self) -> Vec<String> {
        match self {
            DeviceList::Pci(set) => set.strings(),
            DeviceList::Paths(paths) => paths.clone(),
        }
    }
}

impl TryFrom<Vec<String>> for DeviceList {
    type Error = ConfigError;

    fn try_from(devices: Vec<String>) -> Result<Self, Self::Error> {
        if devices.is_empty() {
            return Ok(DeviceList::default());
        }
        let parsed: Vec<_> = devices
            .iter()
            .map(|d| PciAddress::from_str(d.trim()).ok())
            .collect();
        let n_pci = parsed.iter().filter(|p| p.is_some()).count();

        if n_pci == 0 {
            let mut seen = BTreeSet::new();
            let dups: Vec<_> = devices
                .iter()
                .filter(|d| !seen.insert(d.as_str()))
                .cloned()
                .collect();
            if !dups.is_empty() {
                return Err(ConfigError::DuplicateDevices(dups));
            }
            return Ok(DeviceList::Paths(devices));
        }
        if n_pci != devices.len() {
            return Err(ConfigError::MixedDeviceList(devices));
        }

        let mut set = PciAddressSet::new();
        let mut dups = Vec::new();
        for addr in parsed.into_iter().flatten() {
            if !set.add(addr) {
                dups.push(addr.to_string());
            }
        }
        if !dups.is_empty() {
            return Err(ConfigError::DuplicateDevices(dups));
        }
        Ok(DeviceList::Pci(set))
    }
}

impl From<DeviceList> for Vec<String> {
    fn from(list: DeviceList) -> Self {
        list.strings()
    }
}

/// Parameters only meaningful for the memory tier.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScmParams {
    #[serde(default, rename = "scm_mount")]
    pub mount_point: Option<PathBuf>,

    /// Size of a ram-backed tier, in GiB.
    #[serde(default, rename = "scm_size")]
    pub ramdisk_size: Option<u32>,

    #[serde(default, rename = "scm_list")]
    pub device_list: Vec<String>,
}

/// Parameters only meaningful for bdev tiers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BdevParams {
    #[serde(default, rename = "bdev_list")]
    pub device_list: DeviceList,

    /// Size of each emulated backing file, in GiB.
    #[serde(default, rename = "bdev_size")]
    pub file_size: u64,

    #[serde(default, rename = "bdev_busid_range")]
    pub bus_id_range: Option<BusRange>,

    #[serde(default, rename = "bdev_roles")]
    pub roles: BdevRoles,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Position in the tier list; assigned when the list is built.
    #[serde(skip)]
    pub tier: usize,

    pub class: Class,

    #[serde(flatten)]
    pub scm: ScmParams,

    #[serde(flatten)]
    pub bdev: BdevParams,
}

impl TierConfig {
    pub fn new(class: Class) -> Self {
        Self {
            tier: 0,
            class,
            scm: ScmParams::default(),
            bdev: BdevParams::default(),
        }
    }

    pub fn with_scm_mount(mut self, mount: impl Into<PathBuf>) -> Self {
        self.scm.mount_point = Some(mount.into());
        self
    }

    pub fn with_bdev_devices<I, S>(
        mut self,
        devices: I,
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let devices: Vec<String> =
            devices.into_iter().map(Into::into).collect();
        self.bdev.device_list = DeviceList::try_from(devices)?;
        Ok(self)
    }

    pub fn with_file_size(mut self, gib: u64) -> Self {
        self.bdev.file_size = gib;
        self
    }

    pub fn with_bus_id_range(mut self, range: BusRange) -> Self {
        self.bdev.bus_id_range = Some(range);
        self
    }

    pub fn with_roles(mut self, roles: BdevRoles) -> Self {
        self.bdev.roles = roles;
        self
    }

    pub fn is_scm(&self) -> bool {
        self.class.is_scm()
    }

    pub fn is_bdev(&self) -> bool {
        !self.class.is_scm()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let class_devices = |requirement| ConfigError::ClassDevices {
            tier: self.tier,
            class: self.class,
            requirement,
        };
        let list = &self.bdev.device_list;
        match self.class.bdev_class() {
            BdevClass::None => Ok(()),
            BdevClass::Nvme => match list {
                DeviceList::Pci(_) => Ok(()),
                DeviceList::Paths(_) => Err(class_devices("PCI addresses")),
            },
            BdevClass::File => {
                if list.pci().is_some() && !list.is_empty() {
                    return Err(class_devices("file paths"));
                }
                if list.is_empty() {
                    return Err(class_devices("at least one file path"));
                }
                if self.bdev.file_size == 0 {
                    return Err(ConfigError::FileSize(self.tier));
                }
                Ok(())
            }
            BdevClass::Kdev => {
                if list.pci().is_some() {
                    return Err(class_devices("at least one device path"));
                }
                Ok(())
            }
        }
    }
}

/// The ordered list of storage tiers for one engine.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<TierConfig>", into = "Vec<TierConfig>")]
pub struct TierConfigs(Vec<TierConfig>);

impl From<Vec<TierConfig>> for TierConfigs {
    fn from(tiers: Vec<TierConfig>) -> Self {
        Self::new(tiers)
    }
}

impl From<TierConfigs> for Vec<TierConfig> {
    fn from(tiers: TierConfigs) -> Self {
        tiers.0
    }
}

impl TierConfigs {
    /// Builds the tier list, numbering tiers by position.
    pub fn new(mut tiers: Vec<TierConfig>) -> Self {
        for (idx, tier) in tiers.iter_mut().enumerate() {
            tier.tier = idx;
        }
        Self(tiers)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TierConfig> {
        self.0.iter()
    }

    /// Mutable access to tier contents. Tier numbering is fixed at
    /// construction and must not be altered through this.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, TierConfig> {
        self.0.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn scm_config(&self) -> Option<&TierConfig> {
        self.0.iter().find(|t| t.is_scm())
    }

    pub fn scm_class(&self) -> Option<ScmClass> {
        self.scm_config().and_then(|t| t.class.scm_class())
    }

    pub fn bdev_configs(&self) -> impl Iterator<Item = &TierConfig> {
        self.0.iter().filter(|t| t.is_bdev())
    }

    pub fn have_bdevs(&self) -> bool {
        self.bdev_configs().any(|t| !t.bdev.device_list.is_empty())
    }

    pub fn have_emulated_bdevs(&self) -> bool {
        self.bdev_configs().any(|t| t.class.bdev_class().is_emulated())
    }

    pub fn have_real_nvme(&self) -> bool {
        self.bdev_configs().any(|t| t.class == Class::Nvme)
    }

    /// Does any bdev tier carry every flag in `role`?
    pub fn has_bdev_role(&self, role: BdevRoles) -> bool {
        self.bdev_configs().any(|t| t.bdev.roles.contains(role))
    }

    pub fn has_roles(&self) -> bool {
        self.bdev_configs().any(|t| !t.bdev.roles.is_empty())
    }

    pub fn vos_env(&self) -> Option<VosEnv> {
        if self.have_real_nvme() {
            Some(VosEnv::Nvme)
        } else if self.have_emulated_bdevs() {
            Some(VosEnv::Aio)
        } else {
            None
        }
    }

    /// Structural checks: one memory tier at index 0, tiers numbered in
    /// order, and device lists that suit each tier's class.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Some(first) = self.0.first() else {
            return Err(ConfigError::ScmTier("no storage tiers configured"));
        };
        if !first.is_scm() {
            return Err(ConfigError::ScmTier("tier 0 must be an scm tier"));
        }
        if self.0.iter().filter(|t| t.is_scm()).count() > 1 {
            return Err(ConfigError::ScmTier("only one scm tier is allowed"));
        }
        for (idx, tier) in self.0.iter().enumerate() {
            if tier.tier != idx {
                return Err(ConfigError::BadTierIndex {
                    expected: idx,
                    found: tier.tier,
                });
            }
            tier.validate()?;
        }
        Ok(())
    }

    /// Assigns roles implicitly when none were configured.
    ///
    /// Returns whether any roles were assigned. Tiers are left untouched when
    /// the memory tier is dcpm or emulated bdevs are in use; a list where only
    /// some tiers carry roles is a fault rather than something to complete.
    pub fn assign_bdev_roles(&mut self) -> Result<bool, ConfigError> {
        let bdev_idxs: Vec<usize> = self
            .0
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_bdev())
            .map(|(i, _)| i)
            .collect();
        if bdev_idxs.is_empty() {
            return Ok(false);
        }
        if self.scm_class() == Some(ScmClass::Dcpm)
            || self.have_emulated_bdevs()
        {
            return Ok(false);
        }

        let with_roles = bdev_idxs
            .iter()
            .filter(|&&i| !self.0[i].bdev.roles.is_empty())
            .count();
        if with_roles == bdev_idxs.len() {
            return Ok(false);
        }
        if with_roles != 0 {
            return Err(ConfigError::RolesMissing);
        }

        for (nth, &idx) in bdev_idxs.iter().enumerate() {
            let roles = match (bdev_idxs.len(), nth) {
                (1, _) => BdevRoles::all(),
                (2, 0) => BdevRoles::WAL,
                (2, _) => BdevRoles::META | BdevRoles::DATA,
                (_, 0) => BdevRoles::WAL,
                (_, 1) => BdevRoles::META,
                (_, _) => BdevRoles::DATA,
            };
            self.0[idx].bdev.roles = roles;
        }
        Ok(true)
    }

    /// Validates the role assignment across all bdev tiers.
    pub fn validate_bdev_roles(&self) -> Result<(), ConfigError> {
        let bdevs: Vec<&TierConfig> = self.bdev_configs().collect();
        let with_roles =
            bdevs.iter().filter(|t| !t.bdev.roles.is_empty()).count();

        if with_roles == 0 {
            if bdevs.len() > 1 {
                return Err(ConfigError::MultipleTiersWithoutRoles);
            }
            return Ok(());
        }

        match self.scm_class() {
            Some(ScmClass::Ram) => {}
            Some(ScmClass::Dcpm) => return Err(ConfigError::RolesWithDcpm),
            None => {
                return Err(ConfigError::ScmTier("no scm tier configured"));
            }
        }
        if with_roles != bdevs.len() {
            return Err(ConfigError::RolesMissing);
        }
        if bdevs.len() > MAX_ROLE_TIERS {
            return Err(ConfigError::TooManyTiers(bdevs.len()));
        }

        for tier in &bdevs {
            let roles = tier.bdev.roles;
            if roles.contains(BdevRoles::WAL | BdevRoles::DATA)
                && !roles.contains(BdevRoles::META)
            {
                return Err(ConfigError::WalDataWithoutMeta(tier.tier));
            }
        }

        for role in [BdevRoles::WAL, BdevRoles::META, BdevRoles::DATA] {
            let count =
                bdevs.iter().filter(|t| t.bdev.roles.contains(role)).count();
            if count != 1 {
                return Err(ConfigError::BadNrRoles {
                    role: BdevRoles::role_name(role),
                    count,
                });
            }
        }
        Ok(())
    }
}
