// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use bdev_types::{Fault, FaultCode, PciError};
use thiserror::Error;

use crate::Class;

/// Faults detected while validating storage tier configuration. All of them
/// are fatal to startup; nothing here is repaired automatically.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unrecognized bdev role {0:?}")]
    UnknownRole(String),

    #[error("bdev_list mixes PCI addresses and non-PCI paths: {0:?}")]
    MixedDeviceList(Vec<String>),

    #[error("bdev_list contains duplicate pci addresses: {0:?}")]
    DuplicateDevices(Vec<String>),

    #[error(transparent)]
    Pci(#[from] PciError),

    #[error("storage tier at position {expected} has index {found}")]
    BadTierIndex { expected: usize, found: usize },

    #[error("invalid scm tier layout: {0}")]
    ScmTier(&'static str),

    #[error("tier {tier}: class {class} requires {requirement}")]
    ClassDevices { tier: usize, class: Class, requirement: &'static str },

    #[error("tier {0}: file class requires a non-zero bdev_size")]
    FileSize(usize),

    #[error("multiple bdev tiers without roles")]
    MultipleTiersWithoutRoles,

    #[error("bdev roles missing on some tiers")]
    RolesMissing,

    #[error("bdev roles cannot be assigned when the scm tier class is dcpm")]
    RolesWithDcpm,

    #[error("{0} bdev tiers with roles, at most 3 are supported")]
    TooManyTiers(usize),

    #[error("{role} role assigned to {count} tiers, expected exactly 1")]
    BadNrRoles { role: &'static str, count: usize },

    #[error("tier {0}: wal and data roles assigned without meta")]
    WalDataWithoutMeta(usize),

    #[error("meta role assigned but no control metadata path is configured")]
    ControlMetadataMissing,

    #[error("control metadata path configured but no tier has the meta role")]
    ControlMetadataWithoutRoles,
}

impl ConfigError {
    pub fn code(&self) -> FaultCode {
        match self {
            ConfigError::UnknownRole(_) => FaultCode::BdevConfigUnknownRole,
            ConfigError::MixedDeviceList(_) => {
                FaultCode::BdevConfigMixedDeviceList
            }
            ConfigError::DuplicateDevices(_) => {
                FaultCode::BdevConfigDuplicateDevices
            }
            ConfigError::Pci(PciError::BadBusRange { .. }) => {
                FaultCode::BusRangeInvalid
            }
            ConfigError::Pci(_) => FaultCode::PciAddressMalformed,
            ConfigError::BadTierIndex { .. } => {
                FaultCode::BdevConfigBadTierIndex
            }
            ConfigError::ScmTier(_) => FaultCode::BdevConfigScmTier,
            ConfigError::ClassDevices { .. } => {
                FaultCode::BdevConfigClassDevices
            }
            ConfigError::FileSize(_) => FaultCode::BdevConfigFileSize,
            ConfigError::MultipleTiersWithoutRoles => {
                FaultCode::BdevConfigMultiTierWithoutRoles
            }
            ConfigError::RolesMissing => FaultCode::BdevConfigRolesMissing,
            ConfigError::RolesWithDcpm => FaultCode::BdevConfigRolesWithDcpm,
            ConfigError::TooManyTiers(_) => FaultCode::BdevConfigTooManyTiers,
            ConfigError::BadNrRoles { .. } => FaultCode::BdevConfigBadNrRoles,
            ConfigError::WalDataWithoutMeta(_) => {
                FaultCode::BdevConfigRolesWalDataNoMeta
            }
            ConfigError::ControlMetadataMissing => {
                FaultCode::BdevConfigControlMetadataMissing
            }
            ConfigError::ControlMetadataWithoutRoles => {
                FaultCode::BdevConfigControlMetadataNoRoles
            }
        }
    }

    pub fn resolution(&self) -> &'static str {
        match self {
            ConfigError::UnknownRole(_) => {
                "use only the roles wal, meta and data in bdev_roles"
            }
            ConfigError::MixedDeviceList(_) => {
                "list either PCI addresses or file/device paths in \
                 bdev_list, not both"
            }
            ConfigError::DuplicateDevices(_) => {
                "remove the duplicate entries from bdev_list"
            }
            ConfigError::Pci(_) => {
                "use the DDDD:BB:DD.F address format and 0xBEGIN-0xEND bus \
                 ranges"
            }
            ConfigError::BadTierIndex { .. } => {
                "list storage tiers in order, starting at tier 0"
            }
            ConfigError::ScmTier(_) => {
                "configure exactly one ram or dcpm tier as the first \
                 storage tier"
            }
            ConfigError::ClassDevices { .. } => {
                "use PCI addresses for nvme tiers and paths for file or \
                 kdev tiers"
            }
            ConfigError::FileSize(_) => {
                "set bdev_size for each file class tier"
            }
            ConfigError::MultipleTiersWithoutRoles => {
                "assign bdev_roles to every bdev tier or configure a single \
                 bdev tier"
            }
            ConfigError::RolesMissing => {
                "assign bdev_roles to every bdev tier or to none of them"
            }
            ConfigError::RolesWithDcpm => {
                "use a ram scm tier to enable bdev roles, or remove bdev_roles"
            }
            ConfigError::TooManyTiers(_) => {
                "reduce the number of bdev tiers to 3 or fewer"
            }
            ConfigError::BadNrRoles { .. } => {
                "assign each of the wal, meta and data roles to exactly one \
                 tier"
            }
            ConfigError::WalDataWithoutMeta(_) => {
                "add the meta role to any tier that has both wal and data roles"
            }
            ConfigError::ControlMetadataMissing => {
                "set control_metadata.path when a tier carries the meta role"
            }
            ConfigError::ControlMetadataWithoutRoles => {
                "assign the meta role to a bdev tier or remove \
                 control_metadata.path"
            }
        }
    }

    pub fn to_fault(&self) -> Fault {
        Fault::new(self.code(), self.to_string(), self.resolution())
    }
}

impl From<ConfigError> for Fault {
    fn from(err: ConfigError) -> Self {
        err.to_fault()
    }
}
