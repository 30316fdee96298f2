// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Discovery, provisioning and configuration of the NVMe devices backing
//! an engine's bdev tiers.
//!
//! [Provider] is the entry point. It drives a [Backend]: either the one
//! built on the native acceleration library ([spdk::SpdkBackend]), the
//! in-memory [mock::MockBackend], or [forward::ForwardingBackend], which
//! hands mutating requests to a privileged helper.

#![allow(clippy::style)]

use bdev_config::ConfigError;
use bdev_types::{Fault, FaultCode};

pub mod backend;
pub mod controller;
pub mod forward;
pub mod hugepages;
pub mod mock;
pub mod native;
pub mod provider;
pub mod script;
pub mod spdk;
pub mod spdk_config;
pub mod sysfs;
pub mod topology;
pub mod vmd;

pub use backend::Backend;
pub use controller::{Controller, Controllers};
pub use provider::Provider;

use forward::ForwardError;
use hugepages::HugepageError;
use script::ScriptError;
use spdk_config::SpdkConfigError;
use vmd::VmdError;

/// Native library operations, as named in error context.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum NativeOp {
    Init,
    Discover,
    Format,
    FirmwareUpdate,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Fault(#[from] Fault),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    SpdkConfig(#[from] SpdkConfigError),

    #[error(transparent)]
    Vmd(#[from] VmdError),

    #[error(transparent)]
    Hugepage(#[from] HugepageError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error("{op} on {target}: {err:#}")]
    Native { op: NativeOp, target: String, err: anyhow::Error },
}

impl Error {
    pub(crate) fn native(
        op: NativeOp,
        target: impl ToString,
        err: anyhow::Error,
    ) -> Self {
        Error::Native { op, target: target.to_string(), err }
    }

    /// The fault reported at the provider boundary.
    pub fn to_fault(&self) -> Fault {
        match self {
            Error::Fault(f) => f.clone(),
            Error::Config(e) => e.to_fault(),
            Error::SpdkConfig(e) => e.to_fault(),
            Error::Vmd(e) => e.to_fault(),
            Error::Hugepage(_) => Fault::new(
                FaultCode::BdevPrepareFailure,
                self.to_string(),
                "check ownership and permissions of the hugepage directory",
            ),
            Error::Script(_) => Fault::new(
                FaultCode::BdevPrepareFailure,
                self.to_string(),
                "check that the IOMMU is enabled and that the vfio-pci or \
                 uio_pci_generic module is loaded",
            ),
            Error::Forward(e) => e.to_fault(),
            Error::Native { op: NativeOp::FirmwareUpdate, .. } => Fault::new(
                FaultCode::BdevFirmwareUpdateFailure,
                self.to_string(),
                "check the firmware image and slot against the device \
                 vendor's documentation",
            ),
            Error::Native { .. } => Fault::unknown(self.to_string()),
        }
    }
}

impl From<Error> for Fault {
    fn from(err: Error) -> Self {
        err.to_fault()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn native_errors_carry_context() {
        let err = Error::native(
            NativeOp::Discover,
            "0000:81:00.0",
            anyhow::anyhow!("probe failed").context("spdk_nvme_probe"),
        );
        assert_eq!(
            err.to_string(),
            "discover on 0000:81:00.0: spdk_nvme_probe: probe failed"
        );
        assert_eq!(err.to_fault().code, FaultCode::Unknown);

        let err = Error::native(
            NativeOp::FirmwareUpdate,
            "0000:81:00.0",
            anyhow::anyhow!("bad image"),
        );
        assert_eq!(err.to_fault().code, FaultCode::BdevFirmwareUpdateFailure);
    }

    #[test]
    fn faults_pass_through() {
        let f = Fault::new(FaultCode::BdevNoAddress, "no address", "give one");
        assert_eq!(Error::from(f.clone()).to_fault(), f);
        assert_eq!(
            Error::from(ConfigError::RolesMissing).to_fault().code,
            FaultCode::BdevConfigRolesMissing
        );
    }
}
