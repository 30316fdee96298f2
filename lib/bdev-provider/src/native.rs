// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boundary to the native NVMe acceleration library.
//!
//! Every call blocks. The library environment must be initialized before
//! discovery, format or update, and finalized afterward.

use std::path::Path;

use bdev_types::{PciAddress, PciAddressSet};

use crate::controller::Controller;

/// Scope of a library environment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvOptions {
    /// Devices the library may claim; empty means all.
    pub pci_allowlist: PciAddressSet,
    pub enable_vmd: bool,
}

/// Outcome of formatting a single namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceFormat {
    pub ctrlr: PciAddress,
    pub ns_id: u32,
    pub error: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
pub trait Nvme: Send + Sync {
    fn init(&self, opts: &EnvOptions) -> anyhow::Result<()>;

    fn fini(&self);

    fn discover(&self) -> anyhow::Result<Vec<Controller>>;

    /// Formats every namespace of the controllers at `addrs`.
    fn format(
        &self,
        addrs: &PciAddressSet,
    ) -> anyhow::Result<Vec<NamespaceFormat>>;

    fn update(
        &self,
        addr: &PciAddress,
        image: &Path,
        slot: u32,
    ) -> anyhow::Result<()>;
}

/// Holds an initialized library environment, finalizing it when dropped so
/// that every exit path releases it.
pub(crate) struct EnvGuard<'a> {
    nvme: &'a dyn Nvme,
}

impl<'a> EnvGuard<'a> {
    pub(crate) fn init(
        nvme: &'a dyn Nvme,
        opts: &EnvOptions,
    ) -> anyhow::Result<Self> {
        nvme.init(opts)?;
        Ok(Self { nvme })
    }
}

impl Drop for EnvGuard<'_> {
    fn drop(&mut self) {
        self.nvme.fini();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn guard_finalizes_once() {
        let mut nvme = MockNvme::new();
        nvme.expect_init().times(1).returning(|_| Ok(()));
        nvme.expect_fini().times(1).return_const(());

        let guard = EnvGuard::init(&nvme, &EnvOptions::default()).unwrap();
        drop(guard);
        nvme.checkpoint();
    }

    #[test]
    fn failed_init_skips_fini() {
        let mut nvme = MockNvme::new();
        nvme.expect_init()
            .returning(|_| Err(anyhow::anyhow!("no hugepages")));
        nvme.expect_fini().never();

        assert!(EnvGuard::init(&nvme, &EnvOptions::default()).is_err());
    }
}
