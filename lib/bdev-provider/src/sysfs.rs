// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device discovery from the kernel's PCI sysfs tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bdev_types::{PciAddress, PciAddressSet};

use crate::topology::NumaTopology;

const PCI_DEVICES: &str = "bus/pci/devices";

const VENDOR_INTEL: u16 = 0x8086;

/// Device ids of Intel VMD endpoints.
const VMD_DEVICE_IDS: [u16; 7] =
    [0x201d, 0x28c0, 0x467f, 0x4c3d, 0x7d0b, 0x9a0b, 0xad0b];

/// A single function under `bus/pci/devices`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SysfsDevice {
    pub addr: PciAddress,
    pub vendor: u16,
    pub device: u16,
    /// `None` when the platform reports no affinity.
    pub numa_node: Option<u32>,
}

impl SysfsDevice {
    fn load(dir: &Path, addr: PciAddress) -> io::Result<Self> {
        Ok(Self {
            addr,
            vendor: read_hex_u16(&dir.join("vendor"))?,
            device: read_hex_u16(&dir.join("device"))?,
            numa_node: read_numa_node(&dir.join("numa_node")),
        })
    }

    pub fn is_vmd_endpoint(&self) -> bool {
        self.vendor == VENDOR_INTEL && VMD_DEVICE_IDS.contains(&self.device)
    }
}

fn read_hex_u16(path: &Path) -> io::Result<u16> {
    let raw = fs::read_to_string(path)?;
    let raw = raw.trim();
    u16::from_str_radix(raw.trim_start_matches("0x"), 16).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: {raw:?}: {e}", path.display()),
        )
    })
}

fn read_numa_node(path: &Path) -> Option<u32> {
    // The kernel reports -1 when the device has no affinity.
    fs::read_to_string(path).ok()?.trim().parse::<u32>().ok()
}

/// Enumerates the PCI functions visible under `sysfs_root`.
///
/// Entries whose names are not PCI addresses, or whose attributes cannot be
/// read, are skipped.
pub fn pci_devices(sysfs_root: &Path) -> io::Result<Vec<SysfsDevice>> {
    let dir: PathBuf = sysfs_root.join(PCI_DEVICES);
    let mut devices = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(addr) =
            name.to_str().and_then(|n| n.parse::<PciAddress>().ok())
        else {
            continue;
        };
        if let Ok(dev) = SysfsDevice::load(&entry.path(), addr) {
            devices.push(dev);
        }
    }
    devices.sort_by_key(|d| d.addr);
    Ok(devices)
}

/// VMD endpoints present on the host.
pub fn vmd_endpoints(sysfs_root: &Path) -> io::Result<PciAddressSet> {
    Ok(pci_devices(sysfs_root)?
        .into_iter()
        .filter(SysfsDevice::is_vmd_endpoint)
        .map(|d| d.addr)
        .collect())
}

/// NUMA node to PCI bus mapping. Devices without affinity are counted
/// against node 0.
pub fn numa_topology(sysfs_root: &Path) -> io::Result<NumaTopology> {
    let mut topo = NumaTopology::new();
    for dev in pci_devices(sysfs_root)? {
        if dev.addr.is_vmd_backing_address() {
            continue;
        }
        topo.add_bus(dev.numa_node.unwrap_or(0), dev.addr.bus());
    }
    Ok(topo)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use bdev_types::BusRange;

    pub(crate) fn add_device(
        root: &Path,
        addr: &str,
        vendor: &str,
        device: &str,
        numa: &str,
    ) {
        let dir = root.join(PCI_DEVICES).join(addr);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), format!("{vendor}\n")).unwrap();
        fs::write(dir.join("device"), format!("{device}\n")).unwrap();
        fs::write(dir.join("numa_node"), format!("{numa}\n")).unwrap();
    }

    #[test]
    fn finds_vmd_endpoints() {
        let root = tempfile::tempdir().unwrap();
        add_device(root.path(), "0000:5d:05.5", "0x8086", "0x201d", "0");
        add_device(root.path(), "0000:d7:05.5", "0x8086", "0x28c0", "1");
        add_device(root.path(), "0000:81:00.0", "0x8086", "0x0a54", "1");
        add_device(root.path(), "0000:82:00.0", "0x144d", "0x201d", "1");
        fs::create_dir_all(root.path().join(PCI_DEVICES).join("not-pci"))
            .unwrap();

        let eps = vmd_endpoints(root.path()).unwrap();
        assert_eq!(eps.to_string(), "0000:5d:05.5 0000:d7:05.5");
    }

    #[test]
    fn numa_topology_from_devices() {
        let root = tempfile::tempdir().unwrap();
        add_device(root.path(), "0000:17:00.0", "0x8086", "0x0a54", "-1");
        add_device(root.path(), "0000:81:00.0", "0x8086", "0x0a54", "1");
        add_device(root.path(), "0000:d8:00.0", "0x8086", "0x0a54", "1");

        let topo = numa_topology(root.path()).unwrap();
        assert_eq!(topo.bus_range(0), Some(BusRange::new(0x17, 0x17).unwrap()));
        assert_eq!(topo.bus_range(1), Some(BusRange::new(0x81, 0xd8).unwrap()));
    }

    #[test]
    fn missing_tree_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        assert!(pci_devices(root.path()).is_err());
    }
}
