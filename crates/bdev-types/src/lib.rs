// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types shared by the bdev crates.
//!
//! This crate defines the PCI addressing model (including the VMD backing
//! address encoding) and the fault taxonomy used at the boundary of the
//! provider, such that the configuration crate, the provider library, and the
//! privileged helper can all agree on them without any layering oddities.

mod fault;
mod pci;

pub use fault::{Fault, FaultCode};
pub use pci::{BusRange, PciAddress, PciAddressSet, PciError};
