// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Translation between VMD endpoints and the devices behind them.
//!
//! Administrators name a VMD endpoint (`0000:5d:05.5`); the acceleration
//! library addresses the backing devices (`5d0505:01:00.0`). An endpoint
//! alone cannot be expanded, so expansion always goes through a live
//! inventory of discovered addresses.

use bdev_types::{Fault, FaultCode, PciAddress, PciAddressSet};
use thiserror::Error;

use crate::controller::Controllers;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum VmdError {
    #[error("requested controllers not found: {0}")]
    ControllersNotFound(PciAddressSet),

    #[error("no backing devices found behind VMD endpoints {0}")]
    NoBackingDevices(PciAddressSet),
}

impl VmdError {
    pub fn to_fault(&self) -> Fault {
        match self {
            VmdError::ControllersNotFound(_) => Fault::new(
                FaultCode::BdevNotFound,
                self.to_string(),
                "check the configured addresses against the scan output and \
                 that the devices are bound to a user-space driver",
            ),
            VmdError::NoBackingDevices(_) => Fault::new(
                FaultCode::BdevVmdNoBackingDevices,
                self.to_string(),
                "check that SSDs are inserted behind the VMD endpoint and \
                 that VMD is enabled in the BIOS",
            ),
        }
    }
}

/// Backing devices in `inventory` that sit behind `endpoint`.
pub fn backing_devices(
    endpoint: &PciAddress,
    inventory: &PciAddressSet,
) -> PciAddressSet {
    inventory
        .iter()
        .filter(|a| a.backing_to_vmd_address().ok().as_ref() == Some(endpoint))
        .copied()
        .collect()
}

/// Expands every endpoint in `targets` to its known backing devices.
///
/// Endpoints with nothing discovered behind them, and addresses that are
/// not endpoints at all, pass through unchanged.
pub fn substitute_vmd_addresses(
    targets: &PciAddressSet,
    inventory: &PciAddressSet,
) -> PciAddressSet {
    let mut out = PciAddressSet::new();
    for addr in targets {
        let backing = backing_devices(addr, inventory);
        if backing.is_empty() {
            out.add(*addr);
        } else {
            out.extend(backing);
        }
    }
    out
}

/// Applies allow and block lists to VMD endpoint candidates.
///
/// Either list may name backing devices, which stand in for their
/// endpoints. An empty allow list allows everything. An empty result means
/// VMD should not be used for this request.
pub fn filter_vmd_candidates(
    candidates: &PciAddressSet,
    allowed: &PciAddressSet,
    blocked: &PciAddressSet,
) -> PciAddressSet {
    let allowed = allowed.backing_to_vmd_addresses();
    let blocked = blocked.backing_to_vmd_addresses();

    let kept = if allowed.is_empty() {
        candidates.clone()
    } else {
        candidates.intersection(&allowed)
    };
    kept.difference(&blocked)
}

/// Restricts a scan result to what was asked for.
///
/// An empty request keeps everything. A requested endpoint keeps all of its
/// backing devices; when VMD is enabled an endpoint with none is reported
/// missing. Every missing address is reported in one error.
pub fn groom_discovered(
    requested: &PciAddressSet,
    discovered: Controllers,
    vmd_enabled: bool,
) -> Result<Controllers, VmdError> {
    if requested.is_empty() {
        return Ok(discovered);
    }

    let found = discovered.addresses();
    let mut wanted = PciAddressSet::new();
    let mut missing = PciAddressSet::new();
    for addr in requested {
        let backing = if vmd_enabled {
            backing_devices(addr, &found)
        } else {
            PciAddressSet::new()
        };
        if !backing.is_empty() {
            wanted.extend(backing);
        } else if found.contains(addr) {
            wanted.add(*addr);
        } else {
            missing.add(*addr);
        }
    }
    if !missing.is_empty() {
        return Err(VmdError::ControllersNotFound(missing));
    }

    Ok(discovered
        .into_iter()
        .filter(|c| wanted.contains(&c.pci_addr))
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::controller::Controller;
    use proptest::prelude::*;

    fn set(s: &str) -> PciAddressSet {
        s.parse().unwrap()
    }

    fn ctrlrs(s: &str) -> Controllers {
        set(s).into_iter().map(Controller::new).collect()
    }

    #[test]
    fn endpoint_expands_to_backing_devices() {
        let inventory = set("5d0505:01:00.0 5d0505:03:00.0 d70505:01:00.0");
        let targets = set("0000:5d:05.5");
        assert_eq!(
            substitute_vmd_addresses(&targets, &inventory),
            set("5d0505:01:00.0 5d0505:03:00.0")
        );
    }

    #[test]
    fn substitution_passes_through_unknowns() {
        let inventory = set("5d0505:01:00.0 0000:81:00.0");
        let targets = set("0000:81:00.0 0000:d7:05.5 5d0505:01:00.0");
        assert_eq!(substitute_vmd_addresses(&targets, &inventory), targets);
    }

    #[test]
    fn candidate_filtering() {
        let candidates = set("0000:5d:05.5 0000:85:05.5 0000:d7:05.5");

        assert_eq!(
            filter_vmd_candidates(&candidates, &set(""), &set("")),
            candidates
        );
        assert_eq!(
            filter_vmd_candidates(
                &candidates,
                &set("5d0505:01:00.0 0000:85:05.5"),
                &set("")
            ),
            set("0000:5d:05.5 0000:85:05.5")
        );
        assert_eq!(
            filter_vmd_candidates(
                &candidates,
                &set(""),
                &set("d70505:03:00.0")
            ),
            set("0000:5d:05.5 0000:85:05.5")
        );
        assert!(filter_vmd_candidates(
            &candidates,
            &set("0000:81:00.0"),
            &set("")
        )
        .is_empty());
    }

    #[test]
    fn grooming_keeps_requested() {
        let discovered =
            ctrlrs("0000:81:00.0 0000:82:00.0 5d0505:01:00.0 5d0505:03:00.0");

        let all = groom_discovered(&set(""), discovered.clone(), true).unwrap();
        assert_eq!(all.len(), 4);

        let some = groom_discovered(
            &set("0000:5d:05.5 0000:82:00.0"),
            discovered.clone(),
            true,
        )
        .unwrap();
        assert_eq!(
            some.addresses(),
            set("0000:82:00.0 5d0505:01:00.0 5d0505:03:00.0")
        );

        let no_vmd =
            groom_discovered(&set("0000:5d:05.5"), discovered.clone(), false);
        assert_eq!(
            no_vmd,
            Err(VmdError::ControllersNotFound(set("0000:5d:05.5")))
        );
    }

    #[test]
    fn grooming_collects_all_missing() {
        let discovered = ctrlrs("0000:81:00.0 5d0505:01:00.0");
        let err = groom_discovered(
            &set("0000:81:00.0 0000:83:00.0 0000:d7:05.5"),
            discovered,
            true,
        )
        .unwrap_err();
        assert_eq!(
            err,
            VmdError::ControllersNotFound(set("0000:83:00.0 0000:d7:05.5"))
        );
        assert_eq!(err.to_fault().code, FaultCode::BdevNotFound);
    }

    proptest! {
        #[test]
        fn substitution_reverses_to_endpoint(
            ep_bus in 1u8..=255,
            ep_dev in 0u8..32,
            ep_func in 0u8..8,
            buses in proptest::collection::btree_set(0u8..=255, 1..8),
        ) {
            let endpoint = PciAddress::new(0, ep_bus, ep_dev, ep_func).unwrap();
            let inventory: PciAddressSet = buses
                .iter()
                .map(|b| PciAddress::vmd_backing(&endpoint, *b, 0, 0).unwrap())
                .collect();

            let targets: PciAddressSet = [endpoint].into_iter().collect();
            let expanded = substitute_vmd_addresses(&targets, &inventory);
            prop_assert_eq!(&expanded, &inventory);
            prop_assert_eq!(expanded.backing_to_vmd_addresses(), targets);
        }
    }
}
