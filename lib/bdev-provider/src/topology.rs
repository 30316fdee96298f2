// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeMap, BTreeSet};

use bdev_types::BusRange;

/// PCI buses reachable from each NUMA node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NumaTopology {
    buses: BTreeMap<u32, BTreeSet<u8>>,
}

impl NumaTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bus(&mut self, node: u32, bus: u8) {
        self.buses.entry(node).or_default().insert(bus);
    }

    pub fn nodes(&self) -> impl Iterator<Item = u32> + '_ {
        self.buses.keys().copied()
    }

    /// Lowest through highest bus known on `node`.
    pub fn bus_range(&self, node: u32) -> Option<BusRange> {
        let buses = self.buses.get(&node)?;
        let (first, last) = (buses.first()?, buses.last()?);
        BusRange::new(*first, *last).ok()
    }
}
