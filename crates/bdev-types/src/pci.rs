// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::btree_set;
use std::collections::BTreeSet;
use std::fmt::Result as FmtResult;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const MASK_DEV: u8 = 0x1f;
const MASK_FUNC: u8 = 0x7;

/// Hex digits in a canonical PCI domain.
const DOMAIN_DIGITS: usize = 4;
/// Hex digits in a VMD backing domain, which packs the owning endpoint's
/// bus, device and function into what would otherwise be the domain field.
const VMD_DOMAIN_DIGITS: usize = 6;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PciError {
    #[error("malformed PCI address {addr:?}: {reason}")]
    Malformed { addr: String, reason: String },

    #[error("{0} is not a VMD backing address")]
    NotVmdBackingAddress(PciAddress),

    #[error("invalid PCI bus range {range:?}: {reason}")]
    BadBusRange { range: String, reason: String },
}

/// Domain, Bus, Device, Function.
///
/// Addresses are totally ordered by tuple comparison and formatted as
/// `DDDD:BB:DD.F`. A VMD backing address carries a six digit domain
/// (`5d0505:01:00.0`) naming the bus/device/function of the VMD endpoint it
/// sits behind; it is recognized by that domain width alone.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd, Hash)]
pub struct PciAddress {
    domain: u32,
    bus: u8,
    device: u8,
    function: u8,
}

impl PciAddress {
    /// Attempts to make a new canonical (non-VMD) [PciAddress].
    pub fn new(
        domain: u16,
        bus: u8,
        device: u8,
        function: u8,
    ) -> Result<Self, PciError> {
        if device > MASK_DEV || function > MASK_FUNC {
            return Err(PciError::Malformed {
                addr: format!(
                    "{:04x}:{:02x}:{:02x}.{:x}",
                    domain, bus, device, function
                ),
                reason: "device or function out of range".to_string(),
            });
        }
        Ok(Self { domain: domain as u32, bus, device, function })
    }

    /// Builds the address of a device behind the VMD endpoint `endpoint`,
    /// located at `bus:device.function` inside the VMD domain.
    pub fn vmd_backing(
        endpoint: &PciAddress,
        bus: u8,
        device: u8,
        function: u8,
    ) -> Result<Self, PciError> {
        if endpoint.is_vmd_backing_address() || endpoint.domain != 0 {
            return Err(PciError::Malformed {
                addr: endpoint.to_string(),
                reason: "VMD endpoint must be in domain 0000".to_string(),
            });
        }
        if endpoint.bus == 0 {
            return Err(PciError::Malformed {
                addr: endpoint.to_string(),
                reason: "VMD endpoint cannot sit on bus 00".to_string(),
            });
        }
        let backing = Self::new(0, bus, device, function)?;
        Ok(Self {
            domain: Self::pack_endpoint(endpoint),
            bus: backing.bus,
            device: backing.device,
            function: backing.function,
        })
    }

    #[inline]
    pub fn domain(&self) -> u32 {
        self.domain
    }

    #[inline]
    pub fn bus(&self) -> u8 {
        self.bus
    }

    #[inline]
    pub fn device(&self) -> u8 {
        self.device
    }

    #[inline]
    pub fn function(&self) -> u8 {
        self.function
    }

    /// Does the domain field encode a VMD endpoint rather than a PCI domain?
    pub fn is_vmd_backing_address(&self) -> bool {
        self.domain > u16::MAX as u32
    }

    /// Reinterprets the domain of a backing address as the bus, device and
    /// function of its VMD endpoint, yielding the endpoint's canonical
    /// address in domain `0000`.
    pub fn backing_to_vmd_address(&self) -> Result<PciAddress, PciError> {
        if !self.is_vmd_backing_address() {
            return Err(PciError::NotVmdBackingAddress(*self));
        }
        Ok(Self {
            domain: 0,
            bus: (self.domain >> 16) as u8,
            device: (self.domain >> 8) as u8,
            function: self.domain as u8,
        })
    }

    fn pack_endpoint(endpoint: &PciAddress) -> u32 {
        (endpoint.bus as u32) << 16
            | (endpoint.device as u32) << 8
            | endpoint.function as u32
    }
}

fn hex_field(field: &str, digits: &[usize], what: &str) -> Result<u32, String> {
    if !digits.contains(&field.len()) {
        return Err(format!("{what} field {field:?} has the wrong width"));
    }
    if !field.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("{what} field {field:?} is not hexadecimal"));
    }
    u32::from_str_radix(field, 16).map_err(|e| e.to_string())
}

impl FromStr for PciAddress {
    type Err = PciError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: String| PciError::Malformed {
            addr: s.to_string(),
            reason,
        };

        let mut fields = s.split(':');
        let (Some(domain), Some(bus), Some(devfn), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed("expected DDDD:BB:DD.F".to_string()));
        };
        let Some((device, function)) = devfn.split_once('.') else {
            return Err(malformed("missing function separator".to_string()));
        };

        let vmd_domain = domain.len() == VMD_DOMAIN_DIGITS;
        let domain =
            hex_field(domain, &[DOMAIN_DIGITS, VMD_DOMAIN_DIGITS], "domain")
                .map_err(malformed)?;
        let bus = hex_field(bus, &[2], "bus").map_err(malformed)? as u8;
        let device =
            hex_field(device, &[2], "device").map_err(malformed)? as u8;
        let function =
            hex_field(function, &[1], "function").map_err(malformed)? as u8;

        let addr = Self::new(0, bus, device, function)
            .map_err(|_| malformed("device or function out of range".into()))?;

        if !vmd_domain {
            return Ok(Self { domain, ..addr });
        }

        // The packed endpoint must itself be a sane address.
        let endpoint = Self::new(
            0,
            (domain >> 16) as u8,
            (domain >> 8) as u8,
            domain as u8,
        )
        .map_err(|_| malformed("VMD domain names an invalid endpoint".into()))?;
        if endpoint.bus == 0 {
            return Err(malformed(
                "VMD domain names an endpoint on bus 00".to_string(),
            ));
        }
        Ok(Self { domain, ..addr })
    }
}

impl Display for PciAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        if self.is_vmd_backing_address() {
            write!(f, "{:06x}", self.domain)?;
        } else {
            write!(f, "{:04x}", self.domain)?;
        }
        write!(f, ":{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

impl Serialize for PciAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

impl<'d> Deserialize<'d> for PciAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

/// An ordered, deduplicated collection of [PciAddress]es.
#[derive(Clone, Default, Eq, PartialEq, Debug, Hash)]
pub struct PciAddressSet(BTreeSet<PciAddress>);

impl PciAddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses every string in `addrs`, failing on the first malformed one.
    pub fn from_strs<I, S>(addrs: I) -> Result<Self, PciError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        addrs
            .into_iter()
            .map(|a| PciAddress::from_str(a.as_ref().trim()))
            .collect()
    }

    /// Returns true if the address was not already present.
    pub fn add(&mut self, addr: PciAddress) -> bool {
        self.0.insert(addr)
    }

    pub fn remove(&mut self, addr: &PciAddress) -> bool {
        self.0.remove(addr)
    }

    pub fn contains(&self, addr: &PciAddress) -> bool {
        self.0.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&PciAddress> {
        self.0.first()
    }

    pub fn iter(&self) -> btree_set::Iter<'_, PciAddress> {
        self.0.iter()
    }

    pub fn union(&self, other: &PciAddressSet) -> PciAddressSet {
        self.0.union(&other.0).copied().collect()
    }

    pub fn intersection(&self, other: &PciAddressSet) -> PciAddressSet {
        self.0.intersection(&other.0).copied().collect()
    }

    pub fn difference(&self, other: &PciAddressSet) -> PciAddressSet {
        self.0.difference(&other.0).copied().collect()
    }

    pub fn has_vmd_backing(&self) -> bool {
        self.0.iter().any(PciAddress::is_vmd_backing_address)
    }

    /// Replaces every VMD backing address with the address of its endpoint,
    /// leaving the rest untouched. Used to normalize allow and block lists
    /// before they are compared against endpoint addresses.
    pub fn backing_to_vmd_addresses(&self) -> PciAddressSet {
        self.0
            .iter()
            .map(|a| a.backing_to_vmd_address().unwrap_or(*a))
            .collect()
    }

    pub fn strings(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }
}

impl FromIterator<PciAddress> for PciAddressSet {
    fn from_iter<T: IntoIterator<Item = PciAddress>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<PciAddress> for PciAddressSet {
    fn extend<T: IntoIterator<Item = PciAddress>>(&mut self, iter: T) {
        self.0.extend(iter)
    }
}

impl<'a> IntoIterator for &'a PciAddressSet {
    type Item = &'a PciAddress;
    type IntoIter = btree_set::Iter<'a, PciAddress>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for PciAddressSet {
    type Item = PciAddress;
    type IntoIter = btree_set::IntoIter<PciAddress>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Display for PciAddressSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.strings().join(" "))
    }
}

/// Accepts whitespace and/or comma separated addresses.
impl FromStr for PciAddressSet {
    type Err = PciError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_strs(
            s.split(|c: char| c == ',' || c.is_whitespace())
                .filter(|f| !f.is_empty()),
        )
    }
}

impl Serialize for PciAddressSet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(self.0.iter())
    }
}

impl<'d> Deserialize<'d> for PciAddressSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let addrs = Vec::<String>::deserialize(deserializer)?;
        Self::from_strs(addrs).map_err(de::Error::custom)
    }
}

/// An inclusive range of PCI bus numbers.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct BusRange {
    begin: u8,
    end: u8,
}

impl BusRange {
    /// Every bus number a PCI bus field can hold.
    pub const FULL: BusRange = BusRange { begin: 0x00, end: 0xff };

    pub fn new(begin: u8, end: u8) -> Result<Self, PciError> {
        if begin > end {
            return Err(PciError::BadBusRange {
                range: format!("{begin:#04x}-{end:#04x}"),
                reason: "begin is greater than end".to_string(),
            });
        }
        Ok(Self { begin, end })
    }

    pub fn begin(&self) -> u8 {
        self.begin
    }

    pub fn end(&self) -> u8 {
        self.end
    }

    pub fn contains(&self, bus: u8) -> bool {
        (self.begin..=self.end).contains(&bus)
    }
}

impl FromStr for BusRange {
    type Err = PciError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |reason: String| PciError::BadBusRange {
            range: s.to_string(),
            reason,
        };
        let bound = |b: &str| -> Result<u8, PciError> {
            let b = b.trim();
            let num = match b.strip_prefix("0x").or(b.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => b.parse::<u64>(),
            }
            .map_err(|e| bad(format!("bound {b:?}: {e}")))?;
            u8::try_from(num).map_err(|_| {
                bad(format!("bound {b:?} exceeds the 8-bit PCI bus field"))
            })
        };

        let Some((begin, end)) = s.split_once('-') else {
            return Err(bad("expected <begin>-<end>".to_string()));
        };
        let (begin, end) = (bound(begin)?, bound(end)?);
        if begin > end {
            return Err(bad("begin is greater than end".to_string()));
        }
        Ok(Self { begin, end })
    }
}

impl Display for BusRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{:#04x}-{:#04x}", self.begin, self.end)
    }
}

impl Serialize for BusRange {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

impl<'d> Deserialize<'d> for BusRange {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}
