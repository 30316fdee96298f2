// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use bitflags::bitflags;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::ConfigError;

bitflags! {
    /// Functional roles a bdev tier serves under MD-on-SSD.
    ///
    /// The numeric values are embedded in generated device names and must
    /// stay stable.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BdevRoles: u16 {
        const DATA = 1 << 0;
        const META = 1 << 1;
        const WAL = 1 << 2;
    }
}

const ROLE_NAMES: [(BdevRoles, &str); 3] = [
    (BdevRoles::WAL, "wal"),
    (BdevRoles::META, "meta"),
    (BdevRoles::DATA, "data"),
];

impl BdevRoles {
    /// Name of a single role flag, as used in configuration and faults.
    pub fn role_name(role: BdevRoles) -> &'static str {
        ROLE_NAMES
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, n)| *n)
            .unwrap_or("unknown")
    }

    pub fn names(&self) -> Vec<&'static str> {
        ROLE_NAMES
            .iter()
            .filter(|(r, _)| self.contains(*r))
            .map(|(_, n)| *n)
            .collect()
    }
}

impl Display for BdevRoles {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.names().join(","))
    }
}

impl FromStr for BdevRoles {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut roles = BdevRoles::empty();
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let lower = name.to_ascii_lowercase();
            let Some((role, _)) = ROLE_NAMES.iter().find(|(_, n)| *n == lower)
            else {
                return Err(ConfigError::UnknownRole(name.to_string()));
            };
            roles |= *role;
        }
        Ok(roles)
    }
}

impl Serialize for BdevRoles {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(self.names())
    }
}

impl<'d> Deserialize<'d> for BdevRoles {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let names = Vec::<String>::deserialize(deserializer)?;
        BdevRoles::from_str(&names.join(",")).map_err(de::Error::custom)
    }
}
