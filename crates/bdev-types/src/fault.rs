// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Faults surfaced at the provider boundary.
//!
//! A fault pairs a stable numeric code (which callers and the privileged
//! helper may match on) with a description of what went wrong and a
//! resolution an administrator can act on.

use serde::{Deserialize, Serialize};
use strum::{FromRepr, IntoStaticStr};
use thiserror::Error;

/// Registered fault categories. The numeric values are part of the
/// forwarding wire format and must not be renumbered.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, FromRepr,
    IntoStaticStr,
)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum FaultCode {
    Unknown = 0,

    PciAddressMalformed = 100,
    BusRangeInvalid = 101,

    BdevConfigMixedDeviceList = 200,
    BdevConfigDuplicateDevices = 201,
    BdevConfigBadTierIndex = 202,
    BdevConfigScmTier = 203,
    BdevConfigClassDevices = 204,
    BdevConfigFileSize = 205,
    BdevConfigMultiTierWithoutRoles = 210,
    BdevConfigRolesMissing = 211,
    BdevConfigRolesWithDcpm = 212,
    BdevConfigTooManyTiers = 213,
    BdevConfigBadNrRoles = 214,
    BdevConfigRolesWalDataNoMeta = 215,
    BdevConfigControlMetadataMissing = 216,
    BdevConfigControlMetadataNoRoles = 217,
    BdevConfigNoHotplugBuses = 218,
    BdevConfigUnknownRole = 219,
    BdevConfigParseFailure = 220,

    BdevNotFound = 300,
    BdevFormatFailure = 301,
    BdevFormatUnknownClass = 302,
    BdevFirmwareUpdateFailure = 303,
    BdevNoAddress = 304,
    BdevConfigReadFailure = 305,

    BdevPrepareFailure = 400,
    BdevVmdNoBackingDevices = 401,

    PrivilegedHelperUnavailable = 500,
    ForwardFailure = 501,
    AlreadyForwarded = 502,
}

impl FaultCode {
    pub fn number(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

impl From<FaultCode> for u32 {
    fn from(code: FaultCode) -> Self {
        code.number()
    }
}

impl TryFrom<u32> for FaultCode {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        FaultCode::from_repr(value)
            .ok_or_else(|| format!("unregistered fault code {value}"))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error(
    "code = {} ({}) description = {description:?} resolution = {resolution:?}",
    .code.number(),
    .code.name()
)]
pub struct Fault {
    pub code: FaultCode,
    pub description: String,
    pub resolution: String,
}

impl Fault {
    pub fn new(
        code: FaultCode,
        description: impl Into<String>,
        resolution: impl Into<String>,
    ) -> Self {
        Self {
            code,
            description: description.into(),
            resolution: resolution.into(),
        }
    }

    /// A fault for a failure that has no registered category.
    pub fn unknown(description: impl Into<String>) -> Self {
        Self::new(
            FaultCode::Unknown,
            description,
            "no known resolution; consult the server logs",
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fault_display_carries_code_and_resolution() {
        let f = Fault::new(
            FaultCode::BdevNotFound,
            "controller 0000:81:00.0 not found",
            "check the device list",
        );
        let msg = f.to_string();
        assert!(msg.starts_with("code = 300 (BdevNotFound)"), "{msg}");
        assert!(msg.contains("check the device list"), "{msg}");
    }

    #[test]
    fn fault_code_wire_format_is_numeric() {
        let f = Fault::unknown("boom");
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains(r#""code":0"#), "{json}");
        assert_eq!(serde_json::from_str::<Fault>(&json).unwrap(), f);

        let bogus = r#"{"code":9999,"description":"","resolution":""}"#;
        assert!(serde_json::from_str::<Fault>(bogus).is_err());
    }
}
