//! Firmware metadata
//!
//! Firmware files are named after their metadata:
//! `{device}-fw{M.m}-harp{M.m}-hw{M.m|x}-ass{n|x}[-preview{n}]`, where `x`
//! is a wildcard matching any minor version or assembly number.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use super::FirmwareError;

static FILE_NAME: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<name>.+?)-fw(?P<fw>\d+\.(?:\d+|x))-harp(?P<harp>\d+\.(?:\d+|x))-hw(?P<hw>\d+\.(?:\d+|x))-ass(?P<ass>\d+|x)(?:-preview(?P<pre>\d+))?$",
    )
});

/// A major.minor version pair; a missing minor is a wildcard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HarpVersion {
    /// Major version
    pub major: u32,
    /// Minor version, `None` for the `x` wildcard
    pub minor: Option<u32>,
}

impl HarpVersion {
    /// Version from its parts
    pub const fn new(major: u32, minor: Option<u32>) -> Self {
        Self { major, minor }
    }

    /// Whether both versions can describe the same release.
    ///
    /// Majors must be equal; a wildcard minor on either side matches any minor.
    pub fn satisfies(&self, other: &HarpVersion) -> bool {
        self.major == other.major
            && match (self.minor, other.minor) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

impl fmt::Display for HarpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.minor {
            Some(minor) => write!(f, "{}.{}", self.major, minor),
            None => write!(f, "{}.x", self.major),
        }
    }
}

impl FromStr for HarpVersion {
    type Err = FirmwareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FirmwareError::InvalidVersion(s.to_string());
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        let major = major.parse().map_err(|_| invalid())?;
        let minor = match minor {
            "x" | "X" => None,
            minor => Some(minor.parse().map_err(|_| invalid())?),
        };
        Ok(Self { major, minor })
    }
}

/// Metadata of one firmware build
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FirmwareMetadata {
    /// Device the image is built for
    pub device_name: String,
    /// Version of the firmware itself
    pub firmware_version: HarpVersion,
    /// Harp core version the firmware implements
    pub core_version: HarpVersion,
    /// Hardware versions the firmware runs on
    pub hardware_version: HarpVersion,
    /// `None` fits any assembly
    pub assembly_number: Option<u32>,
    /// Preview number of a prerelease build
    pub prerelease: Option<u32>,
}

impl FirmwareMetadata {
    /// Whether this firmware can be installed on the described device
    pub fn supports(
        &self,
        device_name: &str,
        hardware_version: &HarpVersion,
        assembly_number: Option<u32>,
    ) -> bool {
        self.device_name == device_name
            && self.hardware_version.satisfies(hardware_version)
            && match (self.assembly_number, assembly_number) {
                (Some(expected), Some(actual)) => expected == actual,
                _ => true,
            }
    }

    /// True for preview builds
    pub fn is_prerelease(&self) -> bool {
        self.prerelease.is_some()
    }
}

impl fmt::Display for FirmwareMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-fw{}-harp{}-hw{}-ass",
            self.device_name, self.firmware_version, self.core_version, self.hardware_version
        )?;
        match self.assembly_number {
            Some(assembly) => write!(f, "{}", assembly)?,
            None => write!(f, "x")?,
        }
        if let Some(preview) = self.prerelease {
            write!(f, "-preview{}", preview)?;
        }
        Ok(())
    }
}

impl FromStr for FirmwareMetadata {
    type Err = FirmwareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FirmwareError::InvalidFileName(s.to_string());
        let pattern = FILE_NAME
            .as_ref()
            .map_err(|err| FirmwareError::InvalidFileName(err.to_string()))?;
        let caps = pattern.captures(s).ok_or_else(invalid)?;

        let assembly_number = match &caps["ass"] {
            "x" => None,
            n => Some(n.parse().map_err(|_| invalid())?),
        };
        let prerelease = caps
            .name("pre")
            .map(|m| m.as_str().parse())
            .transpose()
            .map_err(|_| invalid())?;

        Ok(Self {
            device_name: caps["name"].to_string(),
            firmware_version: caps["fw"].parse()?,
            core_version: caps["harp"].parse()?,
            hardware_version: caps["hw"].parse()?,
            assembly_number,
            prerelease,
        })
    }
}
