//! Typed version ordinals.
//!
//! Two kinds of version show up in the control plane: the software version a
//! service reports about itself (`ServiceVersion`), and the protocol version a
//! caller requests (`ApiVersion`). Both are totally ordered so gates are plain
//! comparisons instead of ad hoc string or integer checks.

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Software version reported by a single service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceVersion(pub u32);

impl ServiceVersion {
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ServiceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lowest version reported across the fleet for one service class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinimumVersion {
    /// No service of the class reported a version.
    Unknown,
    Reported(ServiceVersion),
}

impl MinimumVersion {
    pub fn from_reports<I>(reports: I) -> Self
    where
        I: IntoIterator<Item = ServiceVersion>,
    {
        reports
            .into_iter()
            .min()
            .map(MinimumVersion::Reported)
            .unwrap_or(MinimumVersion::Unknown)
    }

    /// `Unknown` never satisfies a floor.
    pub fn meets(&self, floor: ServiceVersion) -> bool {
        match self {
            MinimumVersion::Unknown => false,
            MinimumVersion::Reported(version) => *version >= floor,
        }
    }

    /// Reported value, or zero when nothing reported.
    pub fn as_reported(&self) -> ServiceVersion {
        match self {
            MinimumVersion::Unknown => ServiceVersion(0),
            MinimumVersion::Reported(version) => *version,
        }
    }
}

impl fmt::Display for MinimumVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MinimumVersion::Unknown => f.write_str("unknown"),
            MinimumVersion::Reported(version) => write!(f, "{version}"),
        }
    }
}

/// Caller protocol version in `major.minor` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u16,
    pub minor: u16,
}

impl ApiVersion {
    pub const MIN: ApiVersion = ApiVersion::new(2, 1);
    pub const MAX: ApiVersion = ApiVersion::new(2, 95);

    /// Server groups expose project and user ownership.
    pub const SERVER_GROUP_OWNERSHIP: ApiVersion = ApiVersion::new(2, 13);
    /// Admin credential always generated or caller-supplied, shared storage retired.
    pub const RELOCATE_MODERN_CREDENTIAL: ApiVersion = ApiVersion::new(2, 14);
    /// Soft affinity policies accepted for server groups.
    pub const SERVER_GROUP_SOFT_POLICIES: ApiVersion = ApiVersion::new(2, 15);
    /// `force` accepted on relocation.
    pub const RELOCATE_FORCE: ApiVersion = ApiVersion::new(2, 29);
    /// Server groups expose a single policy plus rules.
    pub const SERVER_GROUP_POLICY_RULES: ApiVersion = ApiVersion::new(2, 64);
    /// A reason may be recorded when locking an instance.
    pub const LOCK_REASON: ApiVersion = ApiVersion::new(2, 73);
    /// Relocated instances are left stopped at the destination.
    pub const RELOCATE_STOPPED_TARGET: ApiVersion = ApiVersion::new(2, 95);

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_at_least(&self, other: ApiVersion) -> bool {
        *self >= other
    }

    /// Parse and range-check a version requested by a caller.
    pub fn negotiate(raw: Option<&str>) -> Result<Self> {
        let version = match raw.map(str::trim) {
            None | Some("") => return Ok(Self::MIN),
            Some("latest") => return Ok(Self::MAX),
            Some(raw) => raw.parse::<ApiVersion>()?,
        };

        if version < Self::MIN || version > Self::MAX {
            return Err(CoreError::UnsupportedApiVersion(version.to_string()));
        }

        Ok(version)
    }
}

impl Default for ApiVersion {
    fn default() -> Self {
        Self::MIN
    }
}

impl FromStr for ApiVersion {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| CoreError::InvalidApiVersion(s.to_string()))?;

        let parse = |part: &str| {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(CoreError::InvalidApiVersion(s.to_string()));
            }
            part.parse::<u16>()
                .map_err(|_| CoreError::InvalidApiVersion(s.to_string()))
        };

        Ok(ApiVersion::new(parse(major)?, parse(minor)?))
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
