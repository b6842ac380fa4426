//! Room versions and the rule switches they select.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported room version {0:?}")]
pub struct UnsupportedRoomVersion(pub String);

/// State resolution algorithm selected by a room version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateResAlgorithm {
    V2,
}

/// Rule switches that differ between room versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomVersionRules {
    pub state_res: StateResAlgorithm,
    /// `knock` membership and join rule are allowed.
    pub knock: bool,
    /// `restricted` join rule is allowed.
    pub restricted_join: bool,
    /// `knock_restricted` join rule is allowed.
    pub knock_restricted: bool,
    /// Power levels must be JSON integers.
    pub integer_power_levels: bool,
}

/// Supported room versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RoomVersion {
    V6,
    V7,
    V8,
    V9,
    V10,
}

impl RoomVersion {
    pub const DEFAULT: RoomVersion = RoomVersion::V10;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V6 => "6",
            Self::V7 => "7",
            Self::V8 => "8",
            Self::V9 => "9",
            Self::V10 => "10",
        }
    }

    pub fn rules(&self) -> RoomVersionRules {
        RoomVersionRules {
            state_res: StateResAlgorithm::V2,
            knock: *self >= Self::V7,
            restricted_join: *self >= Self::V8,
            knock_restricted: *self >= Self::V10,
            integer_power_levels: *self >= Self::V10,
        }
    }
}

impl Default for RoomVersion {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for RoomVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomVersion {
    type Err = UnsupportedRoomVersion;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "6" => Ok(Self::V6),
            "7" => Ok(Self::V7),
            "8" => Ok(Self::V8),
            "9" => Ok(Self::V9),
            "10" => Ok(Self::V10),
            other => Err(UnsupportedRoomVersion(other.to_string())),
        }
    }
}

impl TryFrom<String> for RoomVersion {
    type Error = UnsupportedRoomVersion;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RoomVersion> for String {
    fn from(v: RoomVersion) -> Self {
        v.as_str().to_string()
    }
}
