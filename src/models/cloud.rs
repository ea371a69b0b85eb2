//! Installation, zone and channel model as reported by the cloud.
//!
//! Notes
//! - Identities are the durable ids handed out by the cloud. A zone's
//!   controller/zone number is kept for display only and never used as a key:
//!   two controllers in one installation can both report a "zone 1".
//! - Temperatures are canonical Celsius (one decimal) with the raw °F×10 value
//!   kept next to them for diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::extract::ParseError;

// =====================
// Scalar ID newtype wrappers
// =====================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstallationId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl fmt::Display for InstallationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =====================
// Temperatures
// =====================

/// Celsius with one decimal of precision, held as integer tenths.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Celsius(i32);

impl Celsius {
    pub const fn from_tenths(tenths: i32) -> Self {
        Celsius(tenths)
    }

    /// Round an arbitrary float to the nearest tenth.
    pub fn from_f64(value: f64) -> Self {
        Celsius((value * 10.0).round() as i32)
    }

    pub const fn tenths(self) -> i32 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 10.0
    }
}

impl fmt::Display for Celsius {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}", self.as_f64())
    }
}

impl Serialize for Celsius {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_f64(self.as_f64())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct Temperature {
    pub celsius: Celsius,
    /// Source encoding, tenths of a degree Fahrenheit.
    pub raw: i64,
}

// =====================
// Installation
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HeatingMode {
    Heating,
    Cooling,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Installation {
    pub id: InstallationId,
    pub name: String,
    pub address: Option<String>,
    pub firmware: Option<String>,
    pub online: bool,
    pub mode: HeatingMode,
    pub outside_temperature: Option<Temperature>,
}

/// Entry of the user's installation listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationSummary {
    pub id: InstallationId,
    pub name: String,
}

// =====================
// Zones and channels
// =====================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Zone {
    pub id: ZoneId,
    pub installation_id: InstallationId,
    pub name: String,
    /// Display grouping (floor, wing), if the installer configured one.
    pub group: Option<String>,
    pub controller: Option<i64>,
    pub number: Option<i64>,
    pub channel_ids: Vec<ChannelId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Channel {
    pub id: ChannelId,
    pub zone_id: ZoneId,
    pub temperature: Option<Temperature>,
    pub setpoint: Option<Temperature>,
    pub setpoint_min: Option<Temperature>,
    pub setpoint_max: Option<Temperature>,
    /// Relative humidity, percent.
    pub humidity: Option<f64>,
    /// Device-protocol mode code; resolved through the referential table.
    pub mode_code: Option<i64>,
    pub can_heat: bool,
    pub can_cool: bool,
    pub locked: bool,
    pub ring_light: bool,
    pub battery_low: bool,
    pub window_open: bool,
}

/// Result of one full installation fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallationSnapshot {
    pub installation: Installation,
    pub zones: Vec<Zone>,
    pub channels: Vec<Channel>,
    /// Zones or channels dropped because their payload was malformed.
    pub skipped: Vec<ParseError>,
    /// Zones whose id was readable but whose body was not.
    pub unreadable_zones: Vec<ZoneId>,
    pub fetched_at: DateTime<Utc>,
}

impl InstallationSnapshot {
    pub fn channels_of<'a>(&'a self, zone: &'a ZoneId) -> impl Iterator<Item = &'a Channel> + 'a {
        self.channels.iter().filter(move |c| &c.zone_id == zone)
    }
}

// =====================
// Live (diagnostic) data
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveKind {
    MixedCircuit,
    DigitalIo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LiveValue {
    Temperature(Temperature),
    Flag(bool),
    Number(f64),
}

impl fmt::Display for LiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiveValue::Temperature(t) => write!(f, "{}", t.celsius),
            LiveValue::Flag(true) => f.write_str("ON"),
            LiveValue::Flag(false) => f.write_str("OFF"),
            LiveValue::Number(n) => write!(f, "{}", n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivePoint {
    /// Stable per installation, e.g. `mc1_flow_temperature`.
    pub id: String,
    pub name: String,
    pub kind: LiveKind,
    pub value: LiveValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveSnapshot {
    pub installation_id: InstallationId,
    pub points: Vec<LivePoint>,
    pub fetched_at: DateTime<Utc>,
}
