//! Per-zone climate state and the update records fed to the reconciler.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::models::cloud::{Celsius, ZoneId};

pub const MODE_OFF: &str = "off";
pub const MODE_AUTO: &str = "auto";
pub const MODE_HEAT: &str = "heat";
pub const MODE_COOL: &str = "cool";
/// Preset reported when the active mode is not a preset (off, auto).
pub const PRESET_NONE: &str = "none";

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    TargetTemperature,
    CurrentTemperature,
    Humidity,
    Mode,
    Preset,
}

impl Field {
    pub const ALL: [Field; 5] = [
        Field::TargetTemperature,
        Field::CurrentTemperature,
        Field::Humidity,
        Field::Mode,
        Field::Preset,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Field::TargetTemperature => "target_temperature",
            Field::CurrentTemperature => "current_temperature",
            Field::Humidity => "humidity",
            Field::Mode => "mode",
            Field::Preset => "preset",
        }
    }

    pub fn parse(s: &str) -> Option<Field> {
        Field::ALL.into_iter().find(|f| f.as_str() == s)
    }

    /// Whether local commands may target this field.
    pub fn is_writable(self) -> bool {
        matches!(self, Field::TargetTemperature | Field::Mode | Field::Preset)
    }

    /// Parse a bus payload into a value of this field's type.
    pub fn parse_value(self, payload: &str) -> Option<FieldValue> {
        let payload = payload.trim();
        match self {
            Field::TargetTemperature | Field::CurrentTemperature => payload
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(|v| FieldValue::Temperature(Celsius::from_f64(v))),
            Field::Humidity => payload
                .parse::<f64>()
                .ok()
                .filter(|v| (0.0..=100.0).contains(v))
                .map(|v| FieldValue::Percent(v.round() as u8)),
            Field::Mode | Field::Preset => {
                if payload.is_empty() {
                    None
                } else {
                    Some(FieldValue::Text(payload.to_ascii_lowercase()))
                }
            }
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Temperature(Celsius),
    Percent(u8),
    Text(String),
}

/// Formats the value as it is published on the bus.
impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Temperature(c) => write!(f, "{}", c),
            FieldValue::Percent(p) => write!(f, "{}", p),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateSource {
    /// Value from a periodic cloud snapshot.
    Poll,
    /// Unsolicited device-originated report.
    Push,
    /// Locally issued command, applied before the cloud confirms it.
    Optimistic(CommandId),
    /// The cloud call for a command failed.
    Rejected(CommandId),
}

impl UpdateSource {
    pub fn kind(self) -> SourceKind {
        match self {
            UpdateSource::Poll => SourceKind::Poll,
            UpdateSource::Push => SourceKind::Push,
            UpdateSource::Optimistic(_) | UpdateSource::Rejected(_) => SourceKind::Command,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Poll,
    Push,
    Command,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub zone_id: ZoneId,
    pub field: Field,
    pub value: FieldValue,
    pub source: UpdateSource,
    pub timestamp: DateTime<Utc>,
}

/// Latest external value disagreeing with a pending write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub value: FieldValue,
    pub at: DateTime<Utc>,
    pub source: SourceKind,
}

/// An optimistic write awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    pub command: CommandId,
    pub value: FieldValue,
    pub issued_at: DateTime<Utc>,
    /// Resolved value before the first of any chain of superseding commands.
    pub previous: Option<FieldValue>,
    /// Consecutive polls disagreeing with `value`.
    pub disagreeing_polls: u32,
    /// Last disagreeing push value and how many times in a row it was seen.
    pub repeated_push: Option<(FieldValue, u32)>,
    pub conflict: Option<Conflict>,
}

impl Pending {
    pub fn new(command: CommandId, value: FieldValue, issued_at: DateTime<Utc>, previous: Option<FieldValue>) -> Self {
        Pending {
            command,
            value,
            issued_at,
            previous,
            disagreeing_polls: 0,
            repeated_push: None,
            conflict: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldState {
    /// Resolved value, as last published.
    pub value: Option<FieldValue>,
    /// Timestamp and origin of the update that produced `value`.
    pub value_at: Option<DateTime<Utc>>,
    pub value_source: Option<SourceKind>,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_push: Option<DateTime<Utc>>,
    pub last_command: Option<DateTime<Utc>>,
    pub pending: Option<Pending>,
}

impl FieldState {
    pub fn touch(&mut self, kind: SourceKind, at: DateTime<Utc>) {
        let slot = match kind {
            SourceKind::Poll => &mut self.last_poll,
            SourceKind::Push => &mut self.last_push,
            SourceKind::Command => &mut self.last_command,
        };
        if slot.is_none_or(|prev| prev < at) {
            *slot = Some(at);
        }
    }
}

/// Aggregated climate view of one zone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClimateState {
    fields: BTreeMap<Field, FieldState>,
}

impl ClimateState {
    pub fn field(&self, field: Field) -> Option<&FieldState> {
        self.fields.get(&field)
    }

    pub fn field_mut(&mut self, field: Field) -> &mut FieldState {
        self.fields.entry(field).or_default()
    }

    pub fn value(&self, field: Field) -> Option<&FieldValue> {
        self.fields.get(&field).and_then(|s| s.value.as_ref())
    }

    pub fn pending(&self, field: Field) -> Option<&Pending> {
        self.fields.get(&field).and_then(|s| s.pending.as_ref())
    }

    pub fn values(&self) -> impl Iterator<Item = (Field, &FieldValue)> {
        self.fields.iter().filter_map(|(f, s)| s.value.as_ref().map(|v| (*f, v)))
    }
}
