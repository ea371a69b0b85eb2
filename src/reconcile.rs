//! Reconciler: the single mutation entry point of the Zone State Store.
//!
//! Poll results, device pushes and command outcomes all arrive here as
//! [`Update`]s and are merged per field:
//!
//! - No pending optimistic write: last writer wins by timestamp; a push beats
//!   a poll carrying the same timestamp.
//! - Pending write: an equal value confirms it. A differing push reverts it
//!   once the same value repeats `confirm_updates` times or the grace period
//!   is over. A differing poll reverts it only when `confirm_updates`
//!   consecutive polls disagreed *and* the grace period is over.
//! - Data older than the pending command is ignored.
//!
//! Every operation returns the [`Publication`]s it caused; values that did not
//! change produce nothing.

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info, trace, warn};
use std::collections::{BTreeMap, BTreeSet};

use crate::models::climate::*;
use crate::models::cloud::{
    Celsius, Channel, HeatingMode, InstallationId, InstallationSnapshot, LivePoint, LiveSnapshot, ZoneId,
};
use crate::referential::{LABEL_OFF, LABEL_PROGRAM, ReferentialTable};
use crate::store::{ZoneRecord, ZoneStateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    /// How long a pending write shields its field from conflicting values.
    pub grace: TimeDelta,
    /// Disagreeing updates needed before a conflicting value wins.
    pub confirm_updates: u32,
    /// Consecutive omitting snapshots after which a zone is removed.
    pub missed_polls_before_removal: u32,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        ReconcilePolicy {
            grace: TimeDelta::seconds(60),
            confirm_updates: 2,
            missed_polls_before_removal: 3,
        }
    }
}

/// Something the outside world should be told about.
#[derive(Debug, Clone, PartialEq)]
pub enum Publication {
    /// (Re)announce the zone's discovery config.
    Discovery(ZoneId),
    /// Zone is gone for good; clear its retained topics.
    ZoneRemoved(ZoneId),
    Availability {
        zone_id: ZoneId,
        available: bool,
    },
    Attributes(ZoneId),
    Field {
        zone_id: ZoneId,
        field: Field,
        value: FieldValue,
    },
    /// The field no longer has a value; clear its retained state.
    FieldCleared {
        zone_id: ZoneId,
        field: Field,
    },
    Installation(InstallationId),
    Live {
        installation_id: InstallationId,
        point: LivePoint,
        announce: bool,
    },
}

pub struct Reconciler {
    store: ZoneStateStore,
    referential: ReferentialTable,
    policy: ReconcilePolicy,
}

impl Reconciler {
    pub fn new(policy: ReconcilePolicy) -> Self {
        Reconciler {
            store: ZoneStateStore::default(),
            referential: ReferentialTable::builtin(),
            policy,
        }
    }

    pub fn store(&self) -> &ZoneStateStore {
        &self.store
    }

    pub fn referential(&self) -> &ReferentialTable {
        &self.referential
    }

    pub fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    /// Merge a single field update.
    pub fn apply(&mut self, update: Update) -> Vec<Publication> {
        let Some(record) = self.store.zone_mut(&update.zone_id) else {
            debug!(
                "Reconcile: dropping {} update for unknown zone {}",
                update.field, update.zone_id
            );
            return Vec::new();
        };
        let had_value = record.climate.value(update.field).is_some();
        match merge(record.climate.field_mut(update.field), &update, &self.policy) {
            Some(value) => vec![Publication::Field {
                zone_id: update.zone_id,
                field: update.field,
                value,
            }],
            None if had_value && record.climate.value(update.field).is_none() => vec![Publication::FieldCleared {
                zone_id: update.zone_id,
                field: update.field,
            }],
            None => Vec::new(),
        }
    }

    /// Merge a full installation snapshot: zones, channels, derived fields,
    /// availability and removal of zones the installation stopped reporting.
    pub fn apply_snapshot(&mut self, snapshot: InstallationSnapshot) -> Vec<Publication> {
        let InstallationSnapshot {
            installation,
            zones,
            channels,
            unreadable_zones,
            fetched_at,
            ..
        } = snapshot;
        let mut out = Vec::new();
        let installation_id = installation.id.clone();
        let online = installation.online;
        let mode = installation.mode;

        if self.store.upsert_installation(installation, fetched_at) {
            out.push(Publication::Installation(installation_id.clone()));
        }

        let mut seen = BTreeSet::new();
        for zone in zones {
            if !seen.insert(zone.id.clone()) {
                warn!(
                    "Reconcile: {}: zone {} listed twice, keeping the first",
                    installation_id, zone.id
                );
                continue;
            }
            let zone_id = zone.id.clone();
            let zone_channels: Vec<Channel> = channels.iter().filter(|c| c.zone_id == zone_id).cloned().collect();

            match self.store.zone_mut(&zone_id) {
                Some(record) if record.installation_id() != &installation_id => {
                    warn!(
                        "Reconcile: {}: zone {} already belongs to installation {}, ignoring",
                        installation_id,
                        zone_id,
                        record.installation_id()
                    );
                    continue;
                }
                Some(record) => {
                    let relabelled = record.zone.name != zone.name || record.zone.group != zone.group;
                    let attributes_changed = record.zone != zone || record.channels != zone_channels;
                    if record.missed_polls > 0 {
                        info!("Reconcile: {}: zone {} is back", installation_id, zone_id);
                    }
                    record.zone = zone;
                    record.channels = zone_channels;
                    record.missed_polls = 0;
                    record.last_seen = fetched_at;
                    if relabelled {
                        out.push(Publication::Discovery(zone_id.clone()));
                    }
                    if attributes_changed {
                        out.push(Publication::Attributes(zone_id.clone()));
                    }
                    if record.available != online {
                        record.available = online;
                        out.push(Publication::Availability {
                            zone_id: zone_id.clone(),
                            available: online,
                        });
                    }
                }
                None => {
                    info!(
                        "Reconcile: {}: new zone {} ({}, {} channel(s))",
                        installation_id,
                        zone_id,
                        zone.name,
                        zone_channels.len()
                    );
                    let mut record = ZoneRecord::new(zone, zone_channels, fetched_at);
                    record.available = online;
                    self.store.insert_zone(record);
                    out.push(Publication::Discovery(zone_id.clone()));
                    out.push(Publication::Attributes(zone_id.clone()));
                    out.push(Publication::Availability {
                        zone_id: zone_id.clone(),
                        available: online,
                    });
                }
            }

            let Some(record) = self.store.zone_mut(&zone_id) else {
                continue;
            };
            for (field, value) in derive_fields(&record.channels, mode, &self.referential) {
                let update = Update {
                    zone_id: zone_id.clone(),
                    field,
                    value,
                    source: UpdateSource::Poll,
                    timestamp: fetched_at,
                };
                if let Some(value) = merge(record.climate.field_mut(field), &update, &self.policy) {
                    out.push(Publication::Field {
                        zone_id: zone_id.clone(),
                        field,
                        value,
                    });
                }
            }
        }

        // Still reported, just not readable this time: keep what we have.
        for zone_id in unreadable_zones {
            if seen.insert(zone_id.clone()) {
                debug!(
                    "Reconcile: {}: zone {} unreadable, keeping previous state",
                    installation_id, zone_id
                );
            }
        }

        let missing: Vec<ZoneId> = self
            .store
            .zones_of(&installation_id)
            .filter(|z| !seen.contains(z.id()))
            .map(|z| z.id().clone())
            .collect();
        for zone_id in missing {
            let Some(record) = self.store.zone_mut(&zone_id) else {
                continue;
            };
            record.missed_polls += 1;
            if record.missed_polls >= self.policy.missed_polls_before_removal {
                warn!(
                    "Reconcile: {}: zone {} missing from {} consecutive snapshots, removing",
                    installation_id, zone_id, record.missed_polls
                );
                self.store.remove_zone(&zone_id);
                out.push(Publication::ZoneRemoved(zone_id));
                continue;
            }
            if record.available {
                warn!(
                    "Reconcile: {}: zone {} missing from snapshot, marking unavailable",
                    installation_id, zone_id
                );
                record.available = false;
                out.push(Publication::Availability {
                    zone_id,
                    available: false,
                });
            }
        }

        out
    }

    pub fn apply_live(&mut self, live: LiveSnapshot) -> Vec<Publication> {
        let mut out = Vec::new();
        let previous = self.store.live(&live.installation_id);
        for point in &live.points {
            let old = previous.and_then(|p| p.points.iter().find(|q| q.id == point.id));
            let announce = match old {
                None => true,
                Some(old) if old == point => continue,
                Some(old) => old.name != point.name || old.kind != point.kind,
            };
            out.push(Publication::Live {
                installation_id: live.installation_id.clone(),
                point: point.clone(),
                announce,
            });
        }
        self.store.replace_live(live);
        out
    }

    /// Swap in a new referential table and re-derive the fields it affects.
    pub fn set_referential(&mut self, table: ReferentialTable) -> Vec<Publication> {
        if table == self.referential {
            return Vec::new();
        }
        info!("Reconcile: referential updated ({} mode codes)", table.len());
        self.referential = table;

        let modes: BTreeMap<InstallationId, HeatingMode> = self
            .store
            .installations()
            .map(|r| (r.installation.id.clone(), r.installation.mode))
            .collect();

        let mut out = Vec::new();
        for record in self.store.zones_mut() {
            out.push(Publication::Discovery(record.id().clone()));
            let mode = modes.get(record.installation_id()).copied().unwrap_or_default();
            let derived = derive_fields(&record.channels, mode, &self.referential);
            for (field, value) in derived {
                if !matches!(field, Field::Mode | Field::Preset) {
                    continue;
                }
                let last_seen = record.last_seen;
                let state = record.climate.field_mut(field);
                if state.pending.is_some() {
                    continue;
                }
                let at = state.value_at.unwrap_or(last_seen);
                if let Some(value) = resolve(state, value, at, SourceKind::Poll, false) {
                    out.push(Publication::Field {
                        zone_id: record.zone.id.clone(),
                        field,
                        value,
                    });
                }
            }
        }
        out
    }

    /// Revert pending writes whose grace period ran out while a conflicting
    /// value was already on record.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<Publication> {
        let mut out = Vec::new();
        for record in self.store.zones_mut() {
            for field in Field::ALL {
                if record.climate.pending(field).is_none() {
                    continue;
                }
                let state = record.climate.field_mut(field);
                if let Some(value) = expire_pending(state, &self.policy, now) {
                    info!(
                        "Reconcile: zone {} {}: grace period over, reverting to {}",
                        record.zone.id, field, value
                    );
                    out.push(Publication::Field {
                        zone_id: record.zone.id.clone(),
                        field,
                        value,
                    });
                }
            }
        }
        out
    }

    /// Everything needed to rebuild the bus side from scratch.
    pub fn republish_all(&self) -> Vec<Publication> {
        let mut out = Vec::new();
        for record in self.store.installations() {
            out.push(Publication::Installation(record.installation.id.clone()));
        }
        for record in self.store.zones() {
            let zone_id = record.id();
            out.push(Publication::Discovery(zone_id.clone()));
            out.push(Publication::Attributes(zone_id.clone()));
            out.push(Publication::Availability {
                zone_id: zone_id.clone(),
                available: record.available,
            });
            for (field, value) in record.climate.values() {
                out.push(Publication::Field {
                    zone_id: zone_id.clone(),
                    field,
                    value: value.clone(),
                });
            }
        }
        for live in self.store.live_snapshots() {
            for point in &live.points {
                out.push(Publication::Live {
                    installation_id: live.installation_id.clone(),
                    point: point.clone(),
                    announce: true,
                });
            }
        }
        out
    }
}

/// Aggregate a zone's channels into climate fields. Target temperature and
/// mode come from the primary channel; current temperature and humidity are
/// the mean over reporting channels.
pub fn derive_fields(
    channels: &[Channel],
    mode: HeatingMode,
    referential: &ReferentialTable,
) -> Vec<(Field, FieldValue)> {
    let mut out = Vec::new();
    let Some(primary) = channels.first() else {
        return out;
    };

    if let Some(setpoint) = primary.setpoint {
        out.push((Field::TargetTemperature, FieldValue::Temperature(setpoint.celsius)));
    }

    let temps: Vec<f64> = channels
        .iter()
        .filter_map(|c| c.temperature)
        .map(|t| t.celsius.tenths() as f64)
        .collect();
    if let Some(mean) = mean(&temps) {
        out.push((
            Field::CurrentTemperature,
            FieldValue::Temperature(Celsius::from_tenths(mean.round() as i32)),
        ));
    }

    let humidity: Vec<f64> = channels.iter().filter_map(|c| c.humidity).collect();
    if let Some(mean) = mean(&humidity) {
        out.push((Field::Humidity, FieldValue::Percent(mean.round().clamp(0.0, 100.0) as u8)));
    }

    if let Some(code) = primary.mode_code {
        match referential.mode_label(code) {
            Some(label) => {
                let cooling = match mode {
                    HeatingMode::Cooling => true,
                    HeatingMode::Heating => false,
                    HeatingMode::Unknown => primary.can_cool && !primary.can_heat,
                };
                let (climate_mode, preset) = climate_mode(label, cooling);
                out.push((Field::Mode, FieldValue::Text(climate_mode.to_string())));
                out.push((Field::Preset, FieldValue::Text(preset.to_string())));
            }
            None => trace!("Reconcile: zone {}: unknown mode code {}", primary.zone_id, code),
        }
    }
    out
}

/// Map a referential mode label to (climate mode, preset).
pub fn climate_mode(label: &str, cooling: bool) -> (&'static str, &str) {
    match label {
        LABEL_OFF => (MODE_OFF, PRESET_NONE),
        LABEL_PROGRAM | "auto" => (MODE_AUTO, PRESET_NONE),
        preset if cooling => (MODE_COOL, preset),
        preset => (MODE_HEAT, preset),
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Store `value` as the resolved value. Returns it when it should be
/// published: it changed, or `force` is set.
fn resolve(
    state: &mut FieldState,
    value: FieldValue,
    at: DateTime<Utc>,
    source: SourceKind,
    force: bool,
) -> Option<FieldValue> {
    let changed = state.value.as_ref() != Some(&value);
    state.value = Some(value.clone());
    state.value_at = Some(at);
    state.value_source = Some(source);
    if changed || force { Some(value) } else { None }
}

fn reversion_due(pending: &Pending, policy: &ReconcilePolicy, now: DateTime<Utc>) -> bool {
    let Some(conflict) = &pending.conflict else {
        return false;
    };
    let grace_over = now - pending.issued_at >= policy.grace;
    let repeated_pushes = pending.repeated_push.as_ref().map_or(0, |(_, n)| *n);
    if repeated_pushes >= policy.confirm_updates {
        return true;
    }
    match conflict.source {
        SourceKind::Push => grace_over,
        SourceKind::Poll => grace_over && (pending.disagreeing_polls >= policy.confirm_updates || repeated_pushes > 0),
        SourceKind::Command => false,
    }
}

fn expire_pending(state: &mut FieldState, policy: &ReconcilePolicy, now: DateTime<Utc>) -> Option<FieldValue> {
    let pending = state.pending.as_ref()?;
    if !reversion_due(pending, policy, now) {
        return None;
    }
    let conflict = pending.conflict.clone()?;
    state.pending = None;
    resolve(state, conflict.value, conflict.at, conflict.source, false)
}

fn merge(state: &mut FieldState, update: &Update, policy: &ReconcilePolicy) -> Option<FieldValue> {
    let kind = update.source.kind();
    let at = update.timestamp;
    match update.source {
        UpdateSource::Optimistic(command) => {
            state.touch(kind, at);
            let previous = match state.pending.take() {
                Some(superseded) => {
                    debug!(
                        "Reconcile: zone {} {}: command {} supersedes {}",
                        update.zone_id, update.field, command, superseded.command
                    );
                    superseded.previous
                }
                None => state.value.clone(),
            };
            state.pending = Some(Pending::new(command, update.value.clone(), at, previous));
            resolve(state, update.value.clone(), at, kind, false)
        }
        UpdateSource::Rejected(command) => {
            if state.pending.as_ref().is_none_or(|p| p.command != command) {
                debug!(
                    "Reconcile: zone {} {}: rejection of superseded command {} ignored",
                    update.zone_id, update.field, command
                );
                return None;
            }
            state.touch(kind, at);
            let pending = state.pending.take()?;
            match pending.previous {
                Some(previous) => {
                    info!(
                        "Reconcile: zone {} {}: command {} rejected, restoring {}",
                        update.zone_id, update.field, command, previous
                    );
                    resolve(state, previous, pending.issued_at, kind, true)
                }
                None => {
                    state.value = None;
                    state.value_at = None;
                    state.value_source = None;
                    None
                }
            }
        }
        UpdateSource::Poll | UpdateSource::Push => merge_external(state, update, kind, policy),
    }
}

fn merge_external(
    state: &mut FieldState,
    update: &Update,
    kind: SourceKind,
    policy: &ReconcilePolicy,
) -> Option<FieldValue> {
    let at = update.timestamp;
    state.touch(kind, at);

    if let Some(pending) = state.pending.as_mut() {
        if at < pending.issued_at {
            trace!(
                "Reconcile: zone {} {}: ignoring data older than command {}",
                update.zone_id, update.field, pending.command
            );
            return None;
        }
        if update.value == pending.value {
            debug!(
                "Reconcile: zone {} {}: command {} confirmed by {:?}",
                update.zone_id, update.field, pending.command, kind
            );
            state.pending = None;
            return resolve(state, update.value.clone(), at, kind, false);
        }

        match kind {
            SourceKind::Push => {
                let count = match &pending.repeated_push {
                    Some((value, n)) if *value == update.value => n + 1,
                    _ => 1,
                };
                pending.repeated_push = Some((update.value.clone(), count));
            }
            SourceKind::Poll => {
                pending.disagreeing_polls += 1;
                if pending.repeated_push.as_ref().is_some_and(|(value, _)| *value != update.value) {
                    pending.repeated_push = None;
                }
            }
            SourceKind::Command => {}
        }
        pending.conflict = Some(Conflict {
            value: update.value.clone(),
            at,
            source: kind,
        });

        if !reversion_due(pending, policy, at) {
            debug!(
                "Reconcile: zone {} {}: holding {} against {:?} value {}",
                update.zone_id, update.field, pending.value, kind, update.value
            );
            return None;
        }
        info!(
            "Reconcile: zone {} {}: command {} not confirmed, {:?} value {} wins",
            update.zone_id, update.field, pending.command, kind, update.value
        );
        state.pending = None;
        return resolve(state, update.value.clone(), at, kind, false);
    }

    let newer = match state.value_at {
        None => true,
        Some(prev) => at > prev || (at == prev && kind == SourceKind::Push),
    };
    if !newer {
        trace!(
            "Reconcile: zone {} {}: stale {:?} value ignored",
            update.zone_id, update.field, kind
        );
        return None;
    }
    resolve(state, update.value.clone(), at, kind, false)
}
