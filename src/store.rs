//! Zone State Store: canonical in-memory state keyed by durable zone id.
//!
//! Everything here is readable by anyone holding a shared reference. The
//! mutating methods are crate-private and only called from
//! [`crate::reconcile::Reconciler`], which owns the store.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::models::climate::ClimateState;
use crate::models::cloud::{Celsius, Channel, Installation, InstallationId, LiveSnapshot, Zone, ZoneId};

/// Setpoint bounds used when a channel does not report its own.
pub const DEFAULT_SETPOINT_MIN: Celsius = Celsius::from_tenths(50);
pub const DEFAULT_SETPOINT_MAX: Celsius = Celsius::from_tenths(300);

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneRecord {
    pub zone: Zone,
    /// In cloud order; the first one is the zone's primary channel.
    pub channels: Vec<Channel>,
    pub climate: ClimateState,
    pub available: bool,
    /// Consecutive installation snapshots that omitted this zone.
    pub missed_polls: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ZoneRecord {
    pub fn new(zone: Zone, channels: Vec<Channel>, seen: DateTime<Utc>) -> Self {
        ZoneRecord {
            zone,
            channels,
            climate: ClimateState::default(),
            available: true,
            missed_polls: 0,
            first_seen: seen,
            last_seen: seen,
        }
    }

    pub fn id(&self) -> &ZoneId {
        &self.zone.id
    }

    pub fn installation_id(&self) -> &InstallationId {
        &self.zone.installation_id
    }

    pub fn primary_channel(&self) -> Option<&Channel> {
        self.channels.first()
    }

    /// Allowed setpoint range, from the primary channel when it reports one.
    pub fn setpoint_bounds(&self) -> (Celsius, Celsius) {
        let primary = self.primary_channel();
        let min = primary
            .and_then(|c| c.setpoint_min)
            .map(|t| t.celsius)
            .unwrap_or(DEFAULT_SETPOINT_MIN);
        let max = primary
            .and_then(|c| c.setpoint_max)
            .map(|t| t.celsius)
            .unwrap_or(DEFAULT_SETPOINT_MAX);
        if min <= max { (min, max) } else { (max, min) }
    }

    pub fn can_heat(&self) -> bool {
        self.channels.is_empty() || self.channels.iter().any(|c| c.can_heat)
    }

    pub fn can_cool(&self) -> bool {
        self.channels.iter().any(|c| c.can_cool)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstallationRecord {
    pub installation: Installation,
    pub last_snapshot: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ZoneStateStore {
    zones: BTreeMap<ZoneId, ZoneRecord>,
    installations: BTreeMap<InstallationId, InstallationRecord>,
    live: BTreeMap<InstallationId, LiveSnapshot>,
}

impl ZoneStateStore {
    pub fn zone(&self, id: &ZoneId) -> Option<&ZoneRecord> {
        self.zones.get(id)
    }

    pub fn zones(&self) -> impl Iterator<Item = &ZoneRecord> {
        self.zones.values()
    }

    pub fn zones_of<'a>(&'a self, installation: &'a InstallationId) -> impl Iterator<Item = &'a ZoneRecord> + 'a {
        self.zones.values().filter(move |z| z.installation_id() == installation)
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    pub fn installation(&self, id: &InstallationId) -> Option<&InstallationRecord> {
        self.installations.get(id)
    }

    pub fn installations(&self) -> impl Iterator<Item = &InstallationRecord> {
        self.installations.values()
    }

    pub fn live(&self, id: &InstallationId) -> Option<&LiveSnapshot> {
        self.live.get(id)
    }

    pub fn live_snapshots(&self) -> impl Iterator<Item = &LiveSnapshot> {
        self.live.values()
    }

    pub(crate) fn zone_mut(&mut self, id: &ZoneId) -> Option<&mut ZoneRecord> {
        self.zones.get_mut(id)
    }

    pub(crate) fn zones_mut(&mut self) -> impl Iterator<Item = &mut ZoneRecord> {
        self.zones.values_mut()
    }

    pub(crate) fn insert_zone(&mut self, record: ZoneRecord) {
        self.zones.insert(record.id().clone(), record);
    }

    pub(crate) fn remove_zone(&mut self, id: &ZoneId) -> Option<ZoneRecord> {
        self.zones.remove(id)
    }

    /// Returns `true` when the installation's reported attributes changed.
    pub(crate) fn upsert_installation(&mut self, installation: Installation, at: DateTime<Utc>) -> bool {
        match self.installations.get_mut(&installation.id) {
            Some(record) => {
                record.last_snapshot = at;
                if record.installation == installation {
                    false
                } else {
                    record.installation = installation;
                    true
                }
            }
            None => {
                self.installations.insert(
                    installation.id.clone(),
                    InstallationRecord {
                        installation,
                        last_snapshot: at,
                    },
                );
                true
            }
        }
    }

    /// Store a live snapshot, returning the one it replaced.
    pub(crate) fn replace_live(&mut self, live: LiveSnapshot) -> Option<LiveSnapshot> {
        self.live.insert(live.installation_id.clone(), live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cloud::{ChannelId, HeatingMode};
    use crate::temperature;

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-10T08:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn zone(id: &str, inst: &str) -> Zone {
        Zone {
            id: ZoneId(id.into()),
            installation_id: InstallationId(inst.into()),
            name: id.into(),
            group: None,
            controller: Some(1),
            number: Some(1),
            channel_ids: vec![],
        }
    }

    fn channel(min: Option<i64>, max: Option<i64>) -> Channel {
        Channel {
            id: ChannelId("C".into()),
            zone_id: ZoneId("Z".into()),
            temperature: None,
            setpoint: None,
            setpoint_min: min.and_then(temperature::reading),
            setpoint_max: max.and_then(temperature::reading),
            humidity: None,
            mode_code: None,
            can_heat: true,
            can_cool: false,
            locked: false,
            ring_light: false,
            battery_low: false,
            window_open: false,
        }
    }

    #[test]
    fn bounds_come_from_primary_channel() {
        let rec = ZoneRecord::new(zone("Z", "I"), vec![channel(Some(410), Some(986))], at());
        assert_eq!(rec.setpoint_bounds(), (Celsius::from_tenths(50), Celsius::from_tenths(370)));

        let rec = ZoneRecord::new(zone("Z", "I"), vec![channel(Some(500), None)], at());
        assert_eq!(rec.setpoint_bounds(), (Celsius::from_tenths(100), DEFAULT_SETPOINT_MAX));

        let rec = ZoneRecord::new(zone("Z", "I"), vec![], at());
        assert_eq!(rec.setpoint_bounds(), (DEFAULT_SETPOINT_MIN, DEFAULT_SETPOINT_MAX));
    }

    #[test]
    fn zones_are_scoped_by_installation() {
        let mut store = ZoneStateStore::default();
        store.insert_zone(ZoneRecord::new(zone("Z1", "A"), vec![], at()));
        store.insert_zone(ZoneRecord::new(zone("Z2", "B"), vec![], at()));
        store.insert_zone(ZoneRecord::new(zone("Z3", "A"), vec![], at()));

        let a = InstallationId("A".into());
        let ids: Vec<_> = store.zones_of(&a).map(|z| z.id().0.as_str()).collect();
        assert_eq!(ids, vec!["Z1", "Z3"]);
        assert_eq!(store.zone_count(), 3);
        assert!(store.remove_zone(&ZoneId("Z1".into())).is_some());
        assert!(store.zone(&ZoneId("Z1".into())).is_none());
    }

    #[test]
    fn upsert_reports_attribute_changes_only() {
        let mut store = ZoneStateStore::default();
        let inst = Installation {
            id: InstallationId("A".into()),
            name: "Home".into(),
            address: None,
            firmware: Some("1.0".into()),
            online: true,
            mode: HeatingMode::Heating,
            outside_temperature: None,
        };
        assert!(store.upsert_installation(inst.clone(), at()));
        assert!(!store.upsert_installation(inst.clone(), at()));
        let offline = Installation { online: false, ..inst };
        assert!(store.upsert_installation(offline, at()));
        assert!(!store.installation(&InstallationId("A".into())).unwrap().installation.online);
    }
}
