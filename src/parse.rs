//! Parsers for the cloud's installation, listing and live-data payloads.
//!
//! Installation payload (`GET /installations/{id}`):
//!
//! ```json
//! {
//!   "id": "INST-1", "name": "Home", "address": "…", "firmware": "2.1.0",
//!   "online": true, "mode": "heating", "outside_temperature": 545,
//!   "zones": [
//!     { "id": "Z-9f2", "controller": 1, "number": 1, "name": "Living", "group": "Ground floor",
//!       "channels": [
//!         { "id": "C-1", "temperature": 716, "setpoint": 707,
//!           "setpoint_min": 410, "setpoint_max": 986, "humidity": 45, "mode": 0,
//!           "heating": true, "cooling": false, "locked": false, "ring_light": true,
//!           "battery_low": false, "window_open": false } ] } ]
//! }
//! ```
//!
//! Live payload (`GET /installations/{id}/live`):
//!
//! ```json
//! { "mixed_circuits": [ { "id": "MC1", "name": "Floor loop", "flow_temperature": 1022, "pump": true } ],
//!   "digital_io": [ { "id": "IO1", "name": "Boiler relay", "state": true } ] }
//! ```
//!
//! All temperatures are °F×10 integers.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::extract::{Obj, ParseError};
use crate::models::cloud::*;
use crate::temperature;

fn temperature_field(o: &Obj<'_>, key: &str) -> Option<Temperature> {
    o.int(key).and_then(temperature::reading)
}

fn heating_mode(o: &Obj<'_>) -> HeatingMode {
    match o.str("mode").map(|s| s.to_ascii_lowercase()).as_deref() {
        Some("heating") | Some("heat") | Some("0") => HeatingMode::Heating,
        Some("cooling") | Some("cool") | Some("1") => HeatingMode::Cooling,
        _ => HeatingMode::Unknown,
    }
}

/// `GET /installations` → `{ "installations": [ { "id": …, "name": … } ] }`
pub fn parse_installation_list(value: &Value) -> Result<Vec<InstallationSummary>, ParseError> {
    let root = Obj::root(value, "$")?;
    let (items, _bad) = root.objects("installations")?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let id = item.req_str("id")?;
        let name = item.str("name").unwrap_or_else(|| id.clone());
        out.push(InstallationSummary {
            id: InstallationId(id),
            name,
        });
    }
    Ok(out)
}

pub fn parse_installation(value: &Value, fetched_at: DateTime<Utc>) -> Result<InstallationSnapshot, ParseError> {
    let root = Obj::root(value, "$")?;
    let id = InstallationId(root.req_str("id")?);
    let installation = Installation {
        name: root.str("name").unwrap_or_else(|| id.0.clone()),
        address: root.str("address"),
        firmware: root.str("firmware"),
        online: root.flag_or("online", true),
        mode: heating_mode(&root),
        outside_temperature: temperature_field(&root, "outside_temperature"),
        id,
    };

    let (zone_objs, mut skipped) = root.objects("zones")?;
    let mut zones = Vec::with_capacity(zone_objs.len());
    let mut channels = Vec::new();
    let mut unreadable_zones = Vec::new();

    for z in zone_objs {
        let zone_id = match z.req_str("id") {
            Ok(id) => ZoneId(id),
            Err(e) => {
                skipped.push(e);
                continue;
            }
        };
        let (channel_objs, bad_channels) = match z.objects("channels") {
            Ok(v) => v,
            Err(e) => {
                skipped.push(e);
                unreadable_zones.push(zone_id);
                continue;
            }
        };
        skipped.extend(bad_channels);

        let mut channel_ids = Vec::with_capacity(channel_objs.len());
        for c in channel_objs {
            match parse_channel(&c, &zone_id) {
                Ok(channel) => {
                    channel_ids.push(channel.id.clone());
                    channels.push(channel);
                }
                Err(e) => skipped.push(e),
            }
        }

        zones.push(Zone {
            name: z.str("name").unwrap_or_else(|| zone_id.0.clone()),
            installation_id: installation.id.clone(),
            group: z.str("group"),
            controller: z.int("controller"),
            number: z.int("number"),
            channel_ids,
            id: zone_id,
        });
    }

    Ok(InstallationSnapshot {
        installation,
        zones,
        channels,
        skipped,
        unreadable_zones,
        fetched_at,
    })
}

fn parse_channel(c: &Obj<'_>, zone_id: &ZoneId) -> Result<Channel, ParseError> {
    let id = ChannelId(c.req_str("id")?);
    let humidity = c.float("humidity").filter(|h| (0.0..=100.0).contains(h));
    Ok(Channel {
        id,
        zone_id: zone_id.clone(),
        temperature: temperature_field(c, "temperature"),
        setpoint: temperature_field(c, "setpoint"),
        setpoint_min: temperature_field(c, "setpoint_min"),
        setpoint_max: temperature_field(c, "setpoint_max"),
        humidity,
        mode_code: c.int("mode"),
        can_heat: c.flag_or("heating", true),
        can_cool: c.flag_or("cooling", false),
        locked: c.flag_or("locked", false),
        ring_light: c.flag_or("ring_light", false),
        battery_low: c.flag_or("battery_low", false),
        window_open: c.flag_or("window_open", false),
    })
}

pub fn parse_live_data(
    installation_id: &InstallationId,
    value: &Value,
    fetched_at: DateTime<Utc>,
) -> Result<LiveSnapshot, ParseError> {
    let root = Obj::root(value, "$")?;
    let mut points = Vec::new();

    let (circuits, _) = root.objects("mixed_circuits")?;
    for mc in circuits {
        let Some(id) = mc.str("id") else { continue };
        let name = mc.str("name").unwrap_or_else(|| id.clone());
        if let Some(t) = temperature_field(&mc, "flow_temperature") {
            points.push(LivePoint {
                id: format!("{}_flow_temperature", id.to_ascii_lowercase()),
                name: format!("{} flow temperature", name),
                kind: LiveKind::MixedCircuit,
                value: LiveValue::Temperature(t),
            });
        }
        if let Some(t) = temperature_field(&mc, "return_temperature") {
            points.push(LivePoint {
                id: format!("{}_return_temperature", id.to_ascii_lowercase()),
                name: format!("{} return temperature", name),
                kind: LiveKind::MixedCircuit,
                value: LiveValue::Temperature(t),
            });
        }
        if let Some(on) = mc.flag("pump") {
            points.push(LivePoint {
                id: format!("{}_pump", id.to_ascii_lowercase()),
                name: format!("{} pump", name),
                kind: LiveKind::MixedCircuit,
                value: LiveValue::Flag(on),
            });
        }
        if let Some(pct) = mc.float("valve") {
            points.push(LivePoint {
                id: format!("{}_valve", id.to_ascii_lowercase()),
                name: format!("{} valve", name),
                kind: LiveKind::MixedCircuit,
                value: LiveValue::Number(pct),
            });
        }
    }

    let (ios, _) = root.objects("digital_io")?;
    for io in ios {
        let Some(id) = io.str("id") else { continue };
        let Some(state) = io.flag("state") else { continue };
        points.push(LivePoint {
            name: io.str("name").unwrap_or_else(|| id.clone()),
            id: id.to_ascii_lowercase(),
            kind: LiveKind::DigitalIo,
            value: LiveValue::Flag(state),
        });
    }

    Ok(LiveSnapshot {
        installation_id: installation_id.clone(),
        points,
        fetched_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-10T08:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn installation_payload() -> Value {
        json!({
            "id": "INST-1",
            "name": "Chalet",
            "firmware": "2.1.0",
            "online": "1",
            "mode": "heating",
            "outside_temperature": 545,
            "zones": [
                {
                    "id": "Z-a", "controller": 1, "number": 1, "name": "Living", "group": "Ground",
                    "channels": [
                        { "id": "C-1", "temperature": 716, "setpoint": "707", "setpoint_min": 410,
                          "setpoint_max": 986, "humidity": 45, "mode": 0, "heating": 1, "cooling": 0,
                          "locked": false, "ring_light": true, "battery_low": "0", "window_open": false }
                    ]
                },
                {
                    "id": "Z-b", "controller": 2, "number": 1, "name": "Studio",
                    "channels": [ { "id": "C-2", "temperature": "n/a", "humidity": 230 } ]
                }
            ]
        })
    }

    #[test]
    fn parses_full_installation() {
        let snap = parse_installation(&installation_payload(), now()).unwrap();
        let inst = &snap.installation;
        assert_eq!(inst.id, InstallationId("INST-1".into()));
        assert!(inst.online);
        assert_eq!(inst.mode, HeatingMode::Heating);
        assert_eq!(inst.outside_temperature.unwrap().celsius, Celsius::from_tenths(125));
        assert_eq!(inst.address, None);

        assert_eq!(snap.zones.len(), 2);
        assert_eq!(snap.zones[0].channel_ids, vec![ChannelId("C-1".into())]);
        assert_eq!(snap.zones[0].group.as_deref(), Some("Ground"));

        let c1 = &snap.channels[0];
        assert_eq!(c1.temperature.unwrap().celsius, Celsius::from_tenths(220));
        assert_eq!(c1.temperature.unwrap().raw, 716);
        assert_eq!(c1.setpoint.unwrap().celsius, Celsius::from_tenths(215));
        assert_eq!(c1.setpoint_min.unwrap().celsius, Celsius::from_tenths(50));
        assert_eq!(c1.humidity, Some(45.0));
        assert!(c1.can_heat && !c1.can_cool && c1.ring_light && !c1.battery_low);
        assert!(snap.skipped.is_empty());
    }

    #[test]
    fn duplicate_zone_numbers_keep_distinct_ids() {
        let snap = parse_installation(&installation_payload(), now()).unwrap();
        assert_eq!(snap.zones[0].number, snap.zones[1].number);
        assert_ne!(snap.zones[0].id, snap.zones[1].id);
        assert_eq!(snap.channels_of(&ZoneId("Z-b".into())).count(), 1);
    }

    #[test]
    fn mistyped_optional_fields_read_as_absent() {
        let snap = parse_installation(&installation_payload(), now()).unwrap();
        let c2 = &snap.channels[1];
        assert_eq!(c2.temperature, None);
        assert_eq!(c2.humidity, None);
        assert_eq!(c2.mode_code, None);
    }

    #[test]
    fn malformed_entries_are_skipped_with_named_errors() {
        let payload = json!({
            "id": "INST-1",
            "zones": [
                { "name": "no id" },
                "garbage",
                { "id": "Z-ok", "channels": [ { "id": "C-9" }, { "temperature": 700 } ] },
                { "id": "Z-bad-channels", "channels": "none" }
            ]
        });
        let snap = parse_installation(&payload, now()).unwrap();
        assert_eq!(snap.zones.len(), 1);
        assert_eq!(snap.zones[0].id, ZoneId("Z-ok".into()));
        assert_eq!(snap.channels.len(), 1);
        let paths: Vec<_> = snap.skipped.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"$.zones[1]"));
        assert!(paths.contains(&"$.zones[0].id"));
        assert!(paths.contains(&"$.zones[2].channels[1].id"));
        assert!(paths.contains(&"$.zones[3].channels"));
        assert_eq!(snap.unreadable_zones, vec![ZoneId("Z-bad-channels".into())]);
    }

    #[test]
    fn absurd_temperatures_read_as_absent() {
        let payload = json!({
            "id": "INST-1",
            "outside_temperature": i64::MIN,
            "zones": [ { "id": "Z", "channels": [ { "id": "C", "temperature": i64::MAX, "setpoint": 707 } ] } ]
        });
        let snap = parse_installation(&payload, now()).unwrap();
        assert_eq!(snap.installation.outside_temperature, None);
        assert_eq!(snap.channels[0].temperature, None);
        assert_eq!(snap.channels[0].setpoint.unwrap().celsius, Celsius::from_tenths(215));
    }

    #[test]
    fn structural_errors_fail_the_snapshot() {
        assert!(parse_installation(&json!("nope"), now()).is_err());
        assert!(parse_installation(&json!({"name": "no id"}), now()).is_err());
        let err = parse_installation(&json!({"id": "I", "zones": {"a": 1}}), now()).unwrap_err();
        assert_eq!(err.path, "$.zones");
    }

    #[test]
    fn parses_installation_listing() {
        let list = parse_installation_list(&json!({
            "installations": [ { "id": "A", "name": "Home" }, { "id": 42 } ]
        }))
        .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].id, InstallationId("42".into()));
        assert_eq!(list[1].name, "42");
    }

    #[test]
    fn parses_live_points() {
        let id = InstallationId("INST-1".into());
        let live = parse_live_data(
            &id,
            &json!({
                "mixed_circuits": [ { "id": "MC1", "name": "Floor", "flow_temperature": 1022, "pump": "1" } ],
                "digital_io": [ { "id": "IO1", "name": "Relay", "state": false }, { "id": "IO2" } ]
            }),
            now(),
        )
        .unwrap();
        let ids: Vec<_> = live.points.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["mc1_flow_temperature", "mc1_pump", "io1"]);
        assert_eq!(live.points[0].value.to_string(), "39.0");
        assert_eq!(live.points[1].value, LiveValue::Flag(true));
        assert_eq!(live.points[2].value.to_string(), "OFF");
    }

    #[test]
    fn live_data_with_wrong_shape_is_a_parse_error() {
        let id = InstallationId("INST-1".into());
        let err = parse_live_data(&id, &json!({"digital_io": 3}), now()).unwrap_err();
        assert_eq!(err.path, "$.digital_io");
    }
}
