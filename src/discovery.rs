//! Home Assistant style discovery and JSON state payloads.

use serde_json::{Value, json};

use crate::models::climate::{Field, MODE_AUTO, MODE_COOL, MODE_HEAT, MODE_OFF};
use crate::models::cloud::{Installation, InstallationId, LiveKind, LivePoint, LiveValue};
use crate::referential::ReferentialTable;
use crate::store::ZoneRecord;
use crate::topics::Topics;

const MANUFACTURER: &str = "HeatZone";

fn bridge_device(topics: &Topics) -> Value {
    json!({
        "identifiers": [topics.node_id()],
        "name": "HeatZone bridge",
        "manufacturer": MANUFACTURER,
        "sw_version": env!("CARGO_PKG_VERSION"),
    })
}

/// `climate` entity for one zone, built from its current record.
pub fn climate_config(topics: &Topics, record: &ZoneRecord, referential: &ReferentialTable) -> Value {
    let zone_id = record.id();
    let object_id = topics.zone_object_id(zone_id);
    let (min, max) = record.setpoint_bounds();

    let mut modes = vec![MODE_OFF, MODE_AUTO];
    if record.can_heat() {
        modes.push(MODE_HEAT);
    }
    if record.can_cool() {
        modes.push(MODE_COOL);
    }

    let mut device = json!({
        "identifiers": [object_id],
        "name": record.zone.name,
        "manufacturer": MANUFACTURER,
        "model": "Zone",
        "via_device": topics.node_id(),
    });
    if let Some(group) = &record.zone.group {
        device["suggested_area"] = json!(group);
    }

    json!({
        "name": null,
        "unique_id": object_id,
        "device": device,
        "availability": [
            { "topic": topics.bridge_availability() },
            { "topic": topics.zone_availability(zone_id) },
        ],
        "availability_mode": "all",
        "current_temperature_topic": topics.zone_state(zone_id, Field::CurrentTemperature),
        "current_humidity_topic": topics.zone_state(zone_id, Field::Humidity),
        "temperature_state_topic": topics.zone_state(zone_id, Field::TargetTemperature),
        "temperature_command_topic": topics.zone_command(zone_id, Field::TargetTemperature),
        "mode_state_topic": topics.zone_state(zone_id, Field::Mode),
        "mode_command_topic": topics.zone_command(zone_id, Field::Mode),
        "modes": modes,
        "preset_mode_state_topic": topics.zone_state(zone_id, Field::Preset),
        "preset_mode_command_topic": topics.zone_command(zone_id, Field::Preset),
        "preset_modes": referential.presets(),
        "json_attributes_topic": topics.zone_attributes(zone_id),
        "min_temp": min.as_f64(),
        "max_temp": max.as_f64(),
        "temp_step": 0.5,
        "precision": 0.1,
        "temperature_unit": "C",
    })
}

/// Discovery component and config for a live-data point.
pub fn sensor_config(
    topics: &Topics,
    installation_id: &InstallationId,
    installation_name: Option<&str>,
    point: &LivePoint,
) -> (&'static str, Value) {
    let object_id = topics.sensor_object_id(installation_id, &point.id);
    let mut config = json!({
        "name": point.name,
        "unique_id": format!("{}_{}", topics.node_id(), object_id),
        "state_topic": topics.live(installation_id, &point.id),
        "availability_topic": topics.bridge_availability(),
        "entity_category": "diagnostic",
        "device": {
            "identifiers": [format!("{}_{}", topics.node_id(), installation_id)],
            "name": installation_name.unwrap_or(&installation_id.0),
            "manufacturer": MANUFACTURER,
            "model": "Installation",
            "via_device": topics.node_id(),
        },
    });
    let component = match &point.value {
        LiveValue::Flag(_) => {
            config["payload_on"] = json!("ON");
            config["payload_off"] = json!("OFF");
            if point.kind == LiveKind::MixedCircuit {
                config["device_class"] = json!("running");
            }
            "binary_sensor"
        }
        LiveValue::Temperature(_) => {
            config["device_class"] = json!("temperature");
            config["unit_of_measurement"] = json!("°C");
            config["state_class"] = json!("measurement");
            "sensor"
        }
        LiveValue::Number(_) => {
            config["unit_of_measurement"] = json!("%");
            config["state_class"] = json!("measurement");
            "sensor"
        }
    };
    (component, config)
}

/// Retained attributes document of a zone.
pub fn zone_attributes(record: &ZoneRecord) -> Value {
    let channels: Vec<Value> = record
        .channels
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "temperature_raw": c.temperature.map(|t| t.raw),
                "setpoint_raw": c.setpoint.map(|t| t.raw),
                "heating": c.can_heat,
                "cooling": c.can_cool,
                "locked": c.locked,
                "ring_light": c.ring_light,
                "battery_low": c.battery_low,
                "window_open": c.window_open,
            })
        })
        .collect();
    json!({
        "zone_id": record.zone.id,
        "installation_id": record.zone.installation_id,
        "group": record.zone.group,
        "controller": record.zone.controller,
        "zone_number": record.zone.number,
        "battery_low": record.channels.iter().any(|c| c.battery_low),
        "window_open": record.channels.iter().any(|c| c.window_open),
        "channels": channels,
    })
}

pub fn installation_state(installation: &Installation) -> Value {
    json!({
        "id": installation.id,
        "name": installation.name,
        "address": installation.address,
        "firmware": installation.firmware,
        "online": installation.online,
        "mode": installation.mode,
        "outside_temperature": installation.outside_temperature.map(|t| t.celsius),
    })
}

pub fn bridge_config(topics: &Topics) -> Value {
    json!({
        "name": "Bridge",
        "unique_id": format!("{}_bridge", topics.node_id()),
        "state_topic": topics.bridge_availability(),
        "payload_on": crate::topics::ONLINE,
        "payload_off": crate::topics::OFFLINE,
        "device_class": "connectivity",
        "entity_category": "diagnostic",
        "device": bridge_device(topics),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::tests::{snapshot, t, zone_json};
    use crate::reconcile::{ReconcilePolicy, Reconciler};
    use crate::models::cloud::ZoneId;
    use crate::parse;

    fn topics() -> Topics {
        Topics::new("heatzone", "homeassistant", "hz")
    }

    fn reconciler() -> Reconciler {
        let mut r = Reconciler::new(ReconcilePolicy::default());
        r.apply_snapshot(snapshot("I1", vec![zone_json("Z", 1, 707, 716)], t(0)));
        r
    }

    #[test]
    fn climate_config_points_at_zone_topics() {
        let r = reconciler();
        let record = r.store().zone(&ZoneId("Z".into())).unwrap();
        let cfg = climate_config(&topics(), record, r.referential());

        assert_eq!(cfg["unique_id"], "hz_Z");
        assert_eq!(cfg["temperature_command_topic"], "heatzone/zone/Z/target_temperature/set");
        assert_eq!(cfg["availability"][1]["topic"], "heatzone/zone/Z/availability");
        assert_eq!(cfg["modes"], json!(["off", "auto", "heat"]));
        assert_eq!(cfg["min_temp"], 5.0);
        assert_eq!(cfg["max_temp"], 37.0);
        let presets = cfg["preset_modes"].as_array().unwrap();
        assert!(presets.contains(&json!("eco")));
        assert!(!presets.contains(&json!("off")));
    }

    #[test]
    fn live_points_pick_component_by_value() {
        let id = InstallationId("I1".into());
        let live = parse::parse_live_data(
            &id,
            &json!({
                "mixed_circuits": [ { "id": "MC1", "flow_temperature": 1022, "pump": true } ],
                "digital_io": [ { "id": "IO1", "state": false } ]
            }),
            t(0),
        )
        .unwrap();

        let (component, cfg) = sensor_config(&topics(), &id, Some("Home"), &live.points[0]);
        assert_eq!(component, "sensor");
        assert_eq!(cfg["device_class"], "temperature");
        assert_eq!(cfg["device"]["name"], "Home");

        let (component, cfg) = sensor_config(&topics(), &id, None, &live.points[2]);
        assert_eq!(component, "binary_sensor");
        assert_eq!(cfg["payload_on"], "ON");
        assert_eq!(cfg["device"]["name"], "I1");
    }

    #[test]
    fn attributes_summarise_channel_flags() {
        let mut r = Reconciler::new(ReconcilePolicy::default());
        r.apply_snapshot(snapshot(
            "I1",
            vec![json!({ "id": "Z", "number": 4, "channels": [
                { "id": "c1", "temperature": 716, "battery_low": true },
                { "id": "c2", "window_open": "1" }
            ]})],
            t(0),
        ));
        let attrs = zone_attributes(r.store().zone(&ZoneId("Z".into())).unwrap());
        assert_eq!(attrs["battery_low"], true);
        assert_eq!(attrs["window_open"], true);
        assert_eq!(attrs["zone_number"], 4);
        assert_eq!(attrs["channels"][0]["temperature_raw"], 716);
        assert_eq!(attrs["channels"][1]["temperature_raw"], Value::Null);
    }

    #[test]
    fn installation_state_uses_celsius() {
        let r = reconciler();
        let record = r.store().installation(&InstallationId("I1".into())).unwrap();
        let state = installation_state(&record.installation);
        assert_eq!(state["mode"], "heating");
        assert_eq!(state["online"], true);
        assert_eq!(state["outside_temperature"], Value::Null);
    }
}
