//! Bus topic layout.
//!
//! ```text
//! P/bridge/availability                 online | offline (retained, last will)
//! P/zone/Z/availability                 online | offline (retained)
//! P/zone/Z/<field>/state                resolved value (retained)
//! P/zone/Z/attributes                   channel flags as JSON (retained)
//! P/zone/Z/<field>/set                  local command ingress
//! P/zone/Z/<field>/report               device push ingress
//! P/installation/I/state                installation JSON (retained)
//! P/installation/I/live/<sensor>        diagnostic value (retained)
//! D/climate/<node>/Z/config             discovery
//! D/<component>/<node>/I__<sensor>/config
//! ```
//!
//! Zone and installation ids are escaped into a single segment: ASCII
//! letters, digits and `-` pass through, every other byte is written as `_XX`.
//! The escaping is reversible, so two distinct ids never share a topic.

use crate::models::climate::Field;
use crate::models::cloud::{InstallationId, ZoneId};

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

/// Escape an id into one topic segment.
pub fn encode_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{:02X}", b));
        }
    }
    out
}

/// Inverse of [`encode_segment`]. `None` for anything it could not produce.
pub fn decode_segment(segment: &str) -> Option<String> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                let hex = bytes.get(i + 1..i + 3)?;
                if !hex.iter().all(|c| matches!(c, b'0'..=b'9' | b'A'..=b'F')) {
                    return None;
                }
                let value = u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()?;
                if value.is_ascii_alphanumeric() || value == b'-' {
                    // Never produced by the encoder.
                    return None;
                }
                out.push(value);
                i += 3;
            }
            b if b.is_ascii_alphanumeric() || b == b'-' => {
                out.push(b);
                i += 1;
            }
            _ => return None,
        }
    }
    String::from_utf8(out).ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Command { zone_id: ZoneId, field: Field },
    Report { zone_id: ZoneId, field: Field },
}

#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
    discovery_prefix: String,
    node_id: String,
}

impl Topics {
    pub fn new(prefix: &str, discovery_prefix: &str, node_id: &str) -> Self {
        Topics {
            prefix: prefix.trim_end_matches('/').to_string(),
            discovery_prefix: discovery_prefix.trim_end_matches('/').to_string(),
            node_id: encode_segment(node_id),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn bridge_availability(&self) -> String {
        format!("{}/bridge/availability", self.prefix)
    }

    fn zone_base(&self, zone: &ZoneId) -> String {
        format!("{}/zone/{}", self.prefix, encode_segment(&zone.0))
    }

    pub fn zone_availability(&self, zone: &ZoneId) -> String {
        format!("{}/availability", self.zone_base(zone))
    }

    pub fn zone_attributes(&self, zone: &ZoneId) -> String {
        format!("{}/attributes", self.zone_base(zone))
    }

    pub fn zone_state(&self, zone: &ZoneId, field: Field) -> String {
        format!("{}/{}/state", self.zone_base(zone), field)
    }

    pub fn zone_command(&self, zone: &ZoneId, field: Field) -> String {
        format!("{}/{}/set", self.zone_base(zone), field)
    }

    pub fn zone_report(&self, zone: &ZoneId, field: Field) -> String {
        format!("{}/{}/report", self.zone_base(zone), field)
    }

    pub fn installation_state(&self, installation: &InstallationId) -> String {
        format!("{}/installation/{}/state", self.prefix, encode_segment(&installation.0))
    }

    pub fn live(&self, installation: &InstallationId, point_id: &str) -> String {
        format!(
            "{}/installation/{}/live/{}",
            self.prefix,
            encode_segment(&installation.0),
            encode_segment(point_id)
        )
    }

    /// Stable per-zone object id, also used as the entity's unique id.
    pub fn zone_object_id(&self, zone: &ZoneId) -> String {
        format!("{}_{}", self.node_id, encode_segment(&zone.0))
    }

    pub fn climate_config(&self, zone: &ZoneId) -> String {
        format!(
            "{}/climate/{}/{}/config",
            self.discovery_prefix,
            self.node_id,
            encode_segment(&zone.0)
        )
    }

    /// `__` never occurs inside an escaped segment, so the pair stays unique.
    pub fn sensor_object_id(&self, installation: &InstallationId, point_id: &str) -> String {
        format!("{}__{}", encode_segment(&installation.0), encode_segment(point_id))
    }

    pub fn sensor_config(&self, component: &str, installation: &InstallationId, point_id: &str) -> String {
        format!(
            "{}/{}/{}/{}/config",
            self.discovery_prefix,
            component,
            self.node_id,
            self.sensor_object_id(installation, point_id)
        )
    }

    pub fn bridge_config(&self) -> String {
        format!("{}/binary_sensor/{}/bridge/config", self.discovery_prefix, self.node_id)
    }

    /// Wildcard subscriptions covering every inbound topic.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            format!("{}/zone/+/+/set", self.prefix),
            format!("{}/zone/+/+/report", self.prefix),
        ]
    }

    pub fn parse_inbound(&self, topic: &str) -> Option<Inbound> {
        let rest = topic.strip_prefix(&self.prefix)?.strip_prefix("/zone/")?;
        let mut parts = rest.split('/');
        let (zone, field, verb) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        let zone_id = ZoneId(decode_segment(zone).filter(|z| !z.is_empty())?);
        let field = Field::parse(field)?;
        match verb {
            "set" => Some(Inbound::Command { zone_id, field }),
            "report" => Some(Inbound::Report { zone_id, field }),
            _ => None,
        }
    }
}
