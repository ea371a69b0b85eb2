//! Pub/sub bus seam and its MQTT transport.
//!
//! The bridge only needs `publish` and `subscribe`; everything inbound is
//! delivered as [`BridgeEvent`]s into the same queue the timers use.
//! Publishing while disconnected fails fast: nothing is queued locally, the
//! full re-publish after reconnect restores the retained state. While
//! connected, publishing waits for room in the client's request queue so a
//! re-publish larger than the queue is delivered in full.

use chrono::Utc;
use log::{debug, info, warn};
use rumqttc::{Client, Connection, Event, LastWill, MqttOptions, Packet, QoS};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::models::climate::{Update, UpdateSource};
use crate::services::bridge::{BridgeEvent, BridgeHandle};
use crate::topics::{Inbound, OFFLINE, Topics};
use crate::translator::Command;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
    pub retained: bool,
}

impl Message {
    pub fn retained(topic: String, payload: impl Into<String>) -> Self {
        Message {
            topic,
            payload: payload.into(),
            retained: true,
        }
    }

    /// Empty retained payload: removes the topic's retained message.
    pub fn clear(topic: String) -> Self {
        Message::retained(topic, "")
    }
}

#[derive(Debug)]
pub enum BusError {
    Disconnected,
    Client(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Disconnected => write!(f, "bus not connected"),
            BusError::Client(e) => write!(f, "bus client error: {}", e),
        }
    }
}

impl std::error::Error for BusError {}

impl From<rumqttc::ClientError> for BusError {
    fn from(value: rumqttc::ClientError) -> Self {
        BusError::Client(value.to_string())
    }
}

pub trait Bus: Send {
    fn publish(&self, message: &Message) -> Result<(), BusError>;
    fn subscribe(&self, topic: &str) -> Result<(), BusError>;
    /// Orderly disconnect at shutdown.
    fn close(&self) {}
}

#[derive(Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive: Duration,
}

impl fmt::Debug for MqttSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

pub struct MqttBus {
    client: Client,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
}

impl MqttBus {
    /// Configure the client and start the connection thread. The thread
    /// reports connection changes and inbound messages to `events`; the
    /// returned flag tracks whether the broker session is up.
    pub fn connect(
        settings: &MqttSettings,
        topics: Topics,
        events: BridgeHandle,
    ) -> Result<(MqttBus, Arc<AtomicBool>, JoinHandle<()>), String> {
        let mut options = MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(true);
        if let Some(user) = &settings.username {
            options.set_credentials(user.clone(), settings.password.clone().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            topics.bridge_availability(),
            OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let closing = Arc::new(AtomicBool::new(false));
        info!("Bus: connecting to {}:{} as {}", settings.host, settings.port, settings.client_id);

        let handle = {
            let connected = connected.clone();
            let closing = closing.clone();
            thread::Builder::new()
                .name("mqtt".into())
                .spawn(move || connection_loop(connection, topics, events, connected, closing))
                .map_err(|e| format!("spawning mqtt thread failed: {}", e))?
        };

        Ok((
            MqttBus {
                client,
                connected: connected.clone(),
                closing,
            },
            connected,
            handle,
        ))
    }
}

impl Bus for MqttBus {
    fn publish(&self, message: &Message) -> Result<(), BusError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }
        self.client.publish(
            message.topic.clone(),
            QoS::AtLeastOnce,
            message.retained,
            message.payload.clone().into_bytes(),
        )?;
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }
        self.client.try_subscribe(topic, QoS::AtLeastOnce)?;
        Ok(())
    }

    fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let requested = if self.connected.load(Ordering::SeqCst) {
            self.client.disconnect()
        } else {
            self.client.try_disconnect()
        };
        if let Err(e) = requested {
            debug!("Bus: disconnect request failed: {}", e);
        }
    }
}

fn connection_loop(
    mut connection: Connection,
    topics: Topics,
    events: BridgeHandle,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
) {
    for notification in connection.iter() {
        let delivered = match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::SeqCst);
                info!("Bus: connected");
                events.send(BridgeEvent::BusConnected)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => match std::str::from_utf8(&publish.payload) {
                Ok(payload) => match route_inbound(&topics, &publish.topic, payload) {
                    Some(event) => events.send(event),
                    None => true,
                },
                Err(_) => {
                    warn!("Bus: ignoring non-UTF-8 payload on {}", publish.topic);
                    true
                }
            },
            Ok(Event::Incoming(Packet::Disconnect)) | Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                true
            }
            Ok(_) => true,
            Err(e) => {
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                let was_connected = connected.swap(false, Ordering::SeqCst);
                warn!("Bus: connection error: {}; retrying in {}s", e, RECONNECT_DELAY.as_secs());
                let delivered = !was_connected || events.send(BridgeEvent::BusDisconnected);
                thread::sleep(RECONNECT_DELAY);
                delivered
            }
        };
        if !delivered {
            debug!("Bus: bridge gone, stopping connection thread");
            break;
        }
    }
    connected.store(false, Ordering::SeqCst);
}

/// Turn an inbound message into a bridge event. Unknown topics and
/// unparsable payloads are dropped with a log line.
pub fn route_inbound(topics: &Topics, topic: &str, payload: &str) -> Option<BridgeEvent> {
    let Some(inbound) = topics.parse_inbound(topic) else {
        debug!("Bus: ignoring message on {}", topic);
        return None;
    };
    let (zone_id, field, is_command) = match inbound {
        Inbound::Command { zone_id, field } => (zone_id, field, true),
        Inbound::Report { zone_id, field } => (zone_id, field, false),
    };
    let Some(value) = field.parse_value(payload) else {
        warn!("Bus: invalid {} payload {:?} on {}", field, payload, topic);
        return None;
    };
    Some(if is_command {
        BridgeEvent::Command(Command { zone_id, field, value })
    } else {
        BridgeEvent::Push(Update {
            zone_id,
            field,
            value,
            source: UpdateSource::Push,
            timestamp: Utc::now(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::climate::{Field, FieldValue};
    use crate::models::cloud::{Celsius, ZoneId};

    fn topics() -> Topics {
        Topics::new("heatzone", "homeassistant", "hz")
    }

    #[test]
    fn command_topics_become_commands() {
        match route_inbound(&topics(), "heatzone/zone/Z_5F1/target_temperature/set", "21.5") {
            Some(BridgeEvent::Command(c)) => {
                assert_eq!(c.zone_id, ZoneId("Z_1".into()));
                assert_eq!(c.field, Field::TargetTemperature);
                assert_eq!(c.value, FieldValue::Temperature(Celsius::from_tenths(215)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn report_topics_become_push_updates() {
        match route_inbound(&topics(), "heatzone/zone/Z/humidity/report", "47") {
            Some(BridgeEvent::Push(u)) => {
                assert_eq!(u.source, UpdateSource::Push);
                assert_eq!(u.value, FieldValue::Percent(47));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_payloads_and_topics_are_dropped() {
        assert!(route_inbound(&topics(), "heatzone/zone/Z/target_temperature/set", "warm").is_none());
        assert!(route_inbound(&topics(), "heatzone/zone/Z/target_temperature/state", "21").is_none());
        assert!(route_inbound(&topics(), "elsewhere", "21").is_none());
    }

    #[test]
    fn clear_is_an_empty_retained_message() {
        let m = Message::clear("a/b".into());
        assert!(m.retained);
        assert!(m.payload.is_empty());
    }

    /// Minimal MQTT 3.1.1 peer: acknowledges the connection and QoS 1
    /// publishes, answers pings, and counts publishes until DISCONNECT.
    fn serve_one(listener: std::net::TcpListener) -> usize {
        use std::io::{Read, Write};
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut published = 0;
        loop {
            let mut header = [0u8; 1];
            if stream.read_exact(&mut header).is_err() {
                break;
            }
            let (mut length, mut shift) = (0usize, 0);
            loop {
                let mut byte = [0u8; 1];
                stream.read_exact(&mut byte).unwrap();
                length |= ((byte[0] & 0x7f) as usize) << shift;
                shift += 7;
                if byte[0] & 0x80 == 0 {
                    break;
                }
            }
            let mut body = vec![0u8; length];
            stream.read_exact(&mut body).unwrap();
            match header[0] >> 4 {
                1 => stream.write_all(&[0x20, 0x02, 0x00, 0x00]).unwrap(),
                3 => {
                    published += 1;
                    if (header[0] >> 1) & 0x03 > 0 {
                        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                        let pkid = &body[2 + topic_len..4 + topic_len];
                        stream.write_all(&[0x40, 0x02, pkid[0], pkid[1]]).unwrap();
                    }
                }
                12 => stream.write_all(&[0xd0, 0x00]).unwrap(),
                14 => break,
                _ => {}
            }
        }
        published
    }

    #[test]
    fn publishing_more_than_the_request_queue_holds_delivers_everything() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = thread::spawn(move || serve_one(listener));

        let settings = MqttSettings {
            host: "127.0.0.1".into(),
            port,
            username: None,
            password: None,
            client_id: "hz-test".into(),
            keep_alive: Duration::from_secs(30),
        };
        let (handle, _events) = BridgeHandle::channel();
        let (bus, connected, connection) = MqttBus::connect(&settings, topics(), handle).unwrap();
        let started = std::time::Instant::now();
        while !connected.load(Ordering::SeqCst) {
            assert!(started.elapsed() < Duration::from_secs(10), "never connected");
            thread::sleep(Duration::from_millis(10));
        }

        let total = REQUEST_CAPACITY * 2 + 10;
        let failed = (0..total)
            .filter(|i| {
                bus.publish(&Message::retained(format!("heatzone/zone/Z{i}/target_temperature/state"), "21.5"))
                    .is_err()
            })
            .count();
        assert_eq!(failed, 0);

        bus.close();
        connection.join().unwrap();
        assert_eq!(broker.join().unwrap(), total);
    }
}
