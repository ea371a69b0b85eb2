//! The bridge event loop.
//!
//! Timers, the bus connection thread and the command worker all feed one
//! queue; this loop is its only consumer and the only owner of the
//! [`Reconciler`], so every state change is applied in arrival order.

use chrono::Utc;
use log::{debug, info, trace, warn};
use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SendError, Sender};
use std::time::{Duration, Instant};

use crate::bus::{Bus, BusError, Message};
use crate::discovery;
use crate::models::climate::{Field, Update};
use crate::models::cloud::{InstallationSnapshot, LiveSnapshot};
use crate::reconcile::{Publication, Reconciler};
use crate::referential::ReferentialTable;
use crate::services::scheduler::StopSignal;
use crate::topics::{OFFLINE, ONLINE, Topics};
use crate::translator::{CloudCommand, Command, CommandError, CommandTranslator};

/// How often pending writes are checked for expiry.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum BridgeEvent {
    Snapshot(InstallationSnapshot),
    Live(LiveSnapshot),
    Referential(ReferentialTable),
    Push(Update),
    Command(Command),
    CommandFinished {
        command: CloudCommand,
        result: Result<(), String>,
    },
    BusConnected,
    BusDisconnected,
    Shutdown,
    Fatal(String),
}

/// Cloneable sender side of the bridge queue.
#[derive(Clone)]
pub struct BridgeHandle {
    tx: Sender<BridgeEvent>,
}

impl fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeHandle").finish_non_exhaustive()
    }
}

impl BridgeHandle {
    pub fn channel() -> (BridgeHandle, Receiver<BridgeEvent>) {
        let (tx, rx) = mpsc::channel();
        (BridgeHandle { tx }, rx)
    }

    /// `false` once the bridge loop has exited.
    pub fn send(&self, event: BridgeEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn shutdown(&self) {
        if !self.send(BridgeEvent::Shutdown) {
            debug!("Bridge: shutdown requested after exit");
        }
    }
}

enum Flow {
    Continue,
    Stop(Result<(), String>),
}

pub struct Bridge<B: Bus> {
    reconciler: Reconciler,
    translator: CommandTranslator,
    topics: Topics,
    bus: B,
    commands: Sender<CloudCommand>,
    stop: StopSignal,
    teardown: Duration,
    sweep_interval: Duration,
    accepting: bool,
    in_flight: usize,
}

impl<B: Bus> Bridge<B> {
    pub fn new(
        reconciler: Reconciler,
        topics: Topics,
        bus: B,
        commands: Sender<CloudCommand>,
        stop: StopSignal,
        teardown: Duration,
    ) -> Self {
        Bridge {
            reconciler,
            translator: CommandTranslator::new(),
            topics,
            bus,
            commands,
            stop,
            teardown,
            sweep_interval: SWEEP_INTERVAL,
            accepting: true,
            in_flight: 0,
        }
    }

    /// Process events until shutdown. Returns the fatal error, if that is
    /// what ended the loop.
    pub fn run(mut self, events: Receiver<BridgeEvent>) -> Result<(), String> {
        info!("Bridge: running");
        let mut last_sweep = Instant::now();
        let result = loop {
            match events.recv_timeout(self.sweep_interval.saturating_sub(last_sweep.elapsed())) {
                Ok(event) => {
                    if let Flow::Stop(result) = self.handle(event) {
                        break result;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Bridge: every event source is gone");
                    break Ok(());
                }
            }
            // A steady event stream must not starve expiry.
            if last_sweep.elapsed() >= self.sweep_interval {
                let pubs = self.reconciler.expire(Utc::now());
                self.publish(pubs);
                last_sweep = Instant::now();
            }
        };
        self.teardown(&events);
        result
    }

    fn handle(&mut self, event: BridgeEvent) -> Flow {
        match event {
            BridgeEvent::Snapshot(snapshot) => {
                let pubs = self.reconciler.apply_snapshot(snapshot);
                self.publish(pubs);
            }
            BridgeEvent::Live(live) => {
                let pubs = self.reconciler.apply_live(live);
                self.publish(pubs);
            }
            BridgeEvent::Referential(table) => {
                let pubs = self.reconciler.set_referential(table);
                self.publish(pubs);
            }
            BridgeEvent::Push(update) => {
                let pubs = self.reconciler.apply(update);
                self.publish(pubs);
            }
            BridgeEvent::Command(command) => self.on_command(command),
            BridgeEvent::CommandFinished { command, result } => self.on_command_finished(command, result),
            BridgeEvent::BusConnected => self.on_bus_connected(),
            BridgeEvent::BusDisconnected => {
                warn!("Bus: disconnected, publishes are dropped until the broker is back");
            }
            BridgeEvent::Shutdown => {
                info!("Bridge: shutdown requested");
                return Flow::Stop(Ok(()));
            }
            BridgeEvent::Fatal(message) => return Flow::Stop(Err(message)),
        }
        Flow::Continue
    }

    fn on_command(&mut self, command: Command) {
        if !self.accepting {
            warn!(
                "Command: zone {} {} rejected: {}",
                command.zone_id,
                command.field,
                CommandError::ShuttingDown
            );
            return;
        }
        let now = Utc::now();
        match self.translator.handle_command(&mut self.reconciler, command, now) {
            Ok((cloud, pubs)) => {
                self.publish(pubs);
                match self.commands.send(cloud) {
                    Ok(()) => self.in_flight += 1,
                    Err(SendError(cloud)) => {
                        let pubs = self
                            .translator
                            .command_failed(&mut self.reconciler, &cloud, "command worker stopped", now);
                        self.publish(pubs);
                    }
                }
            }
            Err(e) => warn!("Command: rejected: {}", e),
        }
    }

    fn on_command_finished(&mut self, command: CloudCommand, result: Result<(), String>) {
        self.in_flight = self.in_flight.saturating_sub(1);
        match result {
            Ok(()) => debug!("Command: {} accepted by the cloud", command.id),
            Err(reason) => {
                let pubs = self
                    .translator
                    .command_failed(&mut self.reconciler, &command, &reason, Utc::now());
                self.publish(pubs);
            }
        }
    }

    fn on_bus_connected(&mut self) {
        for topic in self.topics.subscriptions() {
            if let Err(e) = self.bus.subscribe(&topic) {
                warn!("Bus: subscribing to {} failed: {}", topic, e);
            }
        }
        self.send(Message::retained(
            self.topics.bridge_config(),
            discovery::bridge_config(&self.topics).to_string(),
        ));
        self.send(Message::retained(self.topics.bridge_availability(), ONLINE));
        let pubs = self.reconciler.republish_all();
        info!("Bus: connected, re-publishing {} item(s)", pubs.len());
        self.publish(pubs);
    }

    /// Stop the timers, refuse new commands and give in-flight results a
    /// bounded window to land before going offline.
    fn teardown(&mut self, events: &Receiver<BridgeEvent>) {
        self.accepting = false;
        self.stop.stop();
        let deadline = Instant::now() + self.teardown;
        while self.in_flight > 0 {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                warn!("Bridge: {} command(s) still in flight at teardown", self.in_flight);
                break;
            };
            match events.recv_timeout(remaining) {
                Ok(BridgeEvent::Shutdown | BridgeEvent::Fatal(_)) => {}
                Ok(event) => {
                    self.handle(event);
                }
                Err(_) => break,
            }
        }
        self.send(Message::retained(self.topics.bridge_availability(), OFFLINE));
        self.bus.close();
        info!("Bridge: stopped");
    }

    fn publish(&mut self, publications: Vec<Publication>) {
        for publication in publications {
            for message in self.render(publication) {
                self.send(message);
            }
        }
    }

    fn send(&self, message: Message) {
        match self.bus.publish(&message) {
            Ok(()) => trace!("Bus: {} <- {:?}", message.topic, message.payload),
            Err(BusError::Disconnected) => trace!("Bus: dropped {} (disconnected)", message.topic),
            Err(e) => warn!("Bus: publishing {} failed: {}", message.topic, e),
        }
    }

    fn render(&self, publication: Publication) -> Vec<Message> {
        let topics = &self.topics;
        let store = self.reconciler.store();
        match publication {
            Publication::Discovery(zone_id) => store
                .zone(&zone_id)
                .map(|record| {
                    let config = discovery::climate_config(topics, record, self.reconciler.referential());
                    vec![Message::retained(topics.climate_config(&zone_id), config.to_string())]
                })
                .unwrap_or_default(),
            Publication::ZoneRemoved(zone_id) => {
                let mut out = vec![
                    Message::clear(topics.climate_config(&zone_id)),
                    Message::clear(topics.zone_availability(&zone_id)),
                    Message::clear(topics.zone_attributes(&zone_id)),
                ];
                out.extend(Field::ALL.iter().map(|f| Message::clear(topics.zone_state(&zone_id, *f))));
                out
            }
            Publication::Availability { zone_id, available } => vec![Message::retained(
                topics.zone_availability(&zone_id),
                if available { ONLINE } else { OFFLINE },
            )],
            Publication::Attributes(zone_id) => store
                .zone(&zone_id)
                .map(|record| {
                    vec![Message::retained(
                        topics.zone_attributes(&zone_id),
                        discovery::zone_attributes(record).to_string(),
                    )]
                })
                .unwrap_or_default(),
            Publication::Field { zone_id, field, value } => {
                vec![Message::retained(topics.zone_state(&zone_id, field), value.to_string())]
            }
            Publication::FieldCleared { zone_id, field } => vec![Message::clear(topics.zone_state(&zone_id, field))],
            Publication::Installation(installation_id) => store
                .installation(&installation_id)
                .map(|record| {
                    vec![Message::retained(
                        topics.installation_state(&installation_id),
                        discovery::installation_state(&record.installation).to_string(),
                    )]
                })
                .unwrap_or_default(),
            Publication::Live {
                installation_id,
                point,
                announce,
            } => {
                let mut out = Vec::with_capacity(2);
                if announce {
                    let name = store
                        .installation(&installation_id)
                        .map(|r| r.installation.name.as_str());
                    let (component, config) = discovery::sensor_config(topics, &installation_id, name, &point);
                    out.push(Message::retained(
                        topics.sensor_config(component, &installation_id, &point.id),
                        config.to_string(),
                    ));
                }
                out.push(Message::retained(
                    topics.live(&installation_id, &point.id),
                    point.value.to_string(),
                ));
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::climate::{FieldValue, UpdateSource};
    use crate::models::cloud::{Celsius, ZoneId};
    use crate::reconcile::ReconcilePolicy;
    use crate::reconcile::tests::{snapshot, t, zone_json};
    use crate::translator::CloudAction;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingBus {
        messages: Arc<Mutex<Vec<Message>>>,
        subscriptions: Arc<Mutex<Vec<String>>>,
        connected: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
    }

    impl RecordingBus {
        fn connected() -> Self {
            let bus = RecordingBus::default();
            bus.connected.store(true, Ordering::SeqCst);
            bus
        }

        fn take(&self) -> Vec<Message> {
            std::mem::take(&mut *self.messages.lock().unwrap())
        }

        fn payload(messages: &[Message], topic: &str) -> Option<String> {
            messages.iter().rev().find(|m| m.topic == topic).map(|m| m.payload.clone())
        }
    }

    impl Bus for RecordingBus {
        fn publish(&self, message: &Message) -> Result<(), BusError> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(BusError::Disconnected);
            }
            self.messages.lock().unwrap().push(message.clone());
            Ok(())
        }

        fn subscribe(&self, topic: &str) -> Result<(), BusError> {
            self.subscriptions.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn topics() -> Topics {
        Topics::new("heatzone", "homeassistant", "hz")
    }

    fn bridge(bus: RecordingBus, policy: ReconcilePolicy) -> (Bridge<RecordingBus>, Receiver<CloudCommand>, StopSignal) {
        let (tx, rx) = mpsc::channel();
        let stop = StopSignal::new();
        let bridge = Bridge::new(
            Reconciler::new(policy),
            topics(),
            bus,
            tx,
            stop.clone(),
            Duration::from_millis(200),
        );
        (bridge, rx, stop)
    }

    fn setpoint(tenths: i32) -> Command {
        Command {
            zone_id: ZoneId("Z".into()),
            field: Field::TargetTemperature,
            value: FieldValue::Temperature(Celsius::from_tenths(tenths)),
        }
    }

    const TARGET_STATE: &str = "heatzone/zone/Z/target_temperature/state";

    #[test]
    fn reconnect_subscribes_and_republishes_everything() {
        let bus = RecordingBus::default();
        let (mut bridge, _commands, _stop) = bridge(bus.clone(), ReconcilePolicy::default());

        // Disconnected: state is kept, publishes are dropped.
        bridge.handle(BridgeEvent::Snapshot(snapshot("I1", vec![zone_json("Z", 1, 680, 716)], t(0))));
        assert!(bus.take().is_empty());

        bus.connected.store(true, Ordering::SeqCst);
        bridge.handle(BridgeEvent::BusConnected);
        let messages = bus.take();
        assert_eq!(
            *bus.subscriptions.lock().unwrap(),
            vec!["heatzone/zone/+/+/set", "heatzone/zone/+/+/report"]
        );
        assert_eq!(
            RecordingBus::payload(&messages, "heatzone/bridge/availability").as_deref(),
            Some("online")
        );
        assert!(RecordingBus::payload(&messages, "homeassistant/climate/hz/Z/config").is_some());
        assert_eq!(RecordingBus::payload(&messages, TARGET_STATE).as_deref(), Some("20.0"));
        assert_eq!(
            RecordingBus::payload(&messages, "heatzone/zone/Z/current_temperature/state").as_deref(),
            Some("22.0")
        );
        assert_eq!(
            RecordingBus::payload(&messages, "heatzone/zone/Z/availability").as_deref(),
            Some("online")
        );
        assert!(messages.iter().all(|m| m.retained));

        // Idempotent: a second reconnect publishes the same set again.
        bridge.handle(BridgeEvent::BusConnected);
        assert_eq!(bus.take().len(), messages.len());
    }

    #[test]
    fn commands_are_applied_then_forwarded() {
        let bus = RecordingBus::connected();
        let (mut bridge, commands, _stop) = bridge(bus.clone(), ReconcilePolicy::default());
        bridge.handle(BridgeEvent::Snapshot(snapshot("I1", vec![zone_json("Z", 1, 680, 716)], t(0))));
        bus.take();

        bridge.handle(BridgeEvent::Command(setpoint(215)));
        assert_eq!(RecordingBus::payload(&bus.take(), TARGET_STATE).as_deref(), Some("21.5"));
        let cloud = commands.try_recv().unwrap();
        assert_eq!(cloud.action, CloudAction::Setpoint(707));
        assert_eq!(bridge.in_flight, 1);

        // Out of range: nothing forwarded, nothing published.
        bridge.handle(BridgeEvent::Command(setpoint(400)));
        assert!(commands.try_recv().is_err());
        assert!(bus.take().is_empty());

        bridge.handle(BridgeEvent::CommandFinished {
            command: cloud,
            result: Err("http 500".into()),
        });
        assert_eq!(RecordingBus::payload(&bus.take(), TARGET_STATE).as_deref(), Some("20.0"));
        assert_eq!(bridge.in_flight, 0);
    }

    #[test]
    fn push_reports_flow_through_the_reconciler() {
        let bus = RecordingBus::connected();
        let (mut bridge, _commands, _stop) = bridge(bus.clone(), ReconcilePolicy::default());
        bridge.handle(BridgeEvent::Snapshot(snapshot("I1", vec![zone_json("Z", 1, 680, 716)], t(0))));
        bus.take();

        bridge.handle(BridgeEvent::Push(Update {
            zone_id: ZoneId("Z".into()),
            field: Field::Humidity,
            value: FieldValue::Percent(55),
            source: UpdateSource::Push,
            timestamp: t(10),
        }));
        assert_eq!(
            RecordingBus::payload(&bus.take(), "heatzone/zone/Z/humidity/state").as_deref(),
            Some("55")
        );
    }

    #[test]
    fn removed_zones_clear_their_retained_topics() {
        let bus = RecordingBus::connected();
        let policy = ReconcilePolicy {
            missed_polls_before_removal: 1,
            ..ReconcilePolicy::default()
        };
        let (mut bridge, _commands, _stop) = bridge(bus.clone(), policy);
        bridge.handle(BridgeEvent::Snapshot(snapshot("I1", vec![zone_json("Z", 1, 680, 716)], t(0))));
        bus.take();

        bridge.handle(BridgeEvent::Snapshot(snapshot("I1", vec![], t(60))));
        let messages = bus.take();
        for topic in [
            "homeassistant/climate/hz/Z/config",
            "heatzone/zone/Z/availability",
            "heatzone/zone/Z/attributes",
            TARGET_STATE,
        ] {
            assert_eq!(RecordingBus::payload(&messages, topic).as_deref(), Some(""), "{topic}");
        }
    }

    #[test]
    fn shutdown_drains_in_flight_commands_and_goes_offline() {
        let bus = RecordingBus::connected();
        let (mut bridge, commands, stop) = bridge(bus.clone(), ReconcilePolicy::default());
        bridge.handle(BridgeEvent::Snapshot(snapshot("I1", vec![zone_json("Z", 1, 680, 716)], t(0))));

        let (handle, events) = BridgeHandle::channel();
        handle.send(BridgeEvent::Command(setpoint(215)));
        handle.shutdown();
        handle.send(BridgeEvent::Command(setpoint(225)));

        // Stand-in for the command worker: fail whatever arrives.
        let worker = {
            let handle = handle.clone();
            std::thread::spawn(move || {
                for command in commands.iter() {
                    handle.send(BridgeEvent::CommandFinished {
                        command,
                        result: Err("shutting down".into()),
                    });
                }
            })
        };

        assert_eq!(bridge.run(events), Ok(()));
        worker.join().unwrap();

        assert!(stop.is_stopped());
        assert!(bus.closed.load(Ordering::SeqCst));
        let messages = bus.take();
        assert_eq!(messages.last().unwrap().topic, "heatzone/bridge/availability");
        assert_eq!(messages.last().unwrap().payload, "offline");
        // The first command was reverted, the second never applied.
        assert_eq!(RecordingBus::payload(&messages, TARGET_STATE).as_deref(), Some("20.0"));
        assert!(messages.iter().all(|m| m.payload != "22.5"));
    }

    #[test]
    fn expiry_runs_while_events_keep_arriving() {
        let bus = RecordingBus::connected();
        let policy = ReconcilePolicy {
            grace: chrono::TimeDelta::milliseconds(300),
            ..ReconcilePolicy::default()
        };
        let (mut bridge, _commands, _stop) = bridge(bus.clone(), policy);
        bridge.sweep_interval = Duration::from_millis(50);
        bridge.handle(BridgeEvent::Snapshot(snapshot("I1", vec![zone_json("Z", 1, 680, 716)], Utc::now())));
        bridge.handle(BridgeEvent::Command(setpoint(215)));
        for _ in 0..2 {
            std::thread::sleep(Duration::from_millis(5));
            bridge.handle(BridgeEvent::Snapshot(snapshot("I1", vec![zone_json("Z", 1, 716, 716)], Utc::now())));
        }
        // Two disagreeing polls inside the grace period: still held.
        assert_eq!(RecordingBus::payload(&bus.take(), TARGET_STATE).as_deref(), Some("21.5"));

        let (handle, events) = BridgeHandle::channel();
        let feeder = std::thread::spawn(move || {
            for i in 0..40 {
                handle.send(BridgeEvent::Push(Update {
                    zone_id: ZoneId("Z".into()),
                    field: Field::Humidity,
                    value: FieldValue::Percent(40 + i % 2),
                    source: UpdateSource::Push,
                    timestamp: Utc::now(),
                }));
                std::thread::sleep(Duration::from_millis(20));
            }
            handle.shutdown();
        });

        assert_eq!(bridge.run(events), Ok(()));
        feeder.join().unwrap();
        assert_eq!(RecordingBus::payload(&bus.take(), TARGET_STATE).as_deref(), Some("22.0"));
    }

    #[test]
    fn fatal_errors_end_the_loop_with_the_message() {
        let bus = RecordingBus::connected();
        let (bridge, _commands, _stop) = bridge(bus.clone(), ReconcilePolicy::default());
        let (handle, events) = BridgeHandle::channel();
        handle.send(BridgeEvent::Fatal("login rejected 3 times".into()));

        assert_eq!(bridge.run(events), Err("login rejected 3 times".to_string()));
        assert_eq!(
            RecordingBus::payload(&bus.take(), "heatzone/bridge/availability").as_deref(),
            Some("offline")
        );
    }
}
