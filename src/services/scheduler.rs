//! Bridge Scheduler: the interval timers and the command worker.
//!
//! Every timer runs on its own thread with a steady cadence and hands its
//! result to the bridge queue; none of them touches zone state directly.

use log::{debug, info, trace, warn};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::models::cloud::InstallationId;
use crate::services::bridge::{BridgeEvent, BridgeHandle};
use crate::services::poller::{CloudPoller, PollError};
use crate::translator::{CloudCommand, CommandError};

/// Upper bound of the random delay before the first live-data fetch.
const STARTUP_JITTER_MS: u64 = 3_000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Intervals {
    pub poll: Duration,
    pub live: Duration,
    pub referential: Duration,
    pub token_refresh: Duration,
}

/// One-shot stop flag that sleeping threads can wait on.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`. Returns `true` as soon as the signal is stopped.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Run `tick` every `interval` until `stop`, measuring from the start of
/// each tick.
pub fn spawn_timer<F>(
    name: &'static str,
    interval: Duration,
    initial_delay: Duration,
    stop: StopSignal,
    mut tick: F,
) -> Result<JoinHandle<()>, String>
where
    F: FnMut() + Send + 'static,
{
    thread::Builder::new()
        .name(format!("timer-{name}"))
        .spawn(move || {
            if stop.wait(initial_delay) {
                return;
            }
            debug!("Scheduler: {} timer running every {}s", name, interval.as_secs());
            loop {
                let tick_start = Instant::now();
                tick();

                // Maintain steady cadence
                let elapsed = tick_start.elapsed();
                if stop.wait(interval.saturating_sub(elapsed)) {
                    break;
                }
            }
            debug!("Scheduler: {} timer stopped", name);
        })
        .map_err(|e| format!("spawning {} timer failed: {}", name, e))
}

/// Forward a failed fetch: fatal session errors end the bridge, anything
/// else waits for the next tick.
fn report(bridge: &BridgeHandle, prefix: &str, what: &str, error: PollError) {
    if error.is_fatal() {
        bridge.send(BridgeEvent::Fatal(error.to_string()));
    } else {
        warn!("{}: {} failed, retrying next tick: {}", prefix, what, error);
    }
}

pub struct Scheduler {
    stop: StopSignal,
    threads: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start all timers and the command worker. The first installation poll
    /// runs immediately; the referential and token timers first fire one
    /// full interval after start.
    pub fn start(
        poller: Arc<CloudPoller>,
        installations: Vec<InstallationId>,
        intervals: Intervals,
        bus_connected: Arc<AtomicBool>,
        bridge: BridgeHandle,
        commands: Receiver<CloudCommand>,
        stop: StopSignal,
    ) -> Result<Scheduler, String> {
        let installations = Arc::new(installations);
        let mut threads = Vec::with_capacity(5);

        threads.push({
            let (poller, installations, bridge, stop_tick) =
                (poller.clone(), installations.clone(), bridge.clone(), stop.clone());
            spawn_timer("poll", intervals.poll, Duration::ZERO, stop.clone(), move || {
                for id in installations.iter() {
                    if stop_tick.is_stopped() {
                        break;
                    }
                    match poller.fetch_installation(id) {
                        Ok(snapshot) => {
                            bridge.send(BridgeEvent::Snapshot(snapshot));
                        }
                        Err(e) => report(&bridge, "Poll", &format!("installation {}", id), e),
                    }
                }
            })?
        });

        threads.push({
            let (poller, installations, bridge, stop_tick) =
                (poller.clone(), installations.clone(), bridge.clone(), stop.clone());
            let jitter = Duration::from_millis(rand::rng().random_range(0..=STARTUP_JITTER_MS));
            spawn_timer("live", intervals.live, jitter, stop.clone(), move || {
                if !bus_connected.load(Ordering::SeqCst) {
                    trace!("Live: bus disconnected, skipping");
                    return;
                }
                for id in installations.iter() {
                    if stop_tick.is_stopped() {
                        break;
                    }
                    match poller.fetch_live_data(id) {
                        Ok(live) => {
                            bridge.send(BridgeEvent::Live(live));
                        }
                        Err(e) => report(&bridge, "Live", &format!("live data for {}", id), e),
                    }
                }
            })?
        });

        threads.push({
            let (poller, bridge) = (poller.clone(), bridge.clone());
            spawn_timer(
                "referential",
                intervals.referential,
                intervals.referential,
                stop.clone(),
                move || match poller.fetch_referential() {
                    Ok(table) => {
                        bridge.send(BridgeEvent::Referential(table));
                    }
                    Err(e) if e.is_fatal() => {
                        bridge.send(BridgeEvent::Fatal(e.to_string()));
                    }
                    Err(e) => warn!("Refs: reload failed, keeping the current table: {}", e),
                },
            )?
        });

        threads.push({
            let (poller, bridge) = (poller.clone(), bridge.clone());
            spawn_timer(
                "token",
                intervals.token_refresh,
                intervals.token_refresh,
                stop.clone(),
                move || match poller.session().refresh_tick() {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => {
                        bridge.send(BridgeEvent::Fatal(e.to_string()));
                    }
                    // Already logged by the session manager.
                    Err(e) => trace!("Session: refresh tick failed: {}", e),
                },
            )?
        });

        threads.push({
            let stop = stop.clone();
            thread::Builder::new()
                .name("commands".into())
                .spawn(move || command_worker(&poller, &commands, &bridge, &stop))
                .map_err(|e| format!("spawning command worker failed: {}", e))?
        });

        info!(
            "Scheduler: started for {} installation(s) (poll={}s, live={}s, referential={}s, token={}s)",
            installations.len(),
            intervals.poll.as_secs(),
            intervals.live.as_secs(),
            intervals.referential.as_secs(),
            intervals.token_refresh.as_secs()
        );
        Ok(Scheduler { stop, threads })
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Stop the timers and wait for every thread. The command worker exits
    /// once the bridge has dropped its command sender.
    pub fn stop(self) {
        self.stop.stop();
        for handle in self.threads {
            let name = handle.thread().name().unwrap_or("scheduler").to_string();
            if handle.join().is_err() {
                warn!("Scheduler: {} thread panicked", name);
            }
        }
        info!("Scheduler: stopped");
    }
}

/// Issue cloud calls for validated commands, one at a time and in order.
fn command_worker(poller: &CloudPoller, commands: &Receiver<CloudCommand>, bridge: &BridgeHandle, stop: &StopSignal) {
    for command in commands.iter() {
        let result = if stop.is_stopped() {
            Err(CommandError::ShuttingDown.to_string())
        } else {
            match poller.send_command(&command) {
                Ok(()) => Ok(()),
                Err(e) => {
                    if e.is_fatal() {
                        bridge.send(BridgeEvent::Fatal(e.to_string()));
                    }
                    Err(e.to_string())
                }
            }
        };
        if !bridge.send(BridgeEvent::CommandFinished { command, result }) {
            break;
        }
    }
    debug!("Scheduler: command worker stopped");
}
