/*!
 * Periodic device polling.
 *
 * On every tick the [`Poller`] asks each polled device whose interval has
 * elapsed to queue its poll requests, and reports devices that have stopped
 * answering.
 */
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use plmflow_core::config::Config;
use plmflow_core::types::InsteonAddress;
use plmflow_devices::SharedDeviceRegistry;

use crate::error::{Error, Result};

/// Poller events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerEvent {
    /// Poll requests were queued for a device
    Polled(InsteonAddress),
    /// A device has not answered its polls for longer than the dead device
    /// timeout. Reported once until the device is heard from again.
    DeviceDead {
        /// The silent device
        address: InsteonAddress,
        /// How long its last poll has gone unanswered, in milliseconds
        overdue: i64,
    },
}

#[derive(Debug)]
struct PollState {
    registry: SharedDeviceRegistry,
    dead_device_timeout: i64,
    dead: StdMutex<HashSet<InsteonAddress>>,
    event_tx: broadcast::Sender<PollerEvent>,
}

impl PollState {
    fn poll_once(&self) -> usize {
        let now = self.registry.services().clock.now_millis();
        let mut polled = 0;
        for device in self.registry.polled_devices() {
            let address = *device.address();
            if now - device.last_polled() >= device.poll_interval() {
                let queued = device.do_poll();
                trace!("{}: queued {} poll requests", address, queued);
                if queued > 0 {
                    polled += 1;
                    let _ = self.event_tx.send(PollerEvent::Polled(address));
                }
            }
            self.check_dead(address, device.poll_overdue_time());
        }
        polled
    }

    fn check_dead(&self, address: InsteonAddress, overdue: i64) {
        let mut dead = self.dead.lock().unwrap_or_else(PoisonError::into_inner);
        if overdue > self.dead_device_timeout {
            if dead.insert(address) {
                warn!("device {} has not answered polls for {} ms", address, overdue);
                let _ = self.event_tx.send(PollerEvent::DeviceDead { address, overdue });
            }
        } else if dead.remove(&address) {
            info!("device {} is answering again", address);
        }
    }
}

/// Drives periodic polling of the devices in a registry
#[derive(Debug)]
pub struct Poller {
    state: Arc<PollState>,
    tick: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    running: RwLock<bool>,
}

impl Poller {
    /// Create a stopped poller
    pub fn new(registry: SharedDeviceRegistry, tick: Duration, dead_device_timeout: i64) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            state: Arc::new(PollState {
                registry,
                dead_device_timeout,
                dead: StdMutex::new(HashSet::new()),
                event_tx,
            }),
            tick,
            task: Mutex::new(None),
            running: RwLock::new(false),
        }
    }

    /// Create a poller using the `scheduler` and `modem` config sections
    pub fn from_config(registry: SharedDeviceRegistry, config: &Config) -> Self {
        Self::new(
            registry,
            Duration::from_millis(config.scheduler.poll_tick_ms),
            config.modem.dead_device_timeout_ms,
        )
    }

    /// Subscribe to poller events
    pub fn subscribe(&self) -> broadcast::Receiver<PollerEvent> {
        self.state.event_tx.subscribe()
    }

    /// Run one polling pass now. Returns the number of devices that queued
    /// poll requests.
    pub fn poll_once(&self) -> usize {
        self.state.poll_once()
    }

    /// Start polling on every tick
    pub async fn start(&self) -> Result<()> {
        if self.tick.is_zero() {
            return Err(Error::poller("poll tick must be positive"));
        }

        let mut running = self.running.write().await;
        if *running {
            return Ok(());
        }
        *running = true;

        let state = Arc::clone(&self.state);
        let tick = self.tick;
        *self.task.lock().await = Some(tokio::spawn(async move {
            let mut interval = time::interval(tick);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let polled = state.poll_once();
                if polled > 0 {
                    debug!("polled {} devices", polled);
                }
            }
        }));

        info!("poller started with a {:?} tick", self.tick);
        Ok(())
    }

    /// Stop polling
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Ok(());
        }
        *running = false;

        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        info!("poller stopped");
        Ok(())
    }

    /// Whether the poller is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
