/*!
 * Cross-device request scheduling.
 *
 * Devices queue outbound requests locally and report to the
 * [`RequestQueueManager`] when their queue may next be served. A single drain
 * task picks the device with the earliest ready time, lets it send one
 * request, and files it again at the time its quiet period ends. All devices
 * sharing a manager are thereby serialized onto one channel.
 */
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace};

use plmflow_core::clock::SharedClock;
use plmflow_core::config::SchedulerConfig;
use plmflow_core::logging::device_span;
use plmflow_core::types::InsteonAddress;
use plmflow_devices::{InsteonDevice, RequestScheduler};

use crate::error::{Error, Result};

/// Scheduler events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// The drain task started
    Started,
    /// The drain task stopped
    Stopped,
    /// A device's queue ran empty and the device was released
    QueueDrained(InsteonAddress),
}

enum Next {
    Ready(Arc<InsteonDevice>),
    Wait(i64),
    Idle,
}

/// Devices with queued work, ordered by ready time
#[derive(Debug, Default)]
struct ReadyQueues {
    by_time: BTreeMap<(i64, InsteonAddress), Arc<InsteonDevice>>,
    times: HashMap<InsteonAddress, i64>,
}

impl ReadyQueues {
    /// File `device` at `ready_time` unless it is already filed earlier
    fn insert_earliest(&mut self, device: Arc<InsteonDevice>, ready_time: i64) -> bool {
        let address = *device.address();
        if let Some(&current) = self.times.get(&address) {
            if current <= ready_time {
                return false;
            }
            self.by_time.remove(&(current, address));
        }
        self.file(address, device, ready_time);
        true
    }

    /// File `device` no earlier than `ready_time`, overriding an earlier entry
    fn insert_latest(&mut self, device: Arc<InsteonDevice>, ready_time: i64) {
        let address = *device.address();
        let ready_time = match self.times.remove(&address) {
            Some(current) => {
                self.by_time.remove(&(current, address));
                ready_time.max(current)
            }
            None => ready_time,
        };
        self.file(address, device, ready_time);
    }

    fn file(&mut self, address: InsteonAddress, device: Arc<InsteonDevice>, ready_time: i64) {
        self.times.insert(address, ready_time);
        self.by_time.insert((ready_time, address), device);
    }

    fn pop_ready(&mut self, now: i64) -> Next {
        match self.by_time.first_key_value() {
            None => return Next::Idle,
            Some((&(ready_time, _), _)) if ready_time > now => return Next::Wait(ready_time - now),
            Some(_) => {}
        }
        match self.by_time.pop_first() {
            Some(((_, address), device)) => {
                self.times.remove(&address);
                Next::Ready(device)
            }
            None => Next::Idle,
        }
    }
}

#[derive(Debug)]
struct Shared {
    queues: StdMutex<ReadyQueues>,
    wakeup: Notify,
    clock: SharedClock,
    idle_wait: Duration,
    event_tx: broadcast::Sender<SchedulerEvent>,
}

impl Shared {
    fn queues(&self) -> MutexGuard<'_, ReadyQueues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn process(&self, device: Arc<InsteonDevice>, now: i64) {
        let _span = device_span(device.address()).entered();
        match device.process_request_queue(now) {
            // add_queue may have filed the device while it was being served;
            // the quiet period still wins.
            Some(next) => self.queues().insert_latest(device, next),
            None => {
                trace!("request queue drained");
                let _ = self.event_tx.send(SchedulerEvent::QueueDrained(*device.address()));
            }
        }
    }

    async fn park(&self, duration: Duration) {
        tokio::select! {
            _ = time::sleep(duration) => {}
            _ = self.wakeup.notified() => {}
        }
    }
}

async fn drain(shared: Arc<Shared>) {
    loop {
        let now = shared.clock.now_millis();
        let next = shared.queues().pop_ready(now);
        match next {
            Next::Ready(device) => {
                shared.process(device, now);
                tokio::task::yield_now().await;
            }
            Next::Wait(millis) => shared.park(Duration::from_millis(millis.unsigned_abs())).await,
            Next::Idle => shared.park(shared.idle_wait).await,
        }
    }
}

/// Serializes request queues of many devices onto one channel
#[derive(Debug)]
pub struct RequestQueueManager {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    running: RwLock<bool>,
}

impl RequestQueueManager {
    /// Create a stopped manager
    pub fn new(clock: SharedClock, config: &SchedulerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            shared: Arc::new(Shared {
                queues: StdMutex::new(ReadyQueues::default()),
                wakeup: Notify::new(),
                clock,
                idle_wait: Duration::from_millis(config.idle_wait_ms),
                event_tx,
            }),
            task: Mutex::new(None),
            running: RwLock::new(false),
        }
    }

    /// Subscribe to scheduler events
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Start the drain task
    pub async fn start(&self) -> Result<()> {
        if self.shared.idle_wait.is_zero() {
            return Err(Error::scheduler("idle wait must be positive"));
        }

        let mut running = self.running.write().await;
        if *running {
            return Ok(());
        }
        *running = true;

        let shared = Arc::clone(&self.shared);
        *self.task.lock().await = Some(tokio::spawn(drain(shared)));

        if let Err(e) = self.shared.event_tx.send(SchedulerEvent::Started) {
            debug!("no subscribers for scheduler start: {}", e);
        }
        info!("request queue manager started");
        Ok(())
    }

    /// Stop the drain task. Queued work is kept for the next start.
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

        if let Err(e) = self.shared.event_tx.send(SchedulerEvent::Stopped) {
            debug!("no subscribers for scheduler stop: {}", e);
        }
        info!("request queue manager stopped");
        Ok(())
    }

    /// Whether the drain task is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Number of devices waiting to be served
    pub fn pending(&self) -> usize {
        self.shared.queues().times.len()
    }

    /// When `address` will next be served, if it is waiting
    pub fn ready_time(&self, address: &InsteonAddress) -> Option<i64> {
        self.shared.queues().times.get(address).copied()
    }
}

impl RequestScheduler for RequestQueueManager {
    fn add_queue(&self, device: Arc<InsteonDevice>, ready_time: i64) {
        let address = *device.address();
        if self.shared.queues().insert_earliest(device, ready_time) {
            trace!("queue of {} ready at {}", address, ready_time);
        }
        self.shared.wakeup.notify_one();
    }
}

impl Drop for RequestQueueManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
