//! Passive per-interface packet observation.
//!
//! One observer per `(device, interface)`, each driving a line-buffered
//! tcpdump child inside the device's namespace. Records are parsed into
//! typed events and published to a single global fan-out; subscribers hold
//! their own bounded queues. Observation never touches qdiscs, filters, or
//! routes — installing or removing an observer cannot change delivery.

pub mod parse;

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{EventSender, SystemEvent};

pub use parse::{PacketEvent, PacketKind, Protocol, parse_record};

/// Fan-out capacity; slow subscribers see `Lagged` and report drops.
pub const FANOUT_CAPACITY: usize = 1024;

/// Restart schedule after unexpected capture exits. A fourth consecutive
/// failure marks the observer failed.
const RESTART_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(2),
];

/// An uptime long enough to call the capture healthy again.
const HEALTHY_UPTIME: Duration = Duration::from_secs(10);

struct ObserverHandle {
    cancel: CancellationToken,
}

pub struct ObserverManager {
    observers: StdMutex<FxHashMap<(String, String), ObserverHandle>>,
    fanout: broadcast::Sender<Arc<PacketEvent>>,
    events: EventSender,
    malformed: AtomicU64,
}

impl ObserverManager {
    pub fn new(events: EventSender) -> Arc<Self> {
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        Arc::new(Self {
            observers: StdMutex::new(FxHashMap::default()),
            fanout,
            events,
            malformed: AtomicU64::new(0),
        })
    }

    /// New subscriber to the global event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PacketEvent>> {
        self.fanout.subscribe()
    }

    /// Start observing `(device, iface)`. Starting an already-observed
    /// interface is a no-op.
    pub fn start(self: &Arc<Self>, device: &str, iface: &str) {
        let key = (device.to_string(), iface.to_string());
        let mut observers = self.observers.lock().unwrap();
        if observers.contains_key(&key) {
            return;
        }
        let cancel = CancellationToken::new();
        observers.insert(key, ObserverHandle { cancel: cancel.clone() });
        drop(observers);

        let manager = self.clone();
        let device = device.to_string();
        let iface = iface.to_string();
        tokio::spawn(async move {
            manager.run_capture(&device, &iface, cancel).await;
        });
    }

    /// Stop one observer. Idempotent.
    pub fn stop(&self, device: &str, iface: &str) {
        let handle = self
            .observers
            .lock()
            .unwrap()
            .remove(&(device.to_string(), iface.to_string()));
        if let Some(handle) = handle {
            handle.cancel.cancel();
            debug!(device, iface, "observer stopped");
        }
    }

    /// Stop every observer on a device (device removal).
    pub fn stop_device(&self, device: &str) {
        let doomed: Vec<ObserverHandle> = {
            let mut observers = self.observers.lock().unwrap();
            let keys: Vec<(String, String)> = observers
                .keys()
                .filter(|(d, _)| d == device)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| observers.remove(k)).collect()
        };
        for handle in doomed {
            handle.cancel.cancel();
        }
    }

    pub fn stop_all(&self) {
        let doomed: Vec<ObserverHandle> = {
            let mut observers = self.observers.lock().unwrap();
            observers.drain().map(|(_, h)| h).collect()
        };
        for handle in doomed {
            handle.cancel.cancel();
        }
    }

    pub fn count(&self) -> usize {
        self.observers.lock().unwrap().len()
    }

    pub fn malformed_records(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Capture loop: run tcpdump, restart on unexpected exit with bounded
    /// backoff, give up (and report once) after the budget is spent.
    async fn run_capture(&self, device: &str, iface: &str, cancel: CancellationToken) {
        let mut failures: usize = 0;
        loop {
            let started = Instant::now();
            let exit = tokio::select! {
                _ = cancel.cancelled() => return,
                res = self.capture_once(device, iface, &cancel) => res,
            };

            if cancel.is_cancelled() {
                return;
            }
            if started.elapsed() >= HEALTHY_UPTIME {
                failures = 0;
            }

            match exit {
                Ok(()) => warn!(device, iface, "capture process exited"),
                Err(e) => warn!(device, iface, error = %e, "capture process failed"),
            }

            if failures >= RESTART_BACKOFF.len() {
                let reason = "capture restart budget exhausted".to_string();
                let _ = self.events.send(SystemEvent::ObserverFailed {
                    device: device.to_string(),
                    iface: iface.to_string(),
                    reason,
                });
                self.stop(device, iface);
                return;
            }

            let backoff = RESTART_BACKOFF[failures];
            failures += 1;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// One tcpdump run: spawn, join continuation lines into records, parse,
    /// publish. Returns when the process exits or `cancel` fires.
    async fn capture_once(
        &self,
        device: &str,
        iface: &str,
        cancel: &CancellationToken,
    ) -> std::io::Result<()> {
        let mut child = tokio::process::Command::new("ip")
            .args([
                "netns", "exec", device, "tcpdump", "-i", iface, "-l", "-n", "-tt", "-e", "-v",
                "-s", "96", "not", "port", "22",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        debug!(device, iface, "capture started");

        let stdout = child.stdout.take().expect("stdout piped");
        let mut lines = BufReader::new(stdout).lines();
        // Verbose tcpdump wraps one record across indented continuation
        // lines; records are joined before parsing.
        let mut pending: Option<String> = None;

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Ok(());
                }
                line = lines.next_line() => line?,
            };

            let Some(line) = line else { break };
            if line.starts_with(|c: char| c.is_ascii_whitespace()) {
                if let Some(record) = pending.as_mut() {
                    record.push(' ');
                    record.push_str(line.trim());
                }
                continue;
            }
            if let Some(record) = pending.take() {
                self.publish(device, iface, &record);
            }
            pending = Some(line);
        }

        if let Some(record) = pending.take() {
            self.publish(device, iface, &record);
        }

        let _ = child.wait().await;
        Ok(())
    }

    fn publish(&self, device: &str, iface: &str, record: &str) {
        match parse_record(device, iface, record) {
            Some(event) => {
                // No receivers is fine; events are fire-and-forget.
                let _ = self.fanout.send(Arc::new(event));
            }
            None => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
