//! PTY session management.
//!
//! Sessions are keyed by `(device, channel)`. The table entry, the open
//! master fd, and the live child stand or fall together: the pump task
//! removes the entry the moment the shell exits, and `close` tears all
//! three down on every other path (client close, device removal, server
//! shutdown).

mod session;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{EmuError, Result};
use crate::events::{EventSender, SystemEvent};

pub use session::PtySession;

type SessionKey = (String, String);

pub struct PtyManager {
    sessions: StdMutex<FxHashMap<SessionKey, Arc<PtySession>>>,
    events: EventSender,
    /// How long a detached session lives before close (reconnect window).
    grace: Duration,
}

impl PtyManager {
    pub fn new(events: EventSender, grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: StdMutex::new(FxHashMap::default()),
            events,
            grace,
        })
    }

    /// Open a session, spawning the shell and its pump task.
    /// Fails `AlreadyExists` when the key is taken.
    pub fn open(
        self: &Arc<Self>,
        device: &str,
        channel: &str,
        namespace: &str,
        rows: u16,
        cols: u16,
    ) -> Result<Arc<PtySession>> {
        let key = (device.to_string(), channel.to_string());
        {
            let sessions = self.sessions.lock().unwrap();
            if sessions.contains_key(&key) {
                return Err(EmuError::already_exists(format!(
                    "session {device}:{channel}"
                )));
            }
        }

        let session = Arc::new(PtySession::spawn(device, channel, namespace, rows, cols)?);
        session.mark_running();

        self.sessions
            .lock()
            .unwrap()
            .insert(key.clone(), session.clone());

        let manager = self.clone();
        let pumped = session.clone();
        tokio::spawn(async move {
            pumped.pump().await;
            // Shell exited (or we were cancelled): release everything.
            pumped.close().await;
            manager.forget(&key, &pumped);
            let _ = manager.events.send(SystemEvent::SessionExited {
                device: pumped.device.clone(),
                channel: pumped.channel.clone(),
            });
        });

        Ok(session)
    }

    /// Existing session, or a fresh one if the key is free.
    pub fn open_or_get(
        self: &Arc<Self>,
        device: &str,
        channel: &str,
        namespace: &str,
        rows: u16,
        cols: u16,
    ) -> Result<Arc<PtySession>> {
        if let Some(session) = self.get(device, channel) {
            return Ok(session);
        }
        match self.open(device, channel, namespace, rows, cols) {
            // Raced with another connect; use theirs.
            Err(e) if e.kind == crate::error::ErrorKind::AlreadyExists => self
                .get(device, channel)
                .ok_or(e),
            other => other,
        }
    }

    pub fn get(&self, device: &str, channel: &str) -> Option<Arc<PtySession>> {
        self.sessions
            .lock()
            .unwrap()
            .get(&(device.to_string(), channel.to_string()))
            .cloned()
    }

    /// A subscriber disconnected: keep the session alive for the grace
    /// window so a reconnect with the same channel id reattaches, then
    /// close it if still detached.
    pub fn schedule_grace(self: &Arc<Self>, session: &Arc<PtySession>, detach_epoch: u64) {
        let manager = self.clone();
        let session = session.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::select! {
                _ = session.cancel.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }
            // Reattached (epoch moved) or already closing: nothing to do.
            if session.current_epoch() != detach_epoch || session.is_attached() {
                return;
            }
            debug!(
                device = session.device,
                channel = session.channel,
                "grace period expired; closing detached session"
            );
            manager.close(&session.device, &session.channel).await;
        });
    }

    /// Close one session. Idempotent.
    pub async fn close(&self, device: &str, channel: &str) {
        let session = self
            .sessions
            .lock()
            .unwrap()
            .remove(&(device.to_string(), channel.to_string()));
        if let Some(session) = session {
            session.close().await;
        }
    }

    /// Close every session bound to a device (device removal).
    pub async fn close_device(&self, device: &str) {
        let doomed: Vec<Arc<PtySession>> = {
            let mut sessions = self.sessions.lock().unwrap();
            let keys: Vec<SessionKey> = sessions
                .keys()
                .filter(|(d, _)| d == device)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| sessions.remove(k)).collect()
        };
        for session in doomed {
            session.close().await;
        }
    }

    /// Close everything (server shutdown).
    pub async fn close_all(&self) {
        let doomed: Vec<Arc<PtySession>> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in doomed {
            session.close().await;
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Remove the entry only if it still maps to this exact session
    /// (a reconnect may have replaced it).
    fn forget(&self, key: &SessionKey, session: &Arc<PtySession>) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(current) = sessions.get(key)
            && Arc::ptr_eq(current, session)
        {
            sessions.remove(key);
        }
    }
}

/// Output receiver plus the attach epoch, returned to WebSocket handlers.
pub struct Attachment {
    pub session: Arc<PtySession>,
    pub output: mpsc::Receiver<Vec<u8>>,
    pub epoch: u64,
}

impl PtyManager {
    /// Attach a WebSocket to a session, replacing any previous subscriber.
    pub fn attach(&self, session: &Arc<PtySession>) -> Attachment {
        let (output, epoch) = session.attach();
        Attachment {
            session: session.clone(),
            output,
            epoch,
        }
    }
}
