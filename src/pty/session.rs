//! One interactive pseudo-terminal bound to a namespace.
//!
//! The session owns the PTY master exclusively. A login shell runs as a
//! child with the slave as its controlling terminal, started through
//! `ip netns exec` so every command the user types executes inside the
//! device's namespace. One reader task pumps master bytes to whichever
//! subscriber is currently attached; bytes are never reordered and never
//! dropped mid-stream — a subscriber that cannot keep up is closed.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use nix::pty::openpty;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EmuError, ErrorKind, Result};

/// Read granularity; matches the historical terminal pump size.
const READ_CHUNK: usize = 4096;
/// Subscriber buffer: 16 chunks of 4 KiB.
pub const SUBSCRIBER_CHUNKS: usize = 16;
/// How long a SIGHUP'd shell gets before SIGKILL.
const HANGUP_GRACE: Duration = Duration::from_millis(200);

const STATE_SPAWNING: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

pub struct PtySession {
    pub device: String,
    pub channel: String,
    master: AsyncFd<OwnedFd>,
    child: tokio::sync::Mutex<tokio::process::Child>,
    pid: Option<i32>,
    subscriber: StdMutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// Bumped on every attach/detach so stale grace timers don't fire.
    attach_epoch: AtomicU64,
    state: AtomicU8,
    pub cancel: CancellationToken,
}

impl PtySession {
    /// Open a PTY pair and spawn `bash -i` inside `namespace` with the
    /// slave as its controlling terminal.
    pub fn spawn(device: &str, channel: &str, namespace: &str, rows: u16, cols: u16) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(EmuError::invalid("terminal size must be non-zero"));
        }

        let winsize = nix::pty::Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        let pty = openpty(Some(&winsize), None).map_err(|e| match e {
            nix::errno::Errno::EMFILE | nix::errno::Errno::ENFILE | nix::errno::Errno::ENOSPC => {
                EmuError::new(ErrorKind::ResourceExhausted, format!("openpty: {e}"))
            }
            other => EmuError::new(ErrorKind::KernelError, format!("openpty: {other}")),
        })?;

        set_nonblocking(&pty.master)
            .map_err(|e| EmuError::new(ErrorKind::KernelError, format!("pty master: {e}")))?;

        let slave_in = pty
            .slave
            .try_clone()
            .map_err(|e| EmuError::new(ErrorKind::KernelError, format!("dup slave: {e}")))?;
        let slave_out = pty
            .slave
            .try_clone()
            .map_err(|e| EmuError::new(ErrorKind::KernelError, format!("dup slave: {e}")))?;

        let mut cmd = tokio::process::Command::new("ip");
        cmd.args(["netns", "exec", namespace, "/bin/bash", "-i"])
            .env("TERM", "xterm-256color")
            .stdin(Stdio::from(slave_in))
            .stdout(Stdio::from(slave_out))
            .stderr(Stdio::from(pty.slave))
            .kill_on_drop(true);

        // New session + controlling terminal before exec; stdin is the
        // slave at that point.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as libc::c_ulong, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| {
            EmuError::new(ErrorKind::KernelError, format!("spawn shell in {namespace}: {e}"))
        })?;
        let pid = child.id().map(|p| p as i32);

        let master = AsyncFd::new(pty.master)
            .map_err(|e| EmuError::new(ErrorKind::KernelError, format!("register pty: {e}")))?;

        debug!(device, channel, namespace, ?pid, "pty session spawned");

        Ok(Self {
            device: device.to_string(),
            channel: channel.to_string(),
            master,
            child: tokio::sync::Mutex::new(child),
            pid,
            subscriber: StdMutex::new(None),
            attach_epoch: AtomicU64::new(0),
            state: AtomicU8::new(STATE_SPAWNING),
            cancel: CancellationToken::new(),
        })
    }

    pub fn mark_running(&self) {
        let _ = self.state.compare_exchange(
            STATE_SPAWNING,
            STATE_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) >= STATE_CLOSING
    }

    /// Attach a subscriber, replacing any previous one (whose channel
    /// closes, ending its WebSocket). Returns the output receiver and the
    /// epoch to hand back on detach.
    pub fn attach(&self) -> (mpsc::Receiver<Vec<u8>>, u64) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHUNKS);
        *self.subscriber.lock().unwrap() = Some(tx);
        let epoch = self.attach_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        (rx, epoch)
    }

    /// Drop the subscriber if the caller is still the current one.
    /// Returns the detach epoch for grace-period bookkeeping.
    pub fn detach(&self, epoch: u64) -> Option<u64> {
        if self.attach_epoch.load(Ordering::SeqCst) != epoch {
            return None;
        }
        *self.subscriber.lock().unwrap() = None;
        Some(epoch)
    }

    pub fn is_attached(&self) -> bool {
        self.subscriber.lock().unwrap().is_some()
    }

    pub fn current_epoch(&self) -> u64 {
        self.attach_epoch.load(Ordering::SeqCst)
    }

    /// Write client input to the shell. Blocks (asynchronously) while the
    /// kernel-side buffer is full — input is never silently dropped.
    pub async fn write(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            if self.is_closed() {
                return Err(EmuError::not_found(format!(
                    "session {}:{} is closed",
                    self.device, self.channel
                )));
            }
            let mut guard = self
                .master
                .writable()
                .await
                .map_err(|e| EmuError::new(ErrorKind::KernelError, format!("pty poll: {e}")))?;
            match guard.try_io(|inner| raw_write(inner.get_ref(), data)) {
                Ok(Ok(0)) => {
                    return Err(EmuError::new(ErrorKind::KernelError, "pty write returned 0"));
                }
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) => {
                    return Err(EmuError::new(ErrorKind::KernelError, format!("pty write: {e}")));
                }
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Update the kernel TTY size; the shell receives SIGWINCH.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        if rows == 0 || cols == 0 {
            return Err(EmuError::invalid("terminal size must be non-zero"));
        }
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe {
            libc::ioctl(
                self.master.get_ref().as_raw_fd(),
                libc::TIOCSWINSZ as libc::c_ulong,
                &ws,
            )
        };
        if rc < 0 {
            return Err(EmuError::new(
                ErrorKind::KernelError,
                format!("TIOCSWINSZ: {}", io::Error::last_os_error()),
            ));
        }
        debug!(device = self.device, channel = self.channel, rows, cols, "resized");
        Ok(())
    }

    /// Pump master output to the attached subscriber until EOF or cancel.
    /// Returns when the session is done; the caller removes the table
    /// entry and reaps the child.
    pub async fn pump(&self) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let readable = tokio::select! {
                _ = self.cancel.cancelled() => return,
                r = self.master.readable() => r,
            };
            let mut guard = match readable {
                Ok(g) => g,
                Err(e) => {
                    warn!(device = self.device, error = %e, "pty poll failed");
                    return;
                }
            };
            match guard.try_io(|inner| raw_read(inner.get_ref(), &mut buf)) {
                Ok(Ok(0)) => return, // EOF: shell exited
                Ok(Ok(n)) => self.deliver(&buf[..n]),
                // EIO is how a PTY master reports the slave side closing
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return,
                Ok(Err(e)) => {
                    warn!(device = self.device, error = %e, "pty read failed");
                    return;
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Hand bytes to the current subscriber. A full buffer closes the
    /// subscriber (it must reconnect) rather than dropping or reordering.
    fn deliver(&self, data: &[u8]) {
        let mut slot = self.subscriber.lock().unwrap();
        if let Some(tx) = slot.as_ref() {
            match tx.try_send(data.to_vec()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        device = self.device,
                        channel = self.channel,
                        "terminal subscriber overflowed; closing its channel"
                    );
                    *slot = None;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    *slot = None;
                }
            }
        }
        // No subscriber (detached, inside the grace window): output is
        // consumed and discarded so the shell never blocks on us.
    }

    /// Terminate the session: SIGHUP, short wait, SIGKILL, reap.
    /// Safe to call more than once.
    pub async fn close(&self) {
        let prior = self.state.swap(STATE_CLOSING, Ordering::SeqCst);
        if prior >= STATE_CLOSING {
            return;
        }
        self.cancel.cancel();
        *self.subscriber.lock().unwrap() = None;

        let mut child = self.child.lock().await;
        if let Some(pid) = self.pid {
            let _ = kill(Pid::from_raw(pid), Signal::SIGHUP);
        }
        if timeout(HANGUP_GRACE, child.wait()).await.is_err() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        debug!(device = self.device, channel = self.channel, "pty session closed");
        // The master fd drops with the session, after the child is gone.
    }
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("device", &self.device)
            .field("channel", &self.channel)
            .field("pid", &self.pid)
            .field("state", &self.state.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn raw_read(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn raw_write(fd: &OwnedFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}
