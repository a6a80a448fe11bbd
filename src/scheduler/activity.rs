//! User activity sensing.
//!
//! A machine counts as "in use" during a tick when any input device produced
//! an event within it. Only the fact that a device became readable matters;
//! the events themselves are read and discarded.
//!
//! Devices are opened per [`ActivitySession`]. Dropping the session closes
//! every handle, whichever way the session ends.

use crate::error::{RebadeError, Result};
use async_trait::async_trait;
use futures_util::future::select_all;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tracing::{debug, info, warn};

/// Directory holding evdev character devices.
pub const INPUT_DEVICE_DIR: &str = "/dev/input";

/// An open set of activity sources.
#[async_trait]
pub trait ActivitySession: Send {
    /// Wait up to `timeout` for activity. Returns `true` as soon as any
    /// source reports activity and `false` once the timeout expires.
    ///
    /// # Errors
    ///
    /// [`RebadeError::Device`] when a source fails, e.g. a device was unplugged.
    async fn observed_activity(&mut self, timeout: Duration) -> Result<bool>;
}

/// Opens activity sessions; reopened by the scheduler after a session error.
pub trait ActivitySensor: Send {
    /// Session type produced by [`ActivitySensor::open`].
    type Session: ActivitySession;

    /// Acquire all sources.
    fn open(&mut self) -> Result<Self::Session>;
}

/// Sensor reading Linux evdev nodes (`/dev/input/event*`).
#[derive(Debug, Clone)]
pub struct EventDeviceSensor {
    dir: PathBuf,
}

impl Default for EventDeviceSensor {
    fn default() -> Self {
        Self::new(INPUT_DEVICE_DIR)
    }
}

impl EventDeviceSensor {
    /// Sensor over the `event*` nodes in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn device_paths(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            RebadeError::Device(format!("cannot list {}: {e}", self.dir.display()))
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("event"))
            .map(|entry| entry.path())
            .collect();
        paths.sort();
        Ok(paths)
    }
}

impl ActivitySensor for EventDeviceSensor {
    type Session = EventDeviceSession;

    fn open(&mut self) -> Result<EventDeviceSession> {
        let mut devices = Vec::new();
        for path in self.device_paths()? {
            match open_nonblocking(&path) {
                Ok(fd) => devices.push(InputDevice { path, fd }),
                Err(e) => warn!("cannot open input device {}: {e}", path.display()),
            }
        }
        if devices.is_empty() {
            warn!(
                "no input devices could be opened in {}, activity will never be observed",
                self.dir.display()
            );
        } else {
            info!(count = devices.len(), "watching input devices");
        }
        Ok(EventDeviceSession { devices })
    }
}

fn open_nonblocking(path: &Path) -> std::io::Result<AsyncFd<File>> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(path)?;
    AsyncFd::new(file)
}

struct InputDevice {
    path: PathBuf,
    fd: AsyncFd<File>,
}

impl InputDevice {
    fn error(&self, e: std::io::Error) -> RebadeError {
        RebadeError::Device(format!("{}: {e}", self.path.display()))
    }

    /// Read until the device would block. Returns the number of bytes discarded.
    fn drain(&self) -> Result<usize> {
        let mut file: &File = self.fd.get_ref();
        let mut buf = [0u8; 1024];
        let mut total = 0;
        loop {
            match file.read(&mut buf) {
                Ok(0) => {
                    return Err(self.error(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "device closed",
                    )));
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.error(e)),
            }
        }
    }
}

/// Open evdev handles, closed on drop.
pub struct EventDeviceSession {
    devices: Vec<InputDevice>,
}

impl EventDeviceSession {
    /// Number of devices being watched.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

#[async_trait]
impl ActivitySession for EventDeviceSession {
    async fn observed_activity(&mut self, timeout: Duration) -> Result<bool> {
        if self.devices.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(false);
        }

        // Events queued before this tick do not count.
        for device in &self.devices {
            device.drain()?;
        }

        match tokio::time::timeout(timeout, wait_for_input(&self.devices)).await {
            Ok(result) => result,
            Err(_) => Ok(false),
        }
    }
}

/// Wait until any device delivers at least one byte.
async fn wait_for_input(devices: &[InputDevice]) -> Result<bool> {
    loop {
        let waits = devices.iter().map(|device| Box::pin(device.fd.readable()));
        let (ready, index, _pending) = select_all(waits).await;
        let device = &devices[index];
        let mut guard = ready.map_err(|e| device.error(e))?;
        let bytes = device.drain()?;
        guard.clear_ready();
        if bytes > 0 {
            debug!(device = %device.path.display(), bytes, "input activity");
            return Ok(true);
        }
    }
}
