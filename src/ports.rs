//! Host-supplied collaborators.
//!
//! These traits are the seams the core is built against; the host process
//! (CLI binary, REST façade, Modbus driver stack) supplies concrete
//! implementations. `main.rs` wires a default implementation of each for
//! the bundled Linux/RPi deployment; tests wire fakes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};

/// A single Modbus RTU register read, abstracted away from the wire
/// protocol. The wire protocol and per-sensor register maps are external
/// collaborators, supplied by the host process; this is the narrow port the core drives.
pub trait SensorBus: Send + Sync {
    /// Reads `count` holding registers starting at `address` on `port`,
    /// addressed to `slave_addr`, bailing out after `timeout`.
    fn read_holding_registers(&self, port: &str, address: u16, count: u8, slave_addr: u8, baudrate: u32, timeout: StdDuration) -> Result<Vec<u16>, BusError>;

    /// Fires a write/command request and returns a correlation id; the
    /// response (if any) arrives asynchronously through the host's
    /// delivery mechanism and is out of scope here.
    fn send_command(&self, port: &str, slave_addr: u8, payload: &[u8]) -> u64;
}

#[derive(Debug, Clone)]
pub enum BusError {
    Timeout,
    Io(String),
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::Timeout => write!(f, "modbus request timed out"),
            BusError::Io(msg) => write!(f, "modbus io error: {msg}"),
        }
    }
}

impl std::error::Error for BusError {}

/// Monotonic + wall-clock time source, injected so control loops and the
/// scheduler are deterministically testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real-time clock backed by the OS.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that can be advanced manually, for deterministic tests of
/// hysteresis and timeout behavior.
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Atomic file storage for the sensor snapshot, runtime history, and the
/// emergency flag. Writers must never leave partial content (invariant I7).
pub trait FileStore: Send + Sync {
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>>;
    fn write_atomic(&self, path: &str, contents: &[u8]) -> std::io::Result<()>;
    fn delete(&self, path: &str) -> std::io::Result<()>;
    fn exists(&self, path: &str) -> bool;
}

/// Real filesystem, using write-temp-then-rename for atomicity.
pub struct OsFileStore;

impl FileStore for OsFileStore {
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write_atomic(&self, path: &str, contents: &[u8]) -> std::io::Result<()> {
        let path = std::path::Path::new(path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, path)
    }

    fn delete(&self, path: &str) -> std::io::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn exists(&self, path: &str) -> bool {
        std::path::Path::new(path).exists()
    }
}

/// An in-memory store for tests; also doubles as a crude simulation of the
/// "either the old or new file, never partial" guarantee (there is no
/// partial state possible since writes replace the whole entry).
#[derive(Default)]
pub struct MemoryFileStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileStore for MemoryFileStore {
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, path.to_string()))
    }

    fn write_atomic(&self, path: &str, contents: &[u8]) -> std::io::Result<()> {
        self.files.lock().unwrap().insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    fn delete(&self, path: &str) -> std::io::Result<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }
}

/// Notifies the core that one or more config sections changed on disk.
/// Debouncing lives in the host (e.g. a file-watcher); the core only
/// implements the `reload` entry point it calls into (see `config::reload`).
pub trait ConfigReloadSource {
    fn poll_changed_sections(&self) -> Option<std::collections::HashSet<String>>;
}

/// A source that never reports changes; useful where the host has no
/// file-watcher wired up yet.
pub struct NoopConfigReloadSource;

impl ConfigReloadSource for NoopConfigReloadSource {
    fn poll_changed_sections(&self) -> Option<std::collections::HashSet<String>> {
        None
    }
}
