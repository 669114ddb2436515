//! Dual-value INI configuration substrate.
//!
//! Each tunable is stored as `server_default, operational` (or a bare value
//! with no stored default); the runtime always reads the operational half.
//! Every getter re-reads the file from disk, so external edits are observed
//! without a process restart — the file itself is the single source of
//! truth, there is no in-process cache to go stale.

pub mod duration;
pub mod relay_assignments;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ini::Ini;

use self::duration::Seconds;

#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Error {
    Load(Arc<ini::Error>),
    Save(Arc<std::io::Error>),
}

impl From<ini::Error> for Error {
    fn from(err: ini::Error) -> Self {
        Error::Load(Arc::new(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Save(Arc::new(err))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Load(err) => write!(f, "config load error: {err}"),
            Error::Save(err) => write!(f, "config save error: {err}"),
        }
    }
}

impl std::error::Error for Error {}

/// Which half of a dual-value entry to prefer. Getters default to
/// `Operational`; `ServerDefault` exists for callers (e.g. diagnostics)
/// that explicitly want the upstream-provided default.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ValuePreference {
    ServerDefault,
    Operational,
}

/// Splits a raw INI value into `(server_default, operational)` per the
/// dual-value parse rule. A bare value with no comma is
/// treated as operational with no recorded default.
fn split_dual_value(raw: &str) -> (Option<String>, String) {
    if let Some((default, operational)) = raw.split_once(',') {
        (Some(strip_quotes(default.trim())), strip_quotes(operational.trim()))
    } else {
        (None, strip_quotes(raw.trim()))
    }
}

fn strip_quotes(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        if (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"') || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'') {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

/// A handle to the INI-backed config file. Cheap to clone (just a path);
/// every read goes straight to disk.
#[derive(Clone)]
pub struct Config {
    path: PathBuf,
}

impl Config {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Ini, Error> {
        Ok(Ini::load_from_file(&self.path)?)
    }

    /// Raw dual-value lookup. Missing section/key is not an error here —
    /// callers apply the hard-coded safe default.
    fn raw(&self, section: &str, key: &str) -> Option<String> {
        let ini = self.load().ok()?;
        ini.section(Some(section)).and_then(|s| s.get(key)).map(|s| s.to_string())
    }

    fn value(&self, section: &str, key: &str, preference: ValuePreference) -> Option<String> {
        let raw = self.raw(section, key)?;
        let (default, operational) = split_dual_value(&raw);
        match preference {
            ValuePreference::Operational => Some(operational),
            ValuePreference::ServerDefault => default.or(Some(operational)),
        }
    }

    pub fn get_string(&self, section: &str, key: &str, safe_default: &str) -> String {
        self.value(section, key, ValuePreference::Operational).unwrap_or_else(|| safe_default.to_string())
    }

    pub fn get_bool(&self, section: &str, key: &str, safe_default: bool) -> bool {
        match self.value(section, key, ValuePreference::Operational) {
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => safe_default,
            },
            None => safe_default,
        }
    }

    pub fn get_float(&self, section: &str, key: &str, safe_default: f64) -> f64 {
        self.value(section, key, ValuePreference::Operational)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(safe_default)
    }

    pub fn get_duration(&self, section: &str, key: &str, safe_default: Seconds) -> Seconds {
        match self.value(section, key, ValuePreference::Operational) {
            Some(v) => duration::parse_duration(&v),
            None => safe_default,
        }
    }

    pub fn get_abc_ratio(&self, section: &str, key: &str) -> [u32; 3] {
        match self.value(section, key, ValuePreference::Operational) {
            Some(v) => duration::parse_abc_ratio(&v),
            None => [1, 1, 0],
        }
    }

    /// Writes `operational` back to `section.key`, preserving any recorded
    /// server-default half. Used only by the operator command surface's
    /// `update_sensor_targets` — control loops never write
    /// config, only read it.
    pub fn set_operational(&self, section: &str, key: &str, operational: &str) -> Result<(), Error> {
        let mut ini = self.load()?;
        let existing = ini.section(Some(section)).and_then(|s| s.get(key)).map(|s| s.to_string());
        let new_raw = match existing.as_deref().map(split_dual_value) {
            Some((Some(default), _)) => format!("{default}, {operational}"),
            _ => operational.to_string(),
        };
        ini.with_section(Some(section)).set(key, new_raw);
        ini.write_to_file(&self.path)?;
        Ok(())
    }
}

/// The typed, immutable snapshot of every tunable the control loops and
/// safety layer consume. Constructed
/// fresh on each reload; cheap to rebuild since it's just scalars.
#[derive(Clone, Debug)]
pub struct Settings {
    pub ec_target: f64,
    pub ec_deadband: f64,
    pub ec_min: f64,
    pub ec_max: f64,

    pub ph_target: f64,
    pub ph_deadband: f64,
    pub ph_min: f64,
    pub ph_max: f64,

    pub nutrient_pump_on_duration: Seconds,
    pub nutrient_pump_wait_duration: Seconds,
    pub abc_ratio: [u32; 3],
    pub ph_pump_on_duration: Seconds,
    pub ph_pump_wait_duration: Seconds,

    pub sprinkler_on_duration: Seconds,
    pub sprinkler_wait_duration_raw: String,
    pub sprinkler_scheduling_enabled: bool,
    pub sprinkler_on_at_startup: bool,

    pub mixing_duration: Seconds,
    pub mixing_interval: Seconds,
    pub trigger_mixing_duration: Seconds,

    pub water_level_target: f64,
    pub water_level_deadband: f64,
    pub water_level_min: f64,
    pub water_level_max: f64,
    pub water_level_control_enabled: bool,
    pub tank_dump_safety_floor: f64,
    pub tank_dump_max_duration_seconds: Seconds,
}

impl Settings {
    /// `sprinkler_wait_duration`, resolved against the `99:99:99` sentinel:
    /// `None` means "do not reschedule".
    pub fn sprinkler_wait_duration(&self) -> Option<Seconds> {
        if self.sprinkler_wait_duration_raw.trim() == duration::DISABLED_SENTINEL {
            return None;
        }
        let seconds = duration::parse_duration(&self.sprinkler_wait_duration_raw);
        if seconds == 0 {
            None
        } else {
            Some(seconds)
        }
    }

    pub fn load(config: &Config) -> Self {
        Self {
            ec_target: config.get_float("EC", "ec_target", 1.0),
            ec_deadband: config.get_float("EC", "ec_deadband", 0.1),
            ec_min: config.get_float("EC", "ec_min", 0.0),
            ec_max: config.get_float("EC", "ec_max", 99.0),

            ph_target: config.get_float("pH", "ph_target", 6.0),
            ph_deadband: config.get_float("pH", "ph_deadband", 0.2),
            ph_min: config.get_float("pH", "ph_min", 4.0),
            ph_max: config.get_float("pH", "ph_max", 8.0),

            nutrient_pump_on_duration: config.get_duration("NutrientPump", "nutrient_pump_on_duration", 0),
            nutrient_pump_wait_duration: config.get_duration("NutrientPump", "nutrient_pump_wait_duration", 0),
            abc_ratio: config.get_abc_ratio("NutrientPump", "abc_ratio"),
            ph_pump_on_duration: config.get_duration("NutrientPump", "ph_pump_on_duration", 0),
            ph_pump_wait_duration: config.get_duration("NutrientPump", "ph_pump_wait_duration", 120),

            sprinkler_on_duration: config.get_duration("Sprinkler", "sprinkler_on_duration", 0),
            sprinkler_wait_duration_raw: config.get_string("Sprinkler", "sprinkler_wait_duration", "00:00:00"),
            sprinkler_scheduling_enabled: config.get_bool("Sprinkler", "sprinkler_scheduling_enabled", true),
            sprinkler_on_at_startup: config.get_bool("Sprinkler", "sprinkler_on_at_startup", false),

            mixing_duration: config.get_duration("Mixing", "mixing_duration", 0),
            mixing_interval: config.get_duration("Mixing", "mixing_interval", 0),
            trigger_mixing_duration: config.get_duration("Mixing", "trigger_mixing_duration", 0),

            water_level_target: config.get_float("WaterLevel", "water_level_target", 80.0),
            water_level_deadband: config.get_float("WaterLevel", "water_level_deadband", 10.0),
            water_level_min: config.get_float("WaterLevel", "water_level_min", 50.0),
            water_level_max: config.get_float("WaterLevel", "water_level_max", 100.0),
            water_level_control_enabled: config.get_bool("WaterLevel", "water_level_control_enabled", true),
            tank_dump_safety_floor: config.get_float("WaterLevel", "tank_dump_safety_floor", 30.0),
            tank_dump_max_duration_seconds: config.get_duration("WaterLevel", "tank_dump_max_duration_seconds", 1800),
        }
    }
}

/// Sections the hot-reload entry point knows how to react to, processed in
/// this fixed order regardless of the order the host reports them in.
pub const RELOAD_ORDER: [&str; 7] = ["EC", "pH", "NutrientPump", "Mixing", "Sprinkler", "WaterLevel", "PLUMBING"];

/// Orders an arbitrary set of changed section names per `RELOAD_ORDER`,
/// dropping unrecognized sections (they have no registered side effect).
pub fn ordered_changed_sections(changed: &HashSet<String>) -> Vec<&'static str> {
    RELOAD_ORDER.iter().copied().filter(|section| changed.contains(*section)).collect()
}
