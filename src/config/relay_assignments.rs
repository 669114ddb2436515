//! `RELAY_ASSIGNMENTS` section: maps a logical device name to a
//! `(board, port_index)` pair. Resolution is cached after first
//! load and re-read on reload.

use std::collections::HashMap;
use std::sync::RwLock;

use super::Config;

/// A board/port address, as used by the actuator façade and the GPIO
/// board backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortAddress {
    pub board: usize,
    pub port: usize,
}

/// The well-known logical device names every installation is expected to wire up. Config may
/// define additional PLUMBING devices (valves, solenoids) by name; those
/// are resolved generically rather than through this enum.
pub const KNOWN_DOSING_PUMPS: [&str; 5] = ["NutrientPumpA", "NutrientPumpB", "NutrientPumpC", "pHPlusPump", "pHMinusPump"];

fn default_assignment(device_name: &str) -> Option<PortAddress> {
    // Deterministic fallback layout so a `device.conf` with no
    // `RELAY_ASSIGNMENTS` section still boots into something testable: one
    // board, ports assigned in the order devices are first seen.
    const DEFAULT_ORDER: [&str; 13] = [
        "NutrientPumpA",
        "NutrientPumpB",
        "NutrientPumpC",
        "pHPlusPump",
        "pHMinusPump",
        "MixingPump",
        "Sprinklers",
        "ValveOutsideToTank",
        "ValveTankToOutside",
        "InletValve",
        "OutletValve",
        "RecirculationPump",
        "SpareRelay",
    ];
    let lower = device_name.to_ascii_lowercase();
    DEFAULT_ORDER.iter().position(|name| name.to_ascii_lowercase() == lower).map(|port| PortAddress { board: 0, port })
}

/// Case-insensitive device-name → board/port resolver, backed by the
/// `RELAY_ASSIGNMENTS` config section. Caches the parsed table after first
/// load; `reload()` forces a re-read (called from `config::reload` when the
/// `PLUMBING` section changes, per the reload ordering table).
pub struct RelayAssignments {
    config: Config,
    cache: RwLock<HashMap<String, PortAddress>>,
}

impl RelayAssignments {
    pub fn new(config: Config) -> Self {
        let this = Self { config, cache: RwLock::new(HashMap::new()) };
        this.reload();
        this
    }

    pub fn reload(&self) {
        let mut table = HashMap::new();
        if let Ok(ini) = ini::Ini::load_from_file(self.config.path()) {
            if let Some(section) = ini.section(Some("RELAY_ASSIGNMENTS")) {
                for (key, value) in section.iter() {
                    if let Some(addr) = parse_port_address(value) {
                        table.insert(key.to_ascii_lowercase(), addr);
                    }
                }
            }
        }
        *self.cache.write().unwrap() = table;
    }

    /// Resolves a logical device name, case-insensitively. Falls back to
    /// the deterministic default layout when the config doesn't define the
    /// device explicitly (keeps a fresh install usable out of the box).
    pub fn resolve(&self, device_name: &str) -> Option<PortAddress> {
        let key = device_name.to_ascii_lowercase();
        if let Some(addr) = self.cache.read().unwrap().get(&key) {
            return Some(*addr);
        }
        default_assignment(device_name)
    }
}

/// Parses `"board.port"` (e.g. `"0.3"`) into a [`PortAddress`].
fn parse_port_address(raw: &str) -> Option<PortAddress> {
    let (board, port) = raw.split_once('.')?;
    Some(PortAddress { board: board.trim().parse().ok()?, port: port.trim().parse().ok()? })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_with(contents: &str) -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.conf");
        std::fs::File::create(&path).unwrap().write_all(contents.as_bytes()).unwrap();
        (dir, Config::new(path))
    }

    #[test]
    fn resolves_case_insensitively() {
        let (_dir, cfg) = config_with("[RELAY_ASSIGNMENTS]\nNutrientPumpA = 0.2\n");
        let table = RelayAssignments::new(cfg);
        assert_eq!(table.resolve("nutrientpumpa"), Some(PortAddress { board: 0, port: 2 }));
        assert_eq!(table.resolve("NUTRIENTPUMPA"), Some(PortAddress { board: 0, port: 2 }));
    }

    #[test]
    fn falls_back_to_default_layout_when_unconfigured() {
        let (_dir, cfg) = config_with("[RELAY_ASSIGNMENTS]\n");
        let table = RelayAssignments::new(cfg);
        assert_eq!(table.resolve("NutrientPumpB"), Some(PortAddress { board: 0, port: 1 }));
        assert_eq!(table.resolve("NotADevice"), None);
    }

    #[test]
    fn reload_picks_up_config_changes() {
        let (_dir, cfg) = config_with("[RELAY_ASSIGNMENTS]\nMixingPump = 0.5\n");
        let path = cfg.path().to_path_buf();
        let table = RelayAssignments::new(cfg);
        assert_eq!(table.resolve("MixingPump"), Some(PortAddress { board: 0, port: 5 }));

        std::fs::write(&path, "[RELAY_ASSIGNMENTS]\nMixingPump = 1.0\n").unwrap();
        table.reload();
        assert_eq!(table.resolve("MixingPump"), Some(PortAddress { board: 1, port: 0 }));
    }
}
