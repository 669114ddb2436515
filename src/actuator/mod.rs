//! Actuator façade: resolves logical device names to board/port addresses
//! and drives relays through a pluggable backend.
//!
//! The façade itself never talks to hardware; a [`RelayBackend`] does that.
//! `station-gpio` wires up the real shift-register boards through `rppal`;
//! tests use
//! [`MemoryRelayBackend`].

#[cfg(feature = "station-gpio")]
pub mod gpio;

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::relay_assignments::{PortAddress, RelayAssignments};

/// 16 ports per board.
pub const PORTS_PER_BOARD: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayState {
    On,
    Off,
}

impl RelayState {
    pub fn from_bool(on: bool) -> Self {
        if on { RelayState::On } else { RelayState::Off }
    }

    pub fn is_on(&self) -> bool {
        matches!(self, RelayState::On)
    }
}

#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Error {
    UnknownDevice(String),
    Backend(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnknownDevice(name) => write!(f, "no relay assignment for device '{name}'"),
            Error::Backend(msg) => write!(f, "relay backend error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

/// `Some((board, start_port))` if every address resolved and they form one
/// ascending, gap-free run on a single board in list order; `None`
/// otherwise (unresolved device, board mismatch, or a gap).
fn contiguous_run(addresses: &[Option<PortAddress>]) -> Option<(usize, usize)> {
    let first = addresses.first()?.as_ref()?;
    for (offset, address) in addresses.iter().enumerate() {
        let address = address.as_ref()?;
        if address.board != first.board || address.port != first.port + offset {
            return None;
        }
    }
    Some((first.board, first.port))
}

/// The narrow interface a relay backend implements: set and read back the
/// state of a single port on a board. Boards are addressed by index
/// starting at 0, each exposing [`PORTS_PER_BOARD`] ports.
pub trait RelayBackend: Send + Sync {
    fn set(&self, address: PortAddress, state: RelayState) -> Result<(), Error>;
    fn get(&self, address: PortAddress) -> Result<RelayState, Error>;

    /// Writes a contiguous run of `states.len()` ports on `board`, starting
    /// at `start_port`, as a single backend transaction. The default falls
    /// back to one `set` call per port; a backend that shares one wire
    /// transaction across ports (e.g. a shift register) should override
    /// this to actually batch it.
    fn set_many(&self, board: usize, start_port: usize, states: &[RelayState]) -> Result<(), Error> {
        for (offset, state) in states.iter().enumerate() {
            self.set(PortAddress { board, port: start_port + offset }, *state)?;
        }
        Ok(())
    }
}

/// An in-memory backend recording last-commanded state, for tests and for
/// deployments without real hardware attached.
#[derive(Default)]
pub struct MemoryRelayBackend {
    state: Mutex<HashMap<(usize, usize), RelayState>>,
}

impl MemoryRelayBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RelayBackend for MemoryRelayBackend {
    fn set(&self, address: PortAddress, state: RelayState) -> Result<(), Error> {
        self.state.lock().unwrap().insert((address.board, address.port), state);
        Ok(())
    }

    fn get(&self, address: PortAddress) -> Result<RelayState, Error> {
        Ok(*self.state.lock().unwrap().get(&(address.board, address.port)).unwrap_or(&RelayState::Off))
    }
}

/// Device-name-level API every control loop and the operator command
/// surface drives. Name lookup is case-insensitive, delegated to
/// [`RelayAssignments`].
pub struct ActuatorFacade {
    assignments: RelayAssignments,
    backend: Box<dyn RelayBackend>,
}

impl ActuatorFacade {
    pub fn new(assignments: RelayAssignments, backend: Box<dyn RelayBackend>) -> Self {
        Self { assignments, backend }
    }

    fn address(&self, device_name: &str) -> Result<PortAddress, Error> {
        self.assignments.resolve(device_name).ok_or_else(|| Error::UnknownDevice(device_name.to_string()))
    }

    pub fn set_relay(&self, device_name: &str, on: bool) -> Result<(), Error> {
        let address = self.address(device_name)?;
        self.backend.set(address, RelayState::from_bool(on))
    }

    /// Writes every named device, batching into a single backend
    /// transaction when the resolved addresses form one contiguous
    /// board/port run (the A/B/C nutrient-pump start is the canonical case)
    /// for latency and consistency. Falls back to one write per device,
    /// continuing past a single unresolved or failing device rather than
    /// leaving a sibling relay stuck, when the run isn't contiguous — e.g.
    /// an unknown device name in the batch.
    pub fn set_multiple_relays(&self, commands: &[(&str, bool)]) -> Result<(), Error> {
        let addresses: Vec<Option<PortAddress>> = commands.iter().map(|(name, _)| self.address(name).ok()).collect();

        if let Some((board, start_port)) = contiguous_run(&addresses) {
            let states: Vec<RelayState> = commands.iter().map(|(_, on)| RelayState::from_bool(*on)).collect();
            return self.backend.set_many(board, start_port, &states);
        }

        let mut first_err = None;
        for (device_name, on) in commands {
            if let Err(err) = self.set_relay(device_name, *on) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn get_relay_state(&self, device_name: &str) -> Result<RelayState, Error> {
        let address = self.address(device_name)?;
        self.backend.get(address)
    }

    pub fn set_sprinklers(&self, on: bool) -> Result<(), Error> {
        self.set_relay("Sprinklers", on)
    }

    pub fn set_mixing_pump(&self, on: bool) -> Result<(), Error> {
        self.set_relay("MixingPump", on)
    }

    pub fn set_valve_outside_to_tank(&self, on: bool) -> Result<(), Error> {
        self.set_relay("ValveOutsideToTank", on)
    }

    pub fn set_valve_tank_to_outside(&self, on: bool) -> Result<(), Error> {
        self.set_relay("ValveTankToOutside", on)
    }

    pub fn set_ph_plus_pump(&self, on: bool) -> Result<(), Error> {
        self.set_relay("pHPlusPump", on)
    }

    pub fn set_ph_minus_pump(&self, on: bool) -> Result<(), Error> {
        self.set_relay("pHMinusPump", on)
    }

    /// `letter` is one of `'A'`, `'B'`, `'C'` — the three nutrient
    /// channels.
    pub fn set_nutrient_pump(&self, letter: char, on: bool) -> Result<(), Error> {
        self.set_relay(&format!("NutrientPump{}", letter.to_ascii_uppercase()), on)
    }

    pub fn set_nutrient_pumps(&self, on: bool) -> Result<(), Error> {
        self.set_multiple_relays(&[("NutrientPumpA", on), ("NutrientPumpB", on), ("NutrientPumpC", on)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::io::Write;

    fn facade_with(contents: &str) -> (tempfile::TempDir, ActuatorFacade) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.conf");
        std::fs::File::create(&path).unwrap().write_all(contents.as_bytes()).unwrap();
        let assignments = RelayAssignments::new(Config::new(path));
        let facade = ActuatorFacade::new(assignments, Box::new(MemoryRelayBackend::new()));
        (dir, facade)
    }

    #[test]
    fn set_and_read_back_named_device() {
        let (_dir, facade) = facade_with("[RELAY_ASSIGNMENTS]\nMixingPump = 0.5\n");
        facade.set_mixing_pump(true).unwrap();
        assert_eq!(facade.get_relay_state("MixingPump").unwrap(), RelayState::On);
        assert_eq!(facade.get_relay_state("mixingpump").unwrap(), RelayState::On);
    }

    #[test]
    fn unconfigured_device_name_errors() {
        let (_dir, facade) = facade_with("[RELAY_ASSIGNMENTS]\n");
        let err = facade.set_relay("NoSuchThing", true).unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(_)));
    }

    #[test]
    fn nutrient_pumps_address_three_distinct_ports() {
        let (_dir, facade) = facade_with("[RELAY_ASSIGNMENTS]\nNutrientPumpA = 0.0\nNutrientPumpB = 0.1\nNutrientPumpC = 0.2\n");
        facade.set_nutrient_pump('a', true).unwrap();
        assert_eq!(facade.get_relay_state("NutrientPumpA").unwrap(), RelayState::On);
        assert_eq!(facade.get_relay_state("NutrientPumpB").unwrap(), RelayState::Off);

        facade.set_nutrient_pumps(true).unwrap();
        assert_eq!(facade.get_relay_state("NutrientPumpB").unwrap(), RelayState::On);
        assert_eq!(facade.get_relay_state("NutrientPumpC").unwrap(), RelayState::On);
    }

    #[test]
    fn multiple_relays_continues_past_unknown_device() {
        let (_dir, facade) = facade_with("[RELAY_ASSIGNMENTS]\nMixingPump = 0.5\n");
        let err = facade.set_multiple_relays(&[("Bogus", true), ("MixingPump", true)]).unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(_)));
        assert_eq!(facade.get_relay_state("MixingPump").unwrap(), RelayState::On);
    }

    /// Records how many times each backend entry point is invoked, shared
    /// via `Arc` so a test can inspect counts after handing the backend's
    /// `Box` off to the facade.
    #[derive(Default)]
    struct CallCounts {
        set: usize,
        set_many: usize,
    }

    struct CountingBackend {
        inner: MemoryRelayBackend,
        counts: std::sync::Arc<Mutex<CallCounts>>,
    }

    impl RelayBackend for CountingBackend {
        fn set(&self, address: PortAddress, state: RelayState) -> Result<(), Error> {
            self.counts.lock().unwrap().set += 1;
            self.inner.set(address, state)
        }

        fn get(&self, address: PortAddress) -> Result<RelayState, Error> {
            self.inner.get(address)
        }

        fn set_many(&self, board: usize, start_port: usize, states: &[RelayState]) -> Result<(), Error> {
            self.counts.lock().unwrap().set_many += 1;
            for (offset, state) in states.iter().enumerate() {
                self.inner.set(PortAddress { board, port: start_port + offset }, *state)?;
            }
            Ok(())
        }
    }

    fn counting_facade(contents: &str) -> (tempfile::TempDir, ActuatorFacade, std::sync::Arc<Mutex<CallCounts>>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.conf");
        std::fs::File::create(&path).unwrap().write_all(contents.as_bytes()).unwrap();
        let assignments = RelayAssignments::new(Config::new(path));
        let counts = std::sync::Arc::new(Mutex::new(CallCounts::default()));
        let backend = CountingBackend { inner: MemoryRelayBackend::new(), counts: counts.clone() };
        let facade = ActuatorFacade::new(assignments, Box::new(backend));
        (dir, facade, counts)
    }

    #[test]
    fn contiguous_batch_issues_a_single_backend_transaction() {
        let (_dir, facade, counts) = counting_facade("[RELAY_ASSIGNMENTS]\nNutrientPumpA = 0.0\nNutrientPumpB = 0.1\nNutrientPumpC = 0.2\n");

        facade.set_nutrient_pumps(true).unwrap();

        assert_eq!(facade.get_relay_state("NutrientPumpB").unwrap(), RelayState::On);
        assert_eq!(counts.lock().unwrap().set_many, 1);
        assert_eq!(counts.lock().unwrap().set, 0);
    }

    #[test]
    fn non_contiguous_assignment_falls_back_to_individual_writes() {
        let (_dir, facade, counts) = counting_facade("[RELAY_ASSIGNMENTS]\nNutrientPumpA = 0.0\nNutrientPumpB = 0.5\nNutrientPumpC = 0.2\n");

        facade.set_nutrient_pumps(true).unwrap();

        assert_eq!(facade.get_relay_state("NutrientPumpA").unwrap(), RelayState::On);
        assert_eq!(facade.get_relay_state("NutrientPumpB").unwrap(), RelayState::On);
        assert_eq!(facade.get_relay_state("NutrientPumpC").unwrap(), RelayState::On);
        assert_eq!(counts.lock().unwrap().set_many, 0);
        assert_eq!(counts.lock().unwrap().set, 3);
    }
}
