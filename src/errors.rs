//! Crate-wide error type for the app-level operator command surface.
//! Each lower layer (config, scheduler, actuator, sensors,
//! water_level) already defines its own narrow `Error` enum — this wraps
//! them for callers that sit above all of them, following the same
//! `#[non_exhaustive]` + manual `Display` idiom those do.

use std::fmt;

#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Error {
    Actuator(crate::actuator::Error),
    WaterLevel(crate::control::water_level::Error),
    Scheduler(crate::scheduler::Error),
    /// An operator command was rejected because a dosing pump is running
    /// (the critical-phase lock).
    CriticalPhase,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Actuator(err) => write!(f, "actuator error: {err}"),
            Error::WaterLevel(err) => write!(f, "water level error: {err}"),
            Error::Scheduler(err) => write!(f, "scheduler error: {err}"),
            Error::CriticalPhase => write!(f, "command rejected: a dosing pump is currently active"),
        }
    }
}

impl std::error::Error for Error {}

impl From<crate::actuator::Error> for Error {
    fn from(err: crate::actuator::Error) -> Self {
        Error::Actuator(err)
    }
}

impl From<crate::control::water_level::Error> for Error {
    fn from(err: crate::control::water_level::Error) -> Self {
        Error::WaterLevel(err)
    }
}

impl From<crate::scheduler::Error> for Error {
    fn from(err: crate::scheduler::Error) -> Self {
        Error::Scheduler(err)
    }
}
