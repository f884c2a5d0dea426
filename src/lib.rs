//! Drivers and measurement loops for an optics lab: monochromators, lock-in
//! amplifiers, motion stages, lasers and friends, reached over RS-232, GPIB
//! (through Prologix bridges) or TCP.

pub mod bus;
pub mod ccd;
pub mod error;
pub mod experiment;
pub mod instruments;
pub mod logger;
pub mod prologix;
pub mod utils;

pub use bus::{Bus, Port, SerialBus, SerialSettings, TrafficLog, shared};
pub use ccd::{CcdClient, Spectrum};
pub use error::InstrumentError;
pub use experiment::{ScanPoint, Scanner, monitor, spectrum_scan};
pub use logger::DataLogger;
pub use prologix::{ControllerRegistry, GpibInstrument, Prologix, PrologixBuilder, SharedController};
pub use utils::{PollError, poll_until};
