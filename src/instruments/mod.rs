//! Drivers for individual instruments.
//!
//! Drivers that speak a plain command/reply protocol are generic over
//! [`Bus`](crate::bus::Bus), so the same code runs on a Prologix GPIB address
//! or a serial line. The spectrometers and the wavemeter need raw serial
//! access and take a [`SerialBus`](crate::bus::SerialBus) instead.

pub mod laser;
pub mod lockin;
pub mod oscilloscope;
pub mod signal_generator;
pub mod spectrometer;
pub mod stages;
pub mod wavemeter;

pub use laser::{Velocity6300, WavelengthSetting};
pub use lockin::{Egg5110, LockIn, Measurement, Quantity, Srs830};
pub use oscilloscope::Tds3000;
pub use signal_generator::{Ag8648, AmplitudeUnit, FrequencyUnit};
pub use spectrometer::{BootStatus, Monochromator, MotorController, Spex750m, Triax320};
pub use stages::{DelayStage, Esp300Stage, Mm3000Stage, MotorStatus, NewportStage, StageUnit};
pub use wavemeter::{Broadcast, Burleigh, parse_broadcast};
