//! New Focus Velocity 6300 tunable diode laser controller.
//!
//! The 6300 answers every read with the response to the most recent
//! command, however many times it is asked. Behind a Prologix controller
//! that means read-after-write must be off:
//!
//! ```no_run
//! use optolab::instruments::laser::Velocity6300;
//! use optolab::prologix::{GpibInstrument, PrologixBuilder};
//!
//! let plx = PrologixBuilder::new().usb("/dev/ttyUSBgpib").build()?;
//! let mut laser = Velocity6300::new(GpibInstrument::new(plx, 1).with_auto(false))?;
//! laser.set_wavelength(780.24.into())?;
//! # Ok::<(), optolab::InstrumentError>(())
//! ```
//!
//! Over RS-232 use 19200 baud and `\r` termination.

use log::{info, warn};
use std::fmt;

use crate::bus::Bus;
use crate::error::InstrumentError;
use crate::utils::{parse_f64, parse_flag};

/// A wavelength set point: a value in nm, or one end of the tuning range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WavelengthSetting {
    Nm(f64),
    Min,
    Max,
}

impl From<f64> for WavelengthSetting {
    fn from(nm: f64) -> Self {
        WavelengthSetting::Nm(nm)
    }
}

impl fmt::Display for WavelengthSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WavelengthSetting::Nm(nm) => write!(f, "{nm}"),
            WavelengthSetting::Min => write!(f, "min"),
            WavelengthSetting::Max => write!(f, "max"),
        }
    }
}

pub struct Velocity6300<B: Bus> {
    bus: B,
    prefix: &'static str,
}

impl<B: Bus> Velocity6300<B> {
    /// Connect and log the controller's identification.
    pub fn new(mut bus: B) -> Result<Self, InstrumentError> {
        // RS-232 commands must start with '@'
        let prefix = if bus.is_serial() { "@" } else { "" };
        let id = bus.ask(&format!("{prefix}*IDN?"))?;
        info!("Velocity 6300: {id}");
        Ok(Self { bus, prefix })
    }

    fn query(&mut self, query: &str) -> Result<String, InstrumentError> {
        let framed = format!("{}{query}", self.prefix);
        self.bus.ask(&framed)
    }

    fn query_f64(&mut self, query: &str) -> Result<f64, InstrumentError> {
        let reply = self.query(query)?;
        parse_f64(&reply, query)
    }

    /// Issue a command. The controller acknowledges with `OK`; anything
    /// else gets one retry before it is reported.
    pub fn command(&mut self, command: &str) -> Result<(), InstrumentError> {
        let reply = self.query(command)?;
        if reply.trim_end() == "OK" {
            return Ok(());
        }
        warn!("Laser answered {reply:?} to {command:?}, retrying");
        let reply = self.query(command)?;
        if reply.trim_end() == "OK" {
            Ok(())
        } else {
            Err(InstrumentError::unexpected(command, reply))
        }
    }

    /// Leave track mode for ready mode.
    pub fn stop_tracking(&mut self) -> Result<(), InstrumentError> {
        self.command("outp:trac off")
    }

    /// Whether an operation is still in progress.
    pub fn is_busy(&mut self) -> Result<bool, InstrumentError> {
        let reply = self.query("*OPC?")?;
        Ok(!parse_flag(&reply, "operation complete")?)
    }

    pub fn is_on(&mut self) -> Result<bool, InstrumentError> {
        let reply = self.query("outp?")?;
        parse_flag(&reply, "output state")
    }

    pub fn set_on(&mut self, on: bool) -> Result<(), InstrumentError> {
        self.command(&format!("outp {}", u8::from(on)))
    }

    /// Current wavelength in nm.
    pub fn wavelength(&mut self) -> Result<f64, InstrumentError> {
        self.query_f64("sens:wave")
    }

    pub fn set_wavelength(&mut self, setting: WavelengthSetting) -> Result<(), InstrumentError> {
        self.command(&format!("wave {setting}"))
    }

    /// Shortest wavelength this diode reaches.
    pub fn wavelength_min(&mut self) -> Result<f64, InstrumentError> {
        self.query_f64("wave ? min")
    }

    pub fn wavelength_max(&mut self) -> Result<f64, InstrumentError> {
        self.query_f64("wave ? max")
    }

    /// Piezo voltage, percent of full scale.
    pub fn piezo(&mut self) -> Result<f64, InstrumentError> {
        self.query_f64("sens:volt:piez")
    }

    pub fn set_piezo(&mut self, percent: f64) -> Result<(), InstrumentError> {
        self.command(&format!("volt {percent}"))
    }

    /// Front facet power in mW.
    pub fn power(&mut self) -> Result<f64, InstrumentError> {
        self.query_f64("sens:pow:fron")
    }

    /// Diode current in mA.
    pub fn current(&mut self) -> Result<f64, InstrumentError> {
        self.query_f64("sens:curr:diod")
    }

    pub fn set_current(&mut self, milliamps: f64) -> Result<(), InstrumentError> {
        self.command(&format!("curr {milliamps}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockPort;
    use crate::bus::SerialBus;
    use std::time::Duration;

    /// Bus that is not a serial line, like a GPIB address.
    struct Scripted {
        replies: Vec<&'static str>,
        sent: Vec<String>,
    }

    impl Bus for Scripted {
        fn write(&mut self, command: &str) -> Result<(), InstrumentError> {
            self.sent.push(command.to_string());
            Ok(())
        }

        fn read(&mut self) -> Result<String, InstrumentError> {
            Ok(self.replies.remove(0).to_string())
        }
    }

    fn serial_laser(port: &MockPort) -> Velocity6300<SerialBus<MockPort>> {
        port.reply("New Focus 6300\r");
        Velocity6300::new(SerialBus::new(port.clone(), "\r").with_lag(Duration::ZERO)).unwrap()
    }

    #[test]
    fn serial_commands_are_prefixed() {
        let port = MockPort::new();
        let mut laser = serial_laser(&port);
        port.reply("OK\r");
        laser.set_on(true).unwrap();
        port.reply("780.2400\r");
        assert_eq!(laser.wavelength().unwrap(), 780.24);
        assert_eq!(
            port.written_strings(),
            vec!["@*IDN?\r", "@outp 1\r", "@sens:wave\r"]
        );
    }

    #[test]
    fn gpib_commands_are_not_prefixed() {
        let bus = Scripted {
            replies: vec!["New Focus 6300", "OK", "1"],
            sent: Vec::new(),
        };
        let mut laser = Velocity6300::new(bus).unwrap();
        laser.set_wavelength(WavelengthSetting::Max).unwrap();
        assert!(!laser.is_busy().unwrap());
        assert_eq!(laser.bus.sent, vec!["*IDN?", "wave max", "*OPC?"]);
    }

    #[test]
    fn command_is_retried_once() {
        let port = MockPort::new();
        let mut laser = serial_laser(&port);
        port.reply("ERR\r");
        port.reply("OK\r");
        laser.set_current(45.5).unwrap();
        assert_eq!(&port.written_strings()[1..], &["@curr 45.5\r", "@curr 45.5\r"]);
    }

    #[test]
    fn rejected_command_is_an_error() {
        let port = MockPort::new();
        let mut laser = serial_laser(&port);
        port.reply("ERR\r");
        port.reply("ERR\r");
        assert!(matches!(
            laser.set_piezo(50.0),
            Err(InstrumentError::UnexpectedReply { .. })
        ));
    }

    #[test]
    fn wavelength_setting_formats() {
        assert_eq!(WavelengthSetting::from(780.5).to_string(), "780.5");
        assert_eq!(WavelengthSetting::Min.to_string(), "min");
    }
}
