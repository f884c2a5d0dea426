//! Tektronix TDS3000 series oscilloscopes.
//!
//! Works over GPIB, RS-232 or Ethernet. On RS-232 use hardware flow
//! control and a null modem cable. The baud rate is set from the scope's
//! Utility menu, so callers must pass whatever the front panel shows.

use log::debug;
use serialport::SerialPort;

use crate::bus::{Bus, SerialBus, SerialSettings};
use crate::error::InstrumentError;
use crate::utils::{format_sci, parse_f64, sciround};

pub const DEFAULT_PORT: &str = "/dev/ttyS0";

/// Time divisions the TDS3000 accepts, in seconds: a 1-2-4 sequence from
/// 10 s down to 1 ns. The fastest setting depends on the model.
pub const TIME_DIVISIONS: [f64; 31] = [
    10.0, 4.0, 2.0, 1.0, 4e-1, 2e-1, 1e-1, 4e-2, 2e-2, 1e-2, 4e-3, 2e-3, 1e-3, 4e-4, 2e-4, 1e-4,
    4e-5, 2e-5, 1e-5, 4e-6, 2e-6, 1e-6, 4e-7, 2e-7, 1e-7, 4e-8, 2e-8, 1e-8, 4e-9, 2e-9, 1e-9,
];

fn is_allowed(seconds: f64) -> bool {
    TIME_DIVISIONS
        .iter()
        .any(|&allowed| ((seconds - allowed) / allowed).abs() < 1e-9)
}

pub struct Tds3000<B: Bus> {
    bus: B,
}

impl Tds3000<SerialBus<Box<dyn SerialPort>>> {
    /// RS-232 settings for a scope configured to `baud_rate`.
    pub fn serial_settings(port: Option<&str>, baud_rate: u32) -> SerialSettings {
        SerialSettings::new(port.unwrap_or(DEFAULT_PORT), baud_rate)
            .rtscts(true)
            .term_chars("\n")
    }

    /// Open the scope on [`DEFAULT_PORT`] or another serial port.
    pub fn open(port: Option<&str>, baud_rate: u32) -> Result<Self, InstrumentError> {
        Ok(Self::new(Self::serial_settings(port, baud_rate).open()?))
    }
}

impl<B: Bus> Tds3000<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    /// Time per division in seconds.
    pub fn time_per_division(&mut self) -> Result<f64, InstrumentError> {
        let reply = self.bus.ask("HOR:MAI:SCA?")?;
        parse_f64(&reply, "time per division")
    }

    /// Set the time per division, rounded to one significant figure.
    pub fn set_time_per_division(&mut self, seconds: f64) -> Result<(), InstrumentError> {
        let rounded = sciround(seconds, 1);
        if !is_allowed(rounded) {
            return Err(InstrumentError::OutOfRange(format!(
                "time per division {seconds} s is not in the 1-2-4 sequence from 10 s to 1 ns"
            )));
        }
        debug!("Time per division {seconds} -> {rounded}");
        self.bus
            .write(&format!("HOR:MAI:SCA {}", format_sci(rounded)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockPort;
    use std::time::Duration;

    fn scope(port: &MockPort) -> Tds3000<SerialBus<MockPort>> {
        Tds3000::new(SerialBus::new(port.clone(), "\n").with_lag(Duration::ZERO))
    }

    #[test]
    fn accepted_divisions_are_rounded_and_sent() {
        let port = MockPort::new();
        let mut tds = scope(&port);
        tds.set_time_per_division(0.0041).unwrap();
        tds.set_time_per_division(10.0).unwrap();
        tds.set_time_per_division(1.04e-9).unwrap();
        assert_eq!(
            port.written_strings(),
            vec![
                "HOR:MAI:SCA 4E-03\n",
                "HOR:MAI:SCA 1E+01\n",
                "HOR:MAI:SCA 1E-09\n"
            ]
        );
    }

    #[test]
    fn other_divisions_are_rejected() {
        let port = MockPort::new();
        let mut tds = scope(&port);
        for bad in [5e-3, 20.0, 3e-6, 5e-10] {
            assert!(matches!(
                tds.set_time_per_division(bad),
                Err(InstrumentError::OutOfRange(_))
            ));
        }
        assert!(port.written().is_empty());
    }

    #[test]
    fn serial_settings_use_the_given_baud_rate() {
        let settings = Tds3000::serial_settings(None, 38400);
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.baud_rate, 38400);
        assert!(settings.rtscts);
        assert_eq!(settings.term_chars, "\n");
    }

    #[test]
    fn reads_time_per_division() {
        let port = MockPort::new();
        port.reply("4.0E-6\n");
        let mut tds = scope(&port);
        assert_eq!(tds.time_per_division().unwrap(), 4e-6);
        assert_eq!(port.written_strings(), vec!["HOR:MAI:SCA?\n"]);
    }
}
