//! Agilent 8648A/B/C/D RF signal generators, factory default GPIB address 18.

use log::{debug, info};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::bus::Bus;
use crate::error::InstrumentError;
use crate::utils::{parse_f64, parse_flag};

pub const AG8648_ADDR: u8 = 18;

/// Units the output amplitude can be set in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AmplitudeUnit {
    #[default]
    Dbm,
    Mv,
    Uv,
    Mvemf,
    Uvemf,
    Dbuv,
    Dbuvemf,
}

impl fmt::Display for AmplitudeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self {
            AmplitudeUnit::Dbm => "DBM",
            AmplitudeUnit::Mv => "MV",
            AmplitudeUnit::Uv => "UV",
            AmplitudeUnit::Mvemf => "MVEMF",
            AmplitudeUnit::Uvemf => "UVEMF",
            AmplitudeUnit::Dbuv => "DBUV",
            AmplitudeUnit::Dbuvemf => "DBUVEMF",
        };
        write!(f, "{unit}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrequencyUnit {
    #[default]
    Mhz,
    Khz,
}

pub struct Ag8648<B: Bus> {
    bus: B,
}

impl<B: Bus> Ag8648<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    fn on_off(on: bool) -> &'static str {
        if on {
            "ON"
        } else {
            "OFF"
        }
    }

    /// Whether the RF output is on.
    pub fn is_on(&mut self) -> Result<bool, InstrumentError> {
        let reply = self.bus.ask("OUTP:STAT?")?;
        parse_flag(&reply, "output state")
    }

    pub fn set_on(&mut self, on: bool) -> Result<(), InstrumentError> {
        self.bus.write(&format!("OUTP:STAT {}", Self::on_off(on)))
    }

    /// Whether pulse modulation is enabled.
    pub fn pulse(&mut self) -> Result<bool, InstrumentError> {
        let reply = self.bus.ask("PULM:STAT?")?;
        parse_flag(&reply, "pulse modulation")
    }

    pub fn set_pulse(&mut self, on: bool) -> Result<(), InstrumentError> {
        self.bus.write(&format!("PULM:STAT {}", Self::on_off(on)))
    }

    /// Output amplitude in dBm.
    pub fn amplitude(&mut self) -> Result<f64, InstrumentError> {
        let reply = self.bus.ask("POW:AMPL?")?;
        parse_f64(&reply, "amplitude")
    }

    pub fn set_amplitude(
        &mut self,
        value: f64,
        unit: AmplitudeUnit,
    ) -> Result<(), InstrumentError> {
        self.bus.write(&format!("POW:AMPL {value:.1} {unit}"))
    }

    /// CW frequency in MHz.
    pub fn frequency(&mut self) -> Result<f64, InstrumentError> {
        let reply = self.bus.ask("FREQ:CW?")?;
        Ok(parse_f64(&reply, "frequency")? / 1e6)
    }

    /// Set the CW frequency. Resolution is 10 Hz either way.
    pub fn set_frequency(
        &mut self,
        value: f64,
        unit: FrequencyUnit,
    ) -> Result<(), InstrumentError> {
        let command = match unit {
            FrequencyUnit::Mhz => format!("FREQ:CW {value:.5} MHZ"),
            FrequencyUnit::Khz => format!("FREQ:CW {value:.2} KHZ"),
        };
        self.bus.write(&command)
    }

    /// Toggle the output every half `interval` until `stop` is set, then
    /// restore the output state found at the start. Handy when aligning AOMs.
    pub fn blink(&mut self, interval: Duration, stop: &AtomicBool) -> Result<(), InstrumentError> {
        let initial = self.is_on()?;
        info!("Blinking RF output every {interval:?}");
        let half = interval / 2;
        let mut result = Ok(());
        while !stop.load(Ordering::SeqCst) {
            result = self
                .set_on(true)
                .map(|_| std::thread::sleep(half))
                .and_then(|_| self.set_on(false))
                .map(|_| std::thread::sleep(half));
            if result.is_err() {
                break;
            }
        }
        debug!("Restoring RF output to {}", Self::on_off(initial));
        self.set_on(initial)?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockPort;
    use crate::bus::SerialBus;
    use std::sync::Arc;

    fn generator(port: &MockPort) -> Ag8648<SerialBus<MockPort>> {
        Ag8648::new(SerialBus::new(port.clone(), "\n").with_lag(Duration::ZERO))
    }

    #[test]
    fn amplitude_and_frequency_formatting() {
        let port = MockPort::new();
        let mut rf = generator(&port);
        rf.set_amplitude(-10.0, AmplitudeUnit::default()).unwrap();
        rf.set_amplitude(12.345, AmplitudeUnit::Mvemf).unwrap();
        rf.set_frequency(80.0, FrequencyUnit::Mhz).unwrap();
        rf.set_frequency(455.123, FrequencyUnit::Khz).unwrap();
        assert_eq!(
            port.written_strings(),
            vec![
                "POW:AMPL -10.0 DBM\n",
                "POW:AMPL 12.3 MVEMF\n",
                "FREQ:CW 80.00000 MHZ\n",
                "FREQ:CW 455.12 KHZ\n"
            ]
        );
    }

    #[test]
    fn readings() {
        let port = MockPort::new();
        port.reply("+8.0000000000E+07\n");
        port.reply("-5.0\n");
        port.reply("1\n");
        port.reply("0\n");
        let mut rf = generator(&port);
        assert_eq!(rf.frequency().unwrap(), 80.0);
        assert_eq!(rf.amplitude().unwrap(), -5.0);
        assert!(rf.is_on().unwrap());
        assert!(!rf.pulse().unwrap());
    }

    #[test]
    fn blink_restores_initial_state() {
        let port = MockPort::new();
        port.reply("0\n");
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            flag.store(true, Ordering::SeqCst);
        });

        let mut rf = generator(&port);
        rf.blink(Duration::from_millis(10), &stop).unwrap();
        handle.join().unwrap();

        let sent = port.written_strings();
        assert!(sent.contains(&"OUTP:STAT ON\n".to_string()));
        assert_eq!(sent.last().unwrap(), "OUTP:STAT OFF\n");
    }

    #[test]
    fn blink_with_stop_already_set_only_restores() {
        let port = MockPort::new();
        port.reply("1\n");
        let mut rf = generator(&port);
        rf.blink(Duration::from_millis(10), &AtomicBool::new(true))
            .unwrap();
        assert_eq!(
            port.written_strings(),
            vec!["OUTP:STAT?\n", "OUTP:STAT ON\n"]
        );
    }
}
