//! Burleigh wavemeter in broadcast mode.
//!
//! The meter streams lines of `measurement,display,system` over RS-232
//! without being asked. Every query drops what has piled up in the buffer
//! and waits for the next fresh line.

use log::{debug, info};
use serialport::SerialPort;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::bus::{Port, SerialBus, SerialSettings};
use crate::error::InstrumentError;

pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";
pub const BAUD_RATE: u32 = 9600;

const UNIT_MASKS: [(u16, WavemeterUnit); 3] = [
    (0x0009, WavemeterUnit::Nanometer),
    (0x0012, WavemeterUnit::Wavenumber),
    (0x0024, WavemeterUnit::Gigahertz),
];

const DISPLAY_MASKS: [(u16, DisplayMode); 2] = [
    (0x0040, DisplayMode::Wavelength),
    (0x0080, DisplayMode::Deviation),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WavemeterUnit {
    Nanometer,
    Wavenumber,
    Gigahertz,
}

impl fmt::Display for WavemeterUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self {
            WavemeterUnit::Nanometer => "nm",
            WavemeterUnit::Wavenumber => "cm-1",
            WavemeterUnit::Gigahertz => "GHz",
        };
        write!(f, "{unit}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    Wavelength,
    Deviation,
}

/// Pick out the table entry whose mask matches the bits of `code` covered
/// by all the masks together.
fn decode<T: Copy>(code: u16, table: &[(u16, T)], what: &str) -> Result<T, InstrumentError> {
    let all = table.iter().fold(0, |acc, (mask, _)| acc | mask);
    let bits = code & all;
    table
        .iter()
        .find(|(mask, _)| *mask == bits)
        .map(|(_, value)| *value)
        .ok_or_else(|| InstrumentError::parse(what, format!("{code:#06x}")))
}

/// One broadcast line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Broadcast {
    /// `None` when the meter shows something other than a number, such as
    /// a low-signal warning.
    pub reading: Option<f64>,
    pub display: u16,
    pub system: u16,
}

impl Broadcast {
    pub fn unit(&self) -> Result<WavemeterUnit, InstrumentError> {
        decode(self.display, &UNIT_MASKS, "wavemeter unit")
    }

    pub fn display_mode(&self) -> Result<DisplayMode, InstrumentError> {
        decode(self.display, &DISPLAY_MASKS, "wavemeter display")
    }
}

/// Parse `measurement,display,system`, with the two status words in hex.
pub fn parse_broadcast(line: &str) -> Result<Broadcast, InstrumentError> {
    let fields: Vec<&str> = line.trim().split(',').collect();
    let [measurement, display, system] = fields[..] else {
        return Err(InstrumentError::parse("wavemeter broadcast", line));
    };
    let hex = |field: &str| {
        u16::from_str_radix(field.trim(), 16)
            .map_err(|_| InstrumentError::parse("wavemeter status word", line))
    };
    Ok(Broadcast {
        reading: measurement.trim().parse::<f64>().ok(),
        display: hex(display)?,
        system: hex(system)?,
    })
}

pub struct Burleigh<P: Port> {
    bus: SerialBus<P>,
}

impl Burleigh<Box<dyn SerialPort>> {
    pub fn open(port: &str) -> Result<Self, InstrumentError> {
        let bus = SerialSettings::new(port, BAUD_RATE)
            .timeout(Duration::from_secs(2))
            .open()?;
        info!("Burleigh wavemeter on {port}");
        Ok(Self::new(bus))
    }
}

impl<P: Port> Burleigh<P> {
    pub fn new(bus: SerialBus<P>) -> Self {
        Self { bus }
    }

    /// Drop old measurements from the buffer.
    pub fn purge(&mut self) -> Result<(), InstrumentError> {
        self.bus.purge().map(|_| ())
    }

    fn next_broadcast(&mut self) -> Result<Broadcast, InstrumentError> {
        let line = self.bus.read_line()?;
        debug!("wavemeter: {}", line.trim_end());
        parse_broadcast(&line)
    }

    /// A fresh broadcast.
    pub fn reading(&mut self) -> Result<Broadcast, InstrumentError> {
        self.purge()?;
        self.next_broadcast()
    }

    /// Current wavelength, or frequency, in the displayed unit.
    pub fn wavelength(&mut self) -> Result<Option<f64>, InstrumentError> {
        Ok(self.reading()?.reading)
    }

    pub fn unit(&mut self) -> Result<WavemeterUnit, InstrumentError> {
        self.reading()?.unit()
    }

    pub fn display(&mut self) -> Result<DisplayMode, InstrumentError> {
        self.reading()?.display_mode()
    }

    /// Readings as they arrive, timed from the start of the stream, until
    /// `stop` is set or the line fails.
    pub fn stream<'a>(&'a mut self, stop: &'a AtomicBool) -> WavemeterStream<'a, P> {
        WavemeterStream {
            meter: self,
            stop,
            start: None,
            failed: false,
        }
    }
}

pub struct WavemeterStream<'a, P: Port> {
    meter: &'a mut Burleigh<P>,
    stop: &'a AtomicBool,
    start: Option<Instant>,
    failed: bool,
}

impl<P: Port> Iterator for WavemeterStream<'_, P> {
    type Item = Result<(f64, Option<f64>), InstrumentError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.stop.load(Ordering::SeqCst) {
            return None;
        }
        let start = match self.start {
            Some(start) => start,
            None => {
                if let Err(e) = self.meter.purge() {
                    self.failed = true;
                    return Some(Err(e));
                }
                *self.start.insert(Instant::now())
            }
        };
        match self.meter.next_broadcast() {
            Ok(broadcast) => Some(Ok((start.elapsed().as_secs_f64(), broadcast.reading))),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
