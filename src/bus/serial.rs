use log::{debug, trace};
use serde::{Deserialize, Serialize};
use serialport::{FlowControl, SerialPort};
use std::path::PathBuf;
use std::time::Duration;

use super::{Bus, Port, TrafficLog};
use crate::error::InstrumentError;
use crate::utils::show_newlines;

/// Pause between writing a query and collecting the reply.
pub const DEFAULT_ASK_LAG: Duration = Duration::from_millis(50);

/// Settings for opening an RS-232 port.
///
/// # Examples
///
/// ```no_run
/// use optolab::bus::SerialSettings;
///
/// let bus = SerialSettings::new("/dev/ttyUSB0", 19200)
///     .rtscts(true)
///     .term_chars("\r\n")
///     .open()?;
/// # Ok::<(), optolab::InstrumentError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub rtscts: bool,
    /// Appended to every command written through [`Bus::write`].
    #[serde(default)]
    pub term_chars: String,
    /// Append a human-readable record of all traffic to this file.
    #[serde(default)]
    pub traffic_log: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    1000
}

impl SerialSettings {
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            timeout_ms: default_timeout_ms(),
            rtscts: false,
            term_chars: String::new(),
            traffic_log: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn rtscts(mut self, enabled: bool) -> Self {
        self.rtscts = enabled;
        self
    }

    pub fn term_chars(mut self, term: &str) -> Self {
        self.term_chars = term.to_string();
        self
    }

    pub fn traffic_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.traffic_log = Some(path.into());
        self
    }

    /// Open the port.
    pub fn open(&self) -> Result<SerialBus<Box<dyn SerialPort>>, InstrumentError> {
        debug!("Opening {} at {} baud", self.port, self.baud_rate);
        let flow = if self.rtscts {
            FlowControl::Hardware
        } else {
            FlowControl::None
        };
        let port = serialport::new(&self.port, self.baud_rate)
            .timeout(Duration::from_millis(self.timeout_ms))
            .flow_control(flow)
            .open()?;

        let mut bus = SerialBus::new(port, &self.term_chars).with_name(&self.port);
        if let Some(path) = &self.traffic_log {
            bus = bus.with_traffic_log(TrafficLog::open(path)?);
        }
        Ok(bus)
    }
}

/// An instrument on an RS-232 line.
///
/// Besides the line-oriented [`Bus`] interface this exposes the raw byte
/// operations some controllers need (single status bytes, non-ASCII
/// control characters, counting waiting bytes).
pub struct SerialBus<P: Port> {
    port: P,
    name: String,
    term_chars: String,
    lag: Duration,
    traffic: Option<TrafficLog>,
}

impl<P: Port> SerialBus<P> {
    pub fn new(port: P, term_chars: &str) -> Self {
        Self {
            port,
            name: "serial".to_string(),
            term_chars: term_chars.to_string(),
            lag: DEFAULT_ASK_LAG,
            traffic: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set the pause between writing a query and reading its reply.
    pub fn with_lag(mut self, lag: Duration) -> Self {
        self.lag = lag;
        self
    }

    pub fn with_traffic_log(mut self, log: TrafficLog) -> Self {
        self.traffic = Some(log);
        self
    }

    pub fn start_traffic_log(&mut self, log: TrafficLog) {
        self.traffic = Some(log);
    }

    pub fn lag(&self) -> Duration {
        self.lag
    }

    fn record(&mut self, event: &str, data: &[u8]) {
        let text = String::from_utf8_lossy(data);
        trace!("{} {event}: {}", self.name, show_newlines(&text));
        if let Some(log) = self.traffic.as_mut() {
            log.record(event, &text);
        }
    }

    /// Write bytes exactly as given.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), InstrumentError> {
        std::io::Write::write_all(&mut self.port, data)
            .and_then(|_| std::io::Write::flush(&mut self.port))
            .map_err(|e| InstrumentError::io(e, format!("writing to {}", self.name)))?;
        self.record("write", data);
        Ok(())
    }

    /// Number of bytes waiting in the input buffer.
    pub fn bytes_waiting(&self) -> Result<usize, InstrumentError> {
        self.port
            .bytes_to_read()
            .map_err(|e| InstrumentError::io(e, format!("polling {}", self.name)))
    }

    /// Read exactly `count` bytes, blocking up to the port timeout.
    pub fn read_exact_bytes(&mut self, count: usize) -> Result<Vec<u8>, InstrumentError> {
        let mut buf = vec![0u8; count];
        self.port.read_exact(&mut buf).map_err(|e| {
            InstrumentError::io(e, format!("reading {count} bytes from {}", self.name))
        })?;
        self.record("read", &buf);
        Ok(buf)
    }

    /// Read every byte currently waiting, without blocking.
    pub fn read_available(&mut self) -> Result<Vec<u8>, InstrumentError> {
        let waiting = self.bytes_waiting()?;
        if waiting == 0 {
            return Ok(Vec::new());
        }
        self.read_exact_bytes(waiting)
    }

    /// Read one line, up to and including `\n`.
    pub fn read_line(&mut self) -> Result<String, InstrumentError> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.port
                .read_exact(&mut byte)
                .map_err(|e| InstrumentError::io(e, format!("reading line from {}", self.name)))?;
            line.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
        }
        self.record("read", &line);
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Throw away whatever is waiting. Returns how many bytes were dropped.
    pub fn purge(&mut self) -> Result<usize, InstrumentError> {
        let stale = self.read_available()?;
        if !stale.is_empty() {
            debug!("{}: purged {} stale bytes", self.name, stale.len());
        }
        Ok(stale.len())
    }

    pub fn into_inner(self) -> P {
        self.port
    }
}

impl<P: Port> Bus for SerialBus<P> {
    fn write(&mut self, command: &str) -> Result<(), InstrumentError> {
        let mut frame = command.as_bytes().to_vec();
        frame.extend_from_slice(self.term_chars.as_bytes());
        self.write_bytes(&frame)
    }

    fn read(&mut self) -> Result<String, InstrumentError> {
        let data = self.read_available()?;
        Ok(String::from_utf8_lossy(&data).trim_end().to_string())
    }

    fn ask(&mut self, query: &str) -> Result<String, InstrumentError> {
        self.write(query)?;
        std::thread::sleep(self.lag);
        self.read()
    }

    fn is_serial(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockPort;

    fn bus(port: &MockPort) -> SerialBus<MockPort> {
        SerialBus::new(port.clone(), "\r").with_lag(Duration::ZERO)
    }

    #[test]
    fn write_appends_termination() {
        let port = MockPort::new();
        let mut bus = bus(&port);
        bus.write("outp 1").unwrap();
        assert_eq!(port.written_strings(), vec!["outp 1\r"]);
    }

    #[test]
    fn ask_reads_everything_waiting() {
        let port = MockPort::new();
        port.reply("OK\r\n");
        let mut bus = bus(&port);
        assert_eq!(bus.ask("@outp 1").unwrap(), "OK");
        assert_eq!(port.unread(), 0);
    }

    #[test]
    fn read_with_nothing_waiting_is_empty() {
        let port = MockPort::new();
        let mut bus = bus(&port);
        assert_eq!(bus.read().unwrap(), "");
    }

    #[test]
    fn raw_bytes_are_not_terminated() {
        let port = MockPort::new();
        let mut bus = bus(&port);
        bus.write_bytes(&[0xF7]).unwrap();
        assert_eq!(port.written(), vec![vec![0xF7]]);
    }

    #[test]
    fn read_line_stops_at_newline() {
        let port = MockPort::new();
        port.preload("633.0,49,0\r\n633.1,49,0\r\n");
        let mut bus = bus(&port);
        assert_eq!(bus.read_line().unwrap(), "633.0,49,0\r\n");
        assert_eq!(bus.purge().unwrap(), 12);
        assert_eq!(bus.bytes_waiting().unwrap(), 0);
    }

    #[test]
    fn read_exact_on_empty_port_times_out() {
        let port = MockPort::new();
        let mut bus = bus(&port);
        assert!(matches!(
            bus.read_exact_bytes(1),
            Err(InstrumentError::Timeout(_))
        ));
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: SerialSettings =
            serde_json::from_str(r#"{"port": "/dev/ttyS0", "baud_rate": 9600}"#).unwrap();
        assert_eq!(settings, SerialSettings::new("/dev/ttyS0", 9600));
    }
}
