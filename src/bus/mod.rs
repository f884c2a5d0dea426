//! Byte-stream transports and the command/reply [`Bus`] abstraction.
//!
//! Instrument drivers only ever talk to a [`Bus`]: write an ASCII command,
//! read back an ASCII reply. Serial ports, Prologix GPIB addresses and
//! shared handles all implement it, so the same driver works over RS-232 or
//! GPIB without changes.

use log::trace;
use parking_lot::Mutex;
use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use crate::error::InstrumentError;

#[cfg(test)]
pub(crate) mod mock;
pub mod serial;
pub mod traffic;

pub use serial::{SerialBus, SerialSettings};
pub use traffic::TrafficLog;

/// A raw byte stream that can report how many bytes are waiting.
pub trait Port: Read + Write + Send {
    /// Number of bytes that can be read without blocking.
    fn bytes_to_read(&self) -> io::Result<usize>;

    /// Discard everything in the input buffer.
    fn clear_input(&mut self) -> io::Result<()>;
}

impl Port for Box<dyn SerialPort> {
    fn bytes_to_read(&self) -> io::Result<usize> {
        (**self)
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        (**self).clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

impl Port for TcpStream {
    fn bytes_to_read(&self) -> io::Result<usize> {
        let mut probe = [0u8; 4096];
        self.set_nonblocking(true)?;
        let peeked = self.peek(&mut probe);
        self.set_nonblocking(false)?;
        match peeked {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; 4096];
        let cap = scratch.len();
        loop {
            let waiting = self.bytes_to_read()?;
            if waiting == 0 {
                return Ok(());
            }
            let n = self.read(&mut scratch[..waiting.min(cap)])?;
            trace!("Discarded {n} stale bytes");
            if n == 0 {
                return Ok(());
            }
        }
    }
}

/// Command/reply access to a single instrument.
pub trait Bus {
    /// Send a command. Termination characters are the bus's business.
    fn write(&mut self, command: &str) -> Result<(), InstrumentError>;

    /// Read the instrument's reply, with trailing whitespace removed.
    fn read(&mut self) -> Result<String, InstrumentError>;

    /// Write a query, then read its reply.
    fn ask(&mut self, query: &str) -> Result<String, InstrumentError> {
        self.write(query)?;
        self.read()
    }

    /// True when the instrument sits directly on an RS-232 line.
    fn is_serial(&self) -> bool {
        false
    }
}

impl<B: Bus + ?Sized> Bus for Box<B> {
    fn write(&mut self, command: &str) -> Result<(), InstrumentError> {
        (**self).write(command)
    }

    fn read(&mut self) -> Result<String, InstrumentError> {
        (**self).read()
    }

    fn ask(&mut self, query: &str) -> Result<String, InstrumentError> {
        (**self).ask(query)
    }

    fn is_serial(&self) -> bool {
        (**self).is_serial()
    }
}

/// A bus shared by several drivers, e.g. the axes of one motion controller.
///
/// The lock is held for the whole of an `ask`, so a query and its reply are
/// never interleaved with another driver's traffic.
impl<B: Bus + ?Sized> Bus for Arc<Mutex<B>> {
    fn write(&mut self, command: &str) -> Result<(), InstrumentError> {
        self.lock().write(command)
    }

    fn read(&mut self) -> Result<String, InstrumentError> {
        self.lock().read()
    }

    fn ask(&mut self, query: &str) -> Result<String, InstrumentError> {
        self.lock().ask(query)
    }

    fn is_serial(&self) -> bool {
        self.lock().is_serial()
    }
}

/// Wrap a bus so it can be handed to several drivers.
pub fn shared<B: Bus>(bus: B) -> Arc<Mutex<B>> {
    Arc::new(Mutex::new(bus))
}

#[cfg(test)]
mod tests {
    use super::mock::MockPort;
    use super::*;
    use std::time::Duration;

    #[test]
    fn shared_bus_forwards_to_inner_bus() {
        let port = MockPort::new();
        port.reply("");
        port.reply("1\r\n");
        let bus = SerialBus::new(port.clone(), "\r\n").with_lag(Duration::ZERO);
        let mut first = shared(bus);
        let mut second = first.clone();

        second.write("1MO").unwrap();
        assert_eq!(first.ask("1MO?").unwrap(), "1");
        assert!(first.is_serial());
        assert_eq!(port.written_strings(), vec!["1MO\r\n", "1MO?\r\n"]);
    }

    #[test]
    fn tcp_clear_input_discards_waiting_bytes() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"stale reply\r\n").unwrap();
            stream
        });

        let mut client = TcpStream::connect(addr).unwrap();
        let _server_side = server.join().unwrap();
        let waited = crate::utils::poll_until(
            || Ok::<_, std::convert::Infallible>(client.bytes_to_read().unwrap() == 13),
            Duration::from_secs(5),
            Duration::from_millis(5),
        );
        assert!(waited.is_ok());

        client.clear_input().unwrap();
        assert_eq!(client.bytes_to_read().unwrap(), 0);
    }
}
