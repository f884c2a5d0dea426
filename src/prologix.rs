//! GPIB access through Prologix USB and Ethernet bridges.
//!
//! A Prologix controller talks to one GPIB address at a time. Each
//! [`GpibInstrument`] remembers its own address and read-after-write setting
//! and re-addresses the controller only when those differ from what the
//! controller last had, so switching back and forth between instruments
//! costs one `++addr` per switch.
//!
//! ```no_run
//! use optolab::prologix::{GpibInstrument, PrologixBuilder};
//! use optolab::bus::Bus;
//!
//! let plx = PrologixBuilder::new().usb("/dev/ttyUSBgpib").build()?;
//! let mut keithley = GpibInstrument::new(plx, 12);
//! println!("{}", keithley.ask("*IDN?")?);
//! # Ok::<(), optolab::InstrumentError>(())
//! ```

use log::{debug, info, warn};
use parking_lot::Mutex;
use serialport::SerialPort;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use crate::bus::{Bus, Port, SerialBus, SerialSettings};
use crate::error::InstrumentError;
use crate::utils::{parse_flag, parse_i64};

/// TCP port Prologix Ethernet controllers listen on.
pub const ETHERNET_PORT: u16 = 1234;
pub const USB_BAUD_RATE: u32 = 115_200;
/// Pause after each write, giving the controller time to pass it on.
pub const DEFAULT_LAG: Duration = Duration::from_millis(100);
const ETHERNET_READ_SIZE: usize = 100;

/// The byte-level link between the host and a Prologix controller.
pub trait ControllerLink: Send {
    /// Send one line, adding whatever terminator the link needs.
    fn send_line(&mut self, line: &str) -> Result<(), InstrumentError>;

    /// Collect the pending response, with trailing whitespace removed.
    fn read_all(&mut self) -> Result<String, InstrumentError>;

    /// Drop stale input before a query.
    fn clear(&mut self) -> Result<(), InstrumentError>;
}

impl<L: ControllerLink + ?Sized> ControllerLink for Box<L> {
    fn send_line(&mut self, line: &str) -> Result<(), InstrumentError> {
        (**self).send_line(line)
    }

    fn read_all(&mut self) -> Result<String, InstrumentError> {
        (**self).read_all()
    }

    fn clear(&mut self) -> Result<(), InstrumentError> {
        (**self).clear()
    }
}

/// GPIB-USB controller: a virtual serial port, lines end in CR.
pub struct UsbLink<P: Port> {
    bus: SerialBus<P>,
}

impl<P: Port> UsbLink<P> {
    pub fn new(port: P) -> Self {
        Self {
            bus: SerialBus::new(port, "\r").with_name("prologix-usb"),
        }
    }
}

impl<P: Port> ControllerLink for UsbLink<P> {
    fn send_line(&mut self, line: &str) -> Result<(), InstrumentError> {
        self.bus.write(line)
    }

    fn read_all(&mut self) -> Result<String, InstrumentError> {
        self.bus.read()
    }

    fn clear(&mut self) -> Result<(), InstrumentError> {
        debug!("Clearing prologix input buffer, expecting nothing");
        self.bus.purge().map(|_| ())
    }
}

/// GPIB-Ethernet controller: a TCP stream, lines end in LF.
pub struct EthernetLink<S: Read + Write + Send> {
    stream: S,
}

impl<S: Read + Write + Send> EthernetLink<S> {
    /// Wrap a connected stream and switch the controller to controller mode.
    pub fn new(mut stream: S) -> Result<Self, InstrumentError> {
        stream
            .write_all(b"++mode 1\n")
            .and_then(|_| stream.flush())
            .map_err(|e| InstrumentError::io(e, "selecting prologix controller mode"))?;
        Ok(Self { stream })
    }
}

impl<S: Read + Write + Send> ControllerLink for EthernetLink<S> {
    fn send_line(&mut self, line: &str) -> Result<(), InstrumentError> {
        debug!("prologix-eth write: {line}");
        self.stream
            .write_all(format!("{line}\n").as_bytes())
            .and_then(|_| self.stream.flush())
            .map_err(|e| InstrumentError::io(e, format!("sending {line:?} to prologix")))
    }

    fn read_all(&mut self) -> Result<String, InstrumentError> {
        let mut buf = [0u8; ETHERNET_READ_SIZE];
        let n = self
            .stream
            .read(&mut buf)
            .map_err(|e| InstrumentError::io(e, "reading from prologix"))?;
        let reply = String::from_utf8_lossy(&buf[..n]).trim_end().to_string();
        debug!("prologix-eth read: {reply}");
        Ok(reply)
    }

    fn clear(&mut self) -> Result<(), InstrumentError> {
        Ok(())
    }
}

/// A Prologix controller, with the state it was last told cached locally.
pub struct Prologix<L: ControllerLink> {
    link: L,
    addr: u8,
    auto: bool,
    lag: Duration,
}

/// A controller shared between all instruments on its GPIB bus.
pub type SharedController<L = Box<dyn ControllerLink>> = Arc<Mutex<Prologix<L>>>;

impl<L: ControllerLink> Prologix<L> {
    /// Take over a link and read the controller's current address and
    /// read-after-write setting.
    pub fn with_link(link: L, lag: Duration) -> Result<Self, InstrumentError> {
        let mut controller = Self {
            link,
            addr: 0,
            auto: false,
            lag,
        };
        controller.addr()?;
        controller.auto()?;
        info!(
            "Prologix controller ready (addr {}, auto {})",
            controller.addr, controller.auto
        );
        Ok(controller)
    }

    /// Start-up for USB controllers: drop stale bytes and stop the controller
    /// from saving settings to EEPROM before anything else.
    pub fn start_usb(mut link: L, lag: Duration) -> Result<Self, InstrumentError> {
        link.clear()?;
        link.send_line("++savecfg 0")?;
        std::thread::sleep(lag);
        Self::with_link(link, lag)
    }

    pub fn into_shared(self) -> SharedController<L> {
        Arc::new(Mutex::new(self))
    }

    /// Send a line and wait `lag` afterwards.
    pub fn write(&mut self, command: &str, lag: Duration) -> Result<(), InstrumentError> {
        self.link.send_line(command)?;
        std::thread::sleep(lag);
        Ok(())
    }

    pub fn read_all(&mut self) -> Result<String, InstrumentError> {
        self.link.read_all()
    }

    /// Query the controller itself (a `++` command).
    pub fn ask(&mut self, query: &str) -> Result<String, InstrumentError> {
        self.link.clear()?;
        self.write(query, self.lag)?;
        self.read_all()
    }

    /// Ask the controller which GPIB address is selected.
    pub fn addr(&mut self) -> Result<u8, InstrumentError> {
        let reply = self.ask("++addr")?;
        let addr = parse_i64(&reply, "GPIB address")?;
        self.addr = u8::try_from(addr)
            .map_err(|_| InstrumentError::InvalidAddress(reply.clone()))?;
        Ok(self.addr)
    }

    /// Select a GPIB address.
    pub fn set_addr(&mut self, addr: u8) -> Result<(), InstrumentError> {
        // Cache first: the write sleeps, and an interrupted program must not
        // leave the cached address pointing at the old instrument.
        self.addr = addr;
        self.write(&format!("++addr {addr}"), self.lag)
    }

    /// Ask the controller for its read-after-write setting.
    pub fn auto(&mut self) -> Result<bool, InstrumentError> {
        let reply = self.ask("++auto")?;
        self.auto = parse_flag(&reply, "read-after-write flag")?;
        Ok(self.auto)
    }

    pub fn set_auto(&mut self, auto: bool) -> Result<(), InstrumentError> {
        self.auto = auto;
        self.write(&format!("++auto {}", u8::from(auto)), self.lag)
    }

    /// Controller firmware version string.
    pub fn version(&mut self) -> Result<String, InstrumentError> {
        self.ask("++ver")
    }

    /// Whether the controller saves its settings to EEPROM.
    pub fn savecfg(&mut self) -> Result<bool, InstrumentError> {
        let reply = self.ask("++savecfg")?;
        if reply == "Unrecognized command" {
            return Err(InstrumentError::unexpected(
                "++savecfg",
                "Unrecognized command: update the controller firmware \
                 or risk wearing out its EEPROM",
            ));
        }
        parse_flag(&reply, "savecfg flag")
    }

    pub fn set_savecfg(&mut self, save: bool) -> Result<(), InstrumentError> {
        self.write(&format!("++savecfg {}", u8::from(save)), self.lag)
    }

    /// Address last selected, without asking the controller.
    pub fn cached_addr(&self) -> u8 {
        self.addr
    }

    /// Read-after-write setting last selected, without asking the controller.
    pub fn cached_auto(&self) -> bool {
        self.auto
    }

    pub fn lag(&self) -> Duration {
        self.lag
    }
}

#[derive(Debug, Clone)]
enum Transport {
    Usb(String),
    Ethernet(String),
}

/// Builder for Prologix controllers.
///
/// ```no_run
/// use std::time::Duration;
/// use optolab::prologix::PrologixBuilder;
///
/// let plx = PrologixBuilder::new()
///     .ethernet("192.168.1.50")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok::<(), optolab::InstrumentError>(())
/// ```
#[derive(Debug, Clone)]
pub struct PrologixBuilder {
    transport: Option<Transport>,
    lag: Duration,
    timeout: Duration,
}

impl Default for PrologixBuilder {
    fn default() -> Self {
        Self {
            transport: None,
            lag: DEFAULT_LAG,
            timeout: Duration::from_secs(5),
        }
    }
}

impl PrologixBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// GPIB-USB controller on a virtual serial port, e.g. `/dev/ttyUSBgpib` or `COM1`.
    pub fn usb(mut self, port: &str) -> Self {
        self.transport = Some(Transport::Usb(port.to_string()));
        self
    }

    /// GPIB-Ethernet controller at an IP address.
    pub fn ethernet(mut self, ip: &str) -> Self {
        self.transport = Some(Transport::Ethernet(ip.to_string()));
        self
    }

    /// Pause after each write to the controller.
    pub fn lag(mut self, lag: Duration) -> Self {
        self.lag = lag;
        self
    }

    /// Connect and read timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<SharedController, InstrumentError> {
        let transport = self.transport.clone().ok_or_else(|| {
            InstrumentError::Config("prologix transport (usb or ethernet) must be specified".into())
        })?;
        let controller = match transport {
            Transport::Usb(port) => {
                let serial = SerialSettings::new(&port, USB_BAUD_RATE)
                    .rtscts(true)
                    .timeout(self.timeout)
                    .open()?
                    .into_inner();
                let link: Box<dyn ControllerLink> =
                    Box::new(UsbLink::<Box<dyn SerialPort>>::new(serial));
                Prologix::start_usb(link, self.lag)?
            }
            Transport::Ethernet(ip) => {
                let link: Box<dyn ControllerLink> = Box::new(self.connect_ethernet(&ip)?);
                Prologix::with_link(link, self.lag)?
            }
        };
        Ok(controller.into_shared())
    }

    fn connect_ethernet(&self, ip: &str) -> Result<EthernetLink<TcpStream>, InstrumentError> {
        let socket_addr: SocketAddr = format!("{ip}:{ETHERNET_PORT}")
            .parse()
            .map_err(|_| InstrumentError::InvalidAddress(ip.to_string()))?;
        debug!("Connecting to Prologix at {socket_addr}");
        let stream = TcpStream::connect_timeout(&socket_addr, self.timeout).map_err(|e| {
            warn!("Failed to connect to {socket_addr}: {e}");
            InstrumentError::io(e, format!("connecting to prologix at {ip}"))
        })?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        EthernetLink::new(stream)
    }
}

/// Keeps one controller per USB port or IP address.
#[derive(Default)]
pub struct ControllerRegistry {
    controllers: HashMap<String, SharedController>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn usb(&mut self, port: &str) -> Result<SharedController, InstrumentError> {
        self.get_or_connect(port, || PrologixBuilder::new().usb(port).build())
    }

    pub fn ethernet(&mut self, ip: &str) -> Result<SharedController, InstrumentError> {
        self.get_or_connect(ip, || PrologixBuilder::new().ethernet(ip).build())
    }

    /// Register an already-built controller under `key`.
    pub fn insert(&mut self, key: &str, controller: SharedController) {
        self.controllers.insert(key.to_string(), controller);
    }

    fn get_or_connect<F>(
        &mut self,
        key: &str,
        connect: F,
    ) -> Result<SharedController, InstrumentError>
    where
        F: FnOnce() -> Result<SharedController, InstrumentError>,
    {
        if let Some(existing) = self.controllers.get(key) {
            return Ok(existing.clone());
        }
        let controller = connect()?;
        self.controllers.insert(key.to_string(), controller.clone());
        Ok(controller)
    }
}

/// An instrument at one GPIB address behind a Prologix controller.
pub struct GpibInstrument<L: ControllerLink = Box<dyn ControllerLink>> {
    controller: SharedController<L>,
    addr: u8,
    auto: bool,
    delay: Duration,
}

impl<L: ControllerLink> Clone for GpibInstrument<L> {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
            addr: self.addr,
            auto: self.auto,
            delay: self.delay,
        }
    }
}

impl<L: ControllerLink> GpibInstrument<L> {
    /// Instrument at `addr`, read-after-write on, 0.1 s pause after writes.
    pub fn new(controller: SharedController<L>, addr: u8) -> Self {
        Self {
            controller,
            addr,
            auto: true,
            delay: DEFAULT_LAG,
        }
    }

    /// Read-after-write. Turn this off for instruments that keep answering
    /// the last query for as long as they are asked to talk.
    pub fn with_auto(mut self, auto: bool) -> Self {
        self.auto = auto;
        self
    }

    /// Pause after each write.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn addr(&self) -> u8 {
        self.addr
    }

    pub fn controller(&self) -> &SharedController<L> {
        &self.controller
    }

    fn take_priority(&self, controller: &mut Prologix<L>) -> Result<(), InstrumentError> {
        if controller.cached_auto() != self.auto {
            controller.set_auto(self.auto)?;
        }
        if controller.cached_addr() != self.addr {
            controller.set_addr(self.addr)?;
        }
        Ok(())
    }

    fn write_locked(
        &self,
        controller: &mut Prologix<L>,
        command: &str,
    ) -> Result<(), InstrumentError> {
        self.take_priority(controller)?;
        debug!("GPIB {} write: {command}", self.addr);
        controller.write(command, self.delay)
    }

    fn read_locked(&self, controller: &mut Prologix<L>) -> Result<String, InstrumentError> {
        self.take_priority(controller)?;
        if !self.auto {
            controller.write("++read eoi", self.delay)?;
        }
        let reply = controller.read_all()?;
        debug!("GPIB {} read: {reply}", self.addr);
        Ok(reply)
    }
}

impl<L: ControllerLink> Bus for GpibInstrument<L> {
    fn write(&mut self, command: &str) -> Result<(), InstrumentError> {
        let mut controller = self.controller.lock();
        self.write_locked(&mut controller, command)
    }

    fn read(&mut self) -> Result<String, InstrumentError> {
        let mut controller = self.controller.lock();
        self.read_locked(&mut controller)
    }

    fn ask(&mut self, query: &str) -> Result<String, InstrumentError> {
        let mut controller = self.controller.lock();
        self.write_locked(&mut controller, query)?;
        self.read_locked(&mut controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockPort;

    /// USB controller currently at address 9 with read-after-write on.
    fn usb_controller(port: &MockPort) -> SharedController<UsbLink<MockPort>> {
        port.reply(""); // ++savecfg 0
        port.reply("9\r\n"); // ++addr
        port.reply("1\r\n"); // ++auto
        Prologix::start_usb(UsbLink::new(port.clone()), Duration::ZERO)
            .unwrap()
            .into_shared()
    }

    #[test]
    fn usb_startup_disables_savecfg_and_caches_state() {
        let port = MockPort::new();
        port.preload("stale");
        let plx = usb_controller(&port);

        assert_eq!(plx.lock().cached_addr(), 9);
        assert!(plx.lock().cached_auto());
        assert_eq!(
            port.written_strings(),
            vec!["++savecfg 0\r", "++addr\r", "++auto\r"]
        );
    }

    #[test]
    fn instrument_readdresses_controller_only_when_needed() {
        let port = MockPort::new();
        let plx = usb_controller(&port);
        let mut lockin = GpibInstrument::new(plx.clone(), 12).with_delay(Duration::ZERO);

        port.reply(""); // ++addr 12
        port.reply("5110\r\n");
        port.reply("42\r\n");
        assert_eq!(lockin.ask("ID").unwrap(), "5110");
        assert_eq!(lockin.ask("X").unwrap(), "42");

        let sent = port.written_strings();
        assert_eq!(&sent[3..], &["++addr 12\r", "ID\r", "X\r"]);
        assert_eq!(plx.lock().cached_addr(), 12);
    }

    #[test]
    fn instrument_without_auto_requests_read() {
        let port = MockPort::new();
        let plx = usb_controller(&port);
        let mut laser = GpibInstrument::new(plx.clone(), 1)
            .with_auto(false)
            .with_delay(Duration::ZERO);

        port.reply(""); // ++auto 0
        port.reply(""); // ++addr 1
        port.reply(""); // outp?
        port.reply("1\r\n"); // ++read eoi
        assert_eq!(laser.ask("outp?").unwrap(), "1");
        assert_eq!(
            &port.written_strings()[3..],
            &["++auto 0\r", "++addr 1\r", "outp?\r", "++read eoi\r"]
        );
        assert!(!plx.lock().cached_auto());
    }

    #[test]
    fn savecfg_rejected_by_old_firmware() {
        let port = MockPort::new();
        let plx = usb_controller(&port);
        port.reply("Unrecognized command\r\n");
        assert!(matches!(
            plx.lock().savecfg(),
            Err(InstrumentError::UnexpectedReply { .. })
        ));
    }

    #[test]
    fn version_and_savecfg_queries() {
        let port = MockPort::new();
        let plx = usb_controller(&port);
        port.reply("Prologix GPIB-USB Controller version 6.101\r\n");
        port.reply("0\r\n");
        let mut plx = plx.lock();
        assert!(plx.version().unwrap().starts_with("Prologix"));
        assert!(!plx.savecfg().unwrap());
    }

    #[test]
    fn ethernet_link_selects_controller_mode_and_uses_lf() {
        let port = MockPort::new();
        port.reply(""); // ++mode 1
        port.reply("5\n"); // ++addr
        port.reply("0\n"); // ++auto
        let link = EthernetLink::new(port.clone()).unwrap();
        let plx = Prologix::with_link(link, Duration::ZERO).unwrap();

        assert_eq!(plx.cached_addr(), 5);
        assert!(!plx.cached_auto());
        assert_eq!(port.written_strings(), vec!["++mode 1\n", "++addr\n", "++auto\n"]);
    }

    #[test]
    fn registry_reuses_controllers() {
        let port = MockPort::new();
        port.reply("");
        port.reply("9\r\n");
        port.reply("1\r\n");
        let link: Box<dyn ControllerLink> = Box::new(UsbLink::new(port.clone()));
        let plx = Prologix::start_usb(link, Duration::ZERO).unwrap().into_shared();

        let mut registry = ControllerRegistry::new();
        registry.insert("/dev/ttyUSBgpib", plx.clone());
        let again = registry.usb("/dev/ttyUSBgpib").unwrap();
        assert!(Arc::ptr_eq(&plx, &again));
    }

    #[test]
    fn builder_requires_transport() {
        assert!(matches!(
            PrologixBuilder::new().build(),
            Err(InstrumentError::Config(_))
        ));
    }
}
