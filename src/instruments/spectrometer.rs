//! Jobin-Yvon SPEX 750M and TRIAX 320 monochromators over RS-232.
//!
//! Both share the same motor controller: it has to be walked through an
//! autobaud / flash handshake after power-up, acknowledges every command
//! with an `o` byte, and reports motor activity through the `E` query.
//!
//! ```no_run
//! use optolab::instruments::spectrometer::{Monochromator, Spex750m};
//!
//! let mut spex = Spex750m::open("/dev/ttyUSB0")?;
//! spex.calibrate(800.0)?;
//! spex.set_wavelength(750.0)?;
//! for _ in 0..200 {
//!     spex.rel_move(0.5)?;
//!     println!("{}", spex.wavelength()?);
//! }
//! # Ok::<(), optolab::InstrumentError>(())
//! ```

use log::{debug, info, warn};
use serialport::SerialPort;
use std::fmt;
use std::time::Duration;

use crate::bus::{Bus, Port, SerialBus, SerialSettings};
use crate::error::InstrumentError;
use crate::utils::{parse_f64, parse_i64, poll_until};

pub const BAUD_RATE: u32 = 19200;
pub const SPEX750M_PORT: &str = "/dev/ttyUSB0";
pub const TRIAX320_PORT: &str = "/dev/ttyUSB1";
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
pub const MOTION_TIMEOUT: Duration = Duration::from_secs(180);
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Grating motor steps per nanometre on the 750M.
pub const SPEX750M_STEPS_PER_NM: f64 = 4000.0;
/// Highest wavelength the 750M will be asked to move to.
pub const SPEX750M_MAX_NM: f64 = 1500.0;

pub const ENTRANCE_SLIT: u8 = 0;
pub const EXIT_SLIT: u8 = 2;

const AUTOBAUD: &[u8] = b" ";
const HI_IQ: &[u8] = &[0xF7];
const REBOOT: &[u8] = &[0xDE];
const FLASH: &[u8] = b"O2000\0";

/// What the controller answers to the autobaud character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStatus {
    /// `*`: just autobauded, needs flashing.
    Autobauded,
    /// `B`: boot acknowledged.
    BootAcknowledged,
    /// `F`: flashed and ready for commands.
    Flashed,
}

impl BootStatus {
    fn from_reply(reply: &str) -> Option<Self> {
        match reply.chars().next()? {
            '*' => Some(BootStatus::Autobauded),
            'B' => Some(BootStatus::BootAcknowledged),
            'F' => Some(BootStatus::Flashed),
            _ => None,
        }
    }
}

/// Common operations of a scanning monochromator.
pub trait Monochromator {
    /// Current wavelength in nm.
    fn wavelength(&mut self) -> Result<f64, InstrumentError>;

    /// Move to a wavelength in nm and wait for the motors to stop.
    fn set_wavelength(&mut self, nm: f64) -> Result<(), InstrumentError>;

    /// Tell the controller it is currently at `nm`, without moving.
    fn calibrate(&mut self, nm: f64) -> Result<(), InstrumentError>;

    fn is_busy(&mut self) -> Result<bool, InstrumentError>;
}

/// The motor controller inside Jobin-Yvon spectrometers.
pub struct MotorController<P: Port> {
    bus: SerialBus<P>,
    model: &'static str,
    reply_timeout: Duration,
    motion_timeout: Duration,
    poll_interval: Duration,
}

impl<P: Port> MotorController<P> {
    /// Wrap a bus without touching the hardware yet. Commands are sent
    /// verbatim, so the bus must not add termination characters.
    pub fn new(bus: SerialBus<P>, model: &'static str) -> Self {
        Self {
            bus,
            model,
            reply_timeout: REPLY_TIMEOUT,
            motion_timeout: MOTION_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// How long to wait for an acknowledgment byte.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// How long a single move may take.
    pub fn with_motion_timeout(mut self, timeout: Duration) -> Self {
        self.motion_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Initialize the hardware, rebooting the controller once if that fails.
    pub fn connect(mut self) -> Result<Self, InstrumentError> {
        if let Err(e) = self.init_hardware() {
            warn!("{}: {e}, rebooting once...", self.model);
            self.reboot()?;
            self.init_hardware()?;
        }
        info!("{} initialized", self.model);
        Ok(self)
    }

    fn ask_bytes(&mut self, data: &[u8]) -> Result<String, InstrumentError> {
        self.bus.write_bytes(data)?;
        std::thread::sleep(self.bus.lag());
        self.bus.read()
    }

    /// Send the autobaud character and report the boot status.
    pub fn boot_status(&mut self) -> Result<BootStatus, InstrumentError> {
        self.bus.purge()?;
        let reply = self.ask_bytes(AUTOBAUD)?;
        if reply.is_empty() {
            return Err(InstrumentError::NoResponse(format!(
                "{} did not give a boot status",
                self.model
            )));
        }
        BootStatus::from_reply(&reply).ok_or_else(|| {
            InstrumentError::unexpected(
                "autobaud",
                format!("unknown {} boot status: {reply}", self.model),
            )
        })
    }

    /// Reboot a controller that stopped responding.
    pub fn reboot(&mut self) -> Result<String, InstrumentError> {
        self.ask_bytes(REBOOT)
    }

    /// Send HI IQ; the controller must answer `=` before it may be flashed.
    pub fn hi_iq(&mut self) -> Result<(), InstrumentError> {
        self.bus.purge()?;
        let reply = self.ask_bytes(HI_IQ)?;
        if reply.starts_with('=') {
            Ok(())
        } else {
            Err(InstrumentError::unexpected(
                "HI IQ",
                format!("{} HI IQ command failed: {reply:?}", self.model),
            ))
        }
    }

    pub fn flash(&mut self) -> Result<String, InstrumentError> {
        self.ask_bytes(FLASH)
    }

    /// Bring the controller from autobauded to flashed.
    pub fn init_hardware(&mut self) -> Result<(), InstrumentError> {
        let mut status = self.boot_status()?;
        if status == BootStatus::Autobauded {
            self.hi_iq()?;
            self.flash()?;
            status = self.boot_status()?;
        }
        match status {
            BootStatus::Flashed => Ok(()),
            other => Err(InstrumentError::unexpected(
                "autobaud",
                format!("{} hardware init failed, status {other:?}", self.model),
            )),
        }
    }

    /// Wait until `expected_bytes` are waiting, then check the first is `o`.
    pub fn wait_for_ok(&mut self, expected_bytes: usize) -> Result<(), InstrumentError> {
        let bus = &self.bus;
        poll_until(
            || Ok(bus.bytes_waiting()? >= expected_bytes),
            self.reply_timeout,
            self.poll_interval,
        )
        .map_err(|e| e.into_instrument_error(&format!("{} status byte", self.model)))?;

        let status = self.bus.read_exact_bytes(1)?;
        if status[0] == b'o' {
            Ok(())
        } else {
            Err(InstrumentError::unexpected(
                "status byte",
                format!(
                    "{} operation failed: {}",
                    self.model,
                    String::from_utf8_lossy(&status)
                ),
            ))
        }
    }

    /// Write a command and wait for its acknowledgment.
    pub fn command(&mut self, command: &str) -> Result<(), InstrumentError> {
        self.bus.purge()?;
        debug!("{} command {command:?}", self.model);
        self.bus.write(command)?;
        self.wait_for_ok(1)
    }

    /// Write a query, wait for the acknowledgment plus at least
    /// `expected_bytes - 1` bytes of data, and return the data.
    pub fn query(
        &mut self,
        command: &str,
        expected_bytes: usize,
    ) -> Result<String, InstrumentError> {
        self.bus.purge()?;
        self.bus.write(command)?;
        self.wait_for_ok(expected_bytes)?;
        let reply = self.bus.read()?;
        debug!("{} {command:?} -> {reply:?}", self.model);
        Ok(reply)
    }

    /// Whether the motors are moving.
    pub fn is_busy(&mut self) -> Result<bool, InstrumentError> {
        self.bus.write("E")?;
        self.wait_for_ok(1)?;
        let reply = self.bus.read()?;
        match reply.as_str() {
            "q" => Ok(true),
            "z" => Ok(false),
            _ => Err(InstrumentError::unexpected("E", reply)),
        }
    }

    /// Block until the motors come to rest.
    pub fn wait_until_idle(&mut self) -> Result<(), InstrumentError> {
        let timeout = self.motion_timeout;
        let interval = self.poll_interval;
        poll_until(|| self.is_busy().map(|busy| !busy), timeout, interval)
            .map_err(|e| e.into_instrument_error("motors to stop"))
    }

    pub fn model(&self) -> &'static str {
        self.model
    }
}

fn open_serial(port: &str) -> Result<SerialBus<Box<dyn SerialPort>>, InstrumentError> {
    SerialSettings::new(port, BAUD_RATE)
        .timeout(REPLY_TIMEOUT)
        .open()
}

/// SPEX 750M: positions are grating motor steps, 4000 per nm.
pub struct Spex750m<P: Port> {
    controller: MotorController<P>,
}

impl Spex750m<Box<dyn SerialPort>> {
    /// Open the port and initialize the controller.
    pub fn open(port: &str) -> Result<Self, InstrumentError> {
        Self::from_bus(open_serial(port)?)
    }
}

impl<P: Port> Spex750m<P> {
    pub fn from_bus(bus: SerialBus<P>) -> Result<Self, InstrumentError> {
        Self::from_controller(MotorController::new(bus, "Spex 750M"))
    }

    /// Initialize a pre-configured controller.
    pub fn from_controller(controller: MotorController<P>) -> Result<Self, InstrumentError> {
        Ok(Self {
            controller: controller.connect()?,
        })
    }

    pub fn controller(&mut self) -> &mut MotorController<P> {
        &mut self.controller
    }

    fn steps(nm: f64) -> i64 {
        (nm * SPEX750M_STEPS_PER_NM).round() as i64
    }

    /// Move the grating by `nm` and wait for the motors to rest.
    pub fn rel_move(&mut self, nm: f64) -> Result<(), InstrumentError> {
        self.controller
            .command(&format!("F0,{}\r", Self::steps(nm)))?;
        self.controller.wait_until_idle()
    }
}

impl<P: Port> Monochromator for Spex750m<P> {
    fn wavelength(&mut self) -> Result<f64, InstrumentError> {
        let reply = self.controller.query("HO\r", 1)?;
        Ok(parse_i64(&reply, "grating position")? as f64 / SPEX750M_STEPS_PER_NM)
    }

    fn set_wavelength(&mut self, nm: f64) -> Result<(), InstrumentError> {
        if !(0.0..=SPEX750M_MAX_NM).contains(&nm) {
            return Err(InstrumentError::OutOfRange(format!(
                "{nm} nm is outside 0..={SPEX750M_MAX_NM} nm"
            )));
        }
        let current = self.wavelength()?;
        self.rel_move(nm - current)
    }

    fn calibrate(&mut self, nm: f64) -> Result<(), InstrumentError> {
        self.controller.command(&format!("G0,{}\r", Self::steps(nm)))
    }

    fn is_busy(&mut self) -> Result<bool, InstrumentError> {
        self.controller.is_busy()
    }
}

impl<P: Port> fmt::Display for Spex750m<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Spex 750M")
    }
}

/// TRIAX 320: works in wavelength directly, and has motorized slits.
///
/// Unlike the 750M it zeroes its grating on power-up; [`Triax320::motor_init`]
/// repeats that on demand.
pub struct Triax320<P: Port> {
    controller: MotorController<P>,
}

impl Triax320<Box<dyn SerialPort>> {
    pub fn open(port: &str) -> Result<Self, InstrumentError> {
        Self::from_bus(open_serial(port)?)
    }
}

impl<P: Port> Triax320<P> {
    pub fn from_bus(bus: SerialBus<P>) -> Result<Self, InstrumentError> {
        Self::from_controller(MotorController::new(bus, "Triax 320"))
    }

    pub fn from_controller(controller: MotorController<P>) -> Result<Self, InstrumentError> {
        Ok(Self {
            controller: controller.connect()?,
        })
    }

    pub fn controller(&mut self) -> &mut MotorController<P> {
        &mut self.controller
    }

    /// Move a slit motor by `steps` and wait for it to stop.
    pub fn move_slit_relative(&mut self, slit: u8, steps: i64) -> Result<(), InstrumentError> {
        self.controller.command(&format!("k0,{slit},{steps}\r"))?;
        self.controller.wait_until_idle()
    }

    /// Absolute position of a slit motor.
    pub fn slit_position(&mut self, slit: u8) -> Result<f64, InstrumentError> {
        let reply = self.controller.query(&format!("j0,{slit}\r"), 1)?;
        parse_f64(&reply, "slit position")
    }

    /// Move a slit to an absolute position, going through zero first to
    /// take up backlash.
    pub fn set_slit_position(&mut self, slit: u8, position: i64) -> Result<(), InstrumentError> {
        let start = self.slit_position(slit)?.round() as i64;
        self.move_slit_relative(slit, -start)?;
        self.move_slit_relative(slit, position)
    }

    pub fn entrance_slit(&mut self) -> Result<f64, InstrumentError> {
        self.slit_position(ENTRANCE_SLIT)
    }

    pub fn set_entrance_slit(&mut self, position: i64) -> Result<(), InstrumentError> {
        self.set_slit_position(ENTRANCE_SLIT, position)
    }

    pub fn exit_slit(&mut self) -> Result<f64, InstrumentError> {
        self.slit_position(EXIT_SLIT)
    }

    pub fn set_exit_slit(&mut self, position: i64) -> Result<(), InstrumentError> {
        self.set_slit_position(EXIT_SLIT, position)
    }

    /// Entrance and exit slit positions.
    pub fn slits(&mut self) -> Result<(f64, f64), InstrumentError> {
        Ok((self.entrance_slit()?, self.exit_slit()?))
    }

    pub fn set_slits(&mut self, entrance: i64, exit: i64) -> Result<(), InstrumentError> {
        self.set_entrance_slit(entrance)?;
        self.set_exit_slit(exit)
    }

    pub fn set_both_slits(&mut self, position: i64) -> Result<(), InstrumentError> {
        self.set_slits(position, position)
    }

    /// Send all motors to their power-up positions. This zeroes the grating
    /// and closes both slits.
    pub fn motor_init(&mut self) -> Result<(), InstrumentError> {
        self.controller.command("A")
    }
}

impl<P: Port> Monochromator for Triax320<P> {
    fn wavelength(&mut self) -> Result<f64, InstrumentError> {
        let reply = self.controller.query("Z62,1\r", 8)?;
        parse_f64(&reply, "wavelength")
    }

    fn set_wavelength(&mut self, nm: f64) -> Result<(), InstrumentError> {
        self.controller.command(&format!("Z61,1,{nm}\r"))?;
        self.controller.wait_until_idle()
    }

    fn calibrate(&mut self, nm: f64) -> Result<(), InstrumentError> {
        self.controller.command(&format!("Z60,1,{nm}\r"))
    }

    fn is_busy(&mut self) -> Result<bool, InstrumentError> {
        self.controller.is_busy()
    }
}

impl<P: Port> fmt::Display for Triax320<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Triax 320")
    }
}

impl<M: Monochromator + ?Sized> Monochromator for Box<M> {
    fn wavelength(&mut self) -> Result<f64, InstrumentError> {
        (**self).wavelength()
    }

    fn set_wavelength(&mut self, nm: f64) -> Result<(), InstrumentError> {
        (**self).set_wavelength(nm)
    }

    fn calibrate(&mut self, nm: f64) -> Result<(), InstrumentError> {
        (**self).calibrate(nm)
    }

    fn is_busy(&mut self) -> Result<bool, InstrumentError> {
        (**self).is_busy()
    }
}
