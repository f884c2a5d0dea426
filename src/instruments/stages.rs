//! Newport motion controllers (ESP300, MM3000) and the delay stages built
//! on them.
//!
//! One controller drives several axes. Give each axis its own stage value
//! over a shared bus:
//!
//! ```no_run
//! use optolab::bus::shared;
//! use optolab::instruments::stages::{Esp300Stage, NewportStage};
//! use optolab::prologix::{GpibInstrument, PrologixBuilder};
//!
//! let plx = PrologixBuilder::new().usb("/dev/ttyUSBgpib").build()?;
//! let esp = shared(GpibInstrument::new(plx, 9));
//! let mut x = Esp300Stage::new(1, esp.clone());
//! let mut y = Esp300Stage::new(2, esp);
//! x.move_by(0.5)?;
//! println!("{} {}", x.position()?, y.position()?);
//! # Ok::<(), optolab::InstrumentError>(())
//! ```

use log::{debug, info};
use serialport::SerialPort;
use std::fmt;
use std::time::Duration;

use crate::bus::{Bus, SerialBus, SerialSettings};
use crate::error::InstrumentError;
use crate::utils::{num, parse_f64, parse_flag, parse_i64, poll_until};

/// Usual GPIB address of the ESP300.
pub const ESP300_ADDR: u8 = 9;
/// Usual GPIB address of the MM3000.
pub const MM3000_ADDR: u8 = 8;

/// Interval between busy checks while waiting for a move.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Longest a single move may take.
pub const DEFAULT_MOTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Operations shared by Newport controllers.
///
/// Implementors describe how their controller spells a handful of commands;
/// moves, limits and homing are built on top of that.
pub trait NewportStage {
    /// Move-to-hardware-limit command, without direction.
    const MOVE_TO_LIMIT: &'static str;
    /// Absolute position query.
    const GET_ABS_POS: &'static str;

    fn axis(&self) -> u8;

    fn bus(&mut self) -> &mut dyn Bus;

    /// Absolute move command for `position`.
    fn format_abs(&self, position: f64) -> String;

    /// Relative move command for `delta`.
    fn format_rel(&self, delta: f64) -> String;

    fn is_busy(&mut self) -> Result<bool, InstrumentError>;

    fn is_on(&mut self) -> Result<bool, InstrumentError>;

    fn set_on(&mut self, on: bool) -> Result<(), InstrumentError>;

    /// Make the current position the origin.
    fn define_home(&mut self) -> Result<(), InstrumentError>;

    fn poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }

    fn motion_timeout(&self) -> Duration {
        DEFAULT_MOTION_TIMEOUT
    }

    /// Prefix a command with the axis number.
    fn cmd(&self, command: &str) -> String {
        format!("{}{}", self.axis(), command)
    }

    fn send(&mut self, command: &str) -> Result<(), InstrumentError> {
        let command = self.cmd(command);
        self.bus().write(&command)
    }

    fn query(&mut self, command: &str) -> Result<String, InstrumentError> {
        let command = self.cmd(command);
        self.bus().ask(&command)
    }

    /// Block until the motors stop, checking every `lag`.
    fn wait(&mut self, lag: Duration) -> Result<(), InstrumentError> {
        let timeout = self.motion_timeout();
        poll_until(|| self.is_busy().map(|busy| !busy), timeout, lag)
            .map_err(|e| e.into_instrument_error("stage to stop"))
    }

    /// Relative move, waiting for it to finish.
    fn move_by(&mut self, delta: f64) -> Result<(), InstrumentError> {
        let command = self.format_rel(delta);
        self.send(&command)?;
        self.wait(self.poll_interval())
    }

    /// Drive to the negative hardware limit when `direction < 0`, the
    /// positive one otherwise.
    ///
    /// The ESP300 can give up looking for a limit that is far away, so get
    /// reasonably close first.
    fn move_to_limit(&mut self, direction: i32) -> Result<(), InstrumentError> {
        let sign = if direction < 0 { '-' } else { '+' };
        let command = format!("{}{sign}", Self::MOVE_TO_LIMIT);
        self.send(&command)?;
        self.wait(self.poll_interval())
    }

    /// Absolute position in stage units.
    fn position(&mut self) -> Result<f64, InstrumentError> {
        let reply = self.query(Self::GET_ABS_POS)?;
        let trimmed = reply.trim_end();
        num(trimmed.strip_suffix("COUNTS").unwrap_or(trimmed))
    }

    /// Absolute move, waiting for it to finish.
    fn set_position(&mut self, position: f64) -> Result<(), InstrumentError> {
        let command = self.format_abs(position);
        self.send(&command)?;
        self.wait(self.poll_interval())
    }

    /// Put the origin `one_mm` (in stage units) away from the negative
    /// hardware limit.
    fn find_zero(&mut self, one_mm: f64) -> Result<(), InstrumentError> {
        info!("Axis {}: finding zero", self.axis());
        self.set_on(true)?;
        self.move_to_limit(-1)?;
        self.move_by(one_mm)?;
        self.define_home()
    }
}

/// Unit label an ESP300 axis reports positions in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageUnit {
    Counts = 0,
    Steps = 1,
    Millimeter = 2,
    Micrometer = 3,
}

impl StageUnit {
    pub fn from_code(code: i64) -> Result<Self, InstrumentError> {
        match code {
            0 => Ok(StageUnit::Counts),
            1 => Ok(StageUnit::Steps),
            2 => Ok(StageUnit::Millimeter),
            3 => Ok(StageUnit::Micrometer),
            _ => Err(InstrumentError::parse("unit label", code.to_string())),
        }
    }
}

impl fmt::Display for StageUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StageUnit::Counts => "counts",
            StageUnit::Steps => "steps",
            StageUnit::Millimeter => "mm",
            StageUnit::Micrometer => "um",
        };
        write!(f, "{label}")
    }
}

/// Calibration for a specific actuator on an ESP300 axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageProfile {
    pub name: &'static str,
    /// One millimetre in stage units.
    pub one_mm: f64,
    pub unit: StageUnit,
    /// Distance per motor step.
    pub step_size: f64,
    /// Distance per encoder pulse.
    pub encoder_resolution: f64,
    pub max_velocity: f64,
    pub velocity: f64,
}

/// Newport UTM100PP.1: 2 mm pitch, 10:1 gearing, 2000 encoder ticks per
/// motor turn.
pub const SHORTY: StageProfile = StageProfile {
    name: "UTM100PP.1",
    one_mm: 1.0,
    unit: StageUnit::Millimeter,
    step_size: 0.2,
    encoder_resolution: 0.0001,
    max_velocity: 2.0,
    velocity: 1.5,
};

/// Thorlabs Z612B actuator: 0.5 mm pitch, 256:1 gearing, 48 encoder ticks
/// per motor turn.
pub const THORLABS_Z612B: StageProfile = StageProfile {
    name: "Z612B",
    one_mm: 1000.0,
    unit: StageUnit::Micrometer,
    step_size: 500.0 / 256.0,
    encoder_resolution: 500.0 / 256.0 / 48.0,
    max_velocity: 425.0,
    velocity: 200.0,
};

/// One axis of a Newport ESP300.
pub struct Esp300Stage<B: Bus> {
    axis: u8,
    bus: B,
    poll_interval: Duration,
    motion_timeout: Duration,
}

impl Esp300Stage<SerialBus<Box<dyn SerialPort>>> {
    /// RS-232 settings the ESP300 expects.
    pub fn serial_settings(port: &str) -> SerialSettings {
        SerialSettings::new(port, 19200)
            .timeout(Duration::from_secs(10))
            .rtscts(true)
            .term_chars("\r\n")
    }

    /// Open an axis on a controller attached to a serial port.
    pub fn open(axis: u8, port: &str) -> Result<Self, InstrumentError> {
        Ok(Self::new(axis, Self::serial_settings(port).open()?))
    }
}

impl<B: Bus> Esp300Stage<B> {
    pub fn new(axis: u8, bus: B) -> Self {
        Self {
            axis,
            bus,
            poll_interval: DEFAULT_POLL_INTERVAL,
            motion_timeout: DEFAULT_MOTION_TIMEOUT,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_motion_timeout(mut self, timeout: Duration) -> Self {
        self.motion_timeout = timeout;
        self
    }

    /// Define the current position to be `location`.
    pub fn define_home_at(&mut self, location: f64) -> Result<(), InstrumentError> {
        self.send(&format!("DH{location:.6}"))
    }

    fn ask_f64(&mut self, command: &str, what: &str) -> Result<f64, InstrumentError> {
        let reply = self.query(command)?;
        parse_f64(&reply, what)
    }

    /// Distance per encoder pulse.
    pub fn encoder_resolution(&mut self) -> Result<f64, InstrumentError> {
        self.ask_f64("SU?", "encoder resolution")
    }

    pub fn set_encoder_resolution(&mut self, value: f64) -> Result<(), InstrumentError> {
        self.send(&format!("SU{value:.6}"))
    }

    /// Distance per motor step.
    pub fn step_size(&mut self) -> Result<f64, InstrumentError> {
        self.ask_f64("FR?", "step size")
    }

    pub fn set_step_size(&mut self, value: f64) -> Result<(), InstrumentError> {
        self.send(&format!("FR{value:.6}"))
    }

    pub fn max_velocity(&mut self) -> Result<f64, InstrumentError> {
        self.ask_f64("VU?", "max velocity")
    }

    pub fn set_max_velocity(&mut self, value: f64) -> Result<(), InstrumentError> {
        self.send(&format!("VU{value:.6}"))
    }

    pub fn velocity(&mut self) -> Result<f64, InstrumentError> {
        self.ask_f64("VA?", "velocity")
    }

    pub fn set_velocity(&mut self, value: f64) -> Result<(), InstrumentError> {
        self.send(&format!("VA{value:.6}"))
    }

    pub fn unit(&mut self) -> Result<StageUnit, InstrumentError> {
        let reply = self.query("SN?")?;
        StageUnit::from_code(parse_i64(&reply, "unit label")?)
    }

    pub fn set_unit(&mut self, unit: StageUnit) -> Result<(), InstrumentError> {
        self.send(&format!("SN{}", unit as u8))
    }

    /// Program the axis calibration for a known actuator.
    pub fn initialize(&mut self, profile: &StageProfile) -> Result<(), InstrumentError> {
        info!("Axis {}: configuring for {}", self.axis, profile.name);
        self.set_unit(profile.unit)?;
        self.set_step_size(profile.step_size)?;
        self.set_encoder_resolution(profile.encoder_resolution)?;
        self.set_max_velocity(profile.max_velocity)?;
        self.set_velocity(profile.velocity)
    }
}

impl<B: Bus> NewportStage for Esp300Stage<B> {
    const MOVE_TO_LIMIT: &'static str = "MT";
    const GET_ABS_POS: &'static str = "PA?";

    fn axis(&self) -> u8 {
        self.axis
    }

    fn bus(&mut self) -> &mut dyn Bus {
        &mut self.bus
    }

    fn format_abs(&self, position: f64) -> String {
        format!("PA{position:.6}")
    }

    fn format_rel(&self, delta: f64) -> String {
        format!("PR{delta:.6}")
    }

    /// `MD?` answers 0 while a move is in progress.
    fn is_busy(&mut self) -> Result<bool, InstrumentError> {
        let reply = self.query("MD?")?;
        Ok(!parse_flag(&reply, "motion done")?)
    }

    fn is_on(&mut self) -> Result<bool, InstrumentError> {
        let reply = self.query("MO?")?;
        parse_flag(&reply, "motor state")
    }

    fn set_on(&mut self, on: bool) -> Result<(), InstrumentError> {
        self.send(if on { "MO" } else { "MF" })
    }

    fn define_home(&mut self) -> Result<(), InstrumentError> {
        self.send("DH0")
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn motion_timeout(&self) -> Duration {
        self.motion_timeout
    }
}

/// The MM3000 motor status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorStatus(pub u8);

impl MotorStatus {
    fn bit(&self, n: u8) -> bool {
        (self.0 >> n) & 1 == 1
    }

    pub fn moving(&self) -> bool {
        self.bit(0)
    }

    pub fn motor_off(&self) -> bool {
        self.bit(1)
    }

    pub fn positive_direction(&self) -> bool {
        self.bit(2)
    }

    pub fn positive_limit(&self) -> bool {
        self.bit(3)
    }

    pub fn negative_limit(&self) -> bool {
        self.bit(4)
    }

    pub fn positive_side_of_home(&self) -> bool {
        self.bit(5)
    }
}

/// One axis of a Newport MM3000 (firmware 2.2). Positions are integers.
pub struct Mm3000Stage<B: Bus> {
    axis: u8,
    bus: B,
    poll_interval: Duration,
    motion_timeout: Duration,
}

impl<B: Bus> Mm3000Stage<B> {
    pub fn new(axis: u8, bus: B) -> Self {
        Self {
            axis,
            bus,
            poll_interval: DEFAULT_POLL_INTERVAL,
            motion_timeout: DEFAULT_MOTION_TIMEOUT,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_motion_timeout(mut self, timeout: Duration) -> Self {
        self.motion_timeout = timeout;
        self
    }

    pub fn motor_status(&mut self) -> Result<MotorStatus, InstrumentError> {
        let reply = self.query("MS")?;
        let byte = reply.bytes().next().ok_or_else(|| {
            InstrumentError::NoResponse(format!("axis {} motor status", self.axis))
        })?;
        debug!("Axis {} status {byte:08b}", self.axis);
        Ok(MotorStatus(byte))
    }
}

impl<B: Bus> NewportStage for Mm3000Stage<B> {
    const MOVE_TO_LIMIT: &'static str = "ML";
    const GET_ABS_POS: &'static str = "TP";

    fn axis(&self) -> u8 {
        self.axis
    }

    fn bus(&mut self) -> &mut dyn Bus {
        &mut self.bus
    }

    fn format_abs(&self, position: f64) -> String {
        format!("PA{}", position.round() as i64)
    }

    fn format_rel(&self, delta: f64) -> String {
        format!("PR{}", delta.round() as i64)
    }

    fn is_busy(&mut self) -> Result<bool, InstrumentError> {
        Ok(self.motor_status()?.moving())
    }

    fn is_on(&mut self) -> Result<bool, InstrumentError> {
        Ok(!self.motor_status()?.motor_off())
    }

    fn set_on(&mut self, on: bool) -> Result<(), InstrumentError> {
        self.send(if on { "MO" } else { "MF" })
    }

    fn define_home(&mut self) -> Result<(), InstrumentError> {
        self.send("DH")
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn motion_timeout(&self) -> Duration {
        self.motion_timeout
    }
}

/// A stage used to delay light pulses, addressed in picoseconds.
///
/// The delay is zero with the stage at its far end. Run
/// [`DelayStage::find_zero`] before moving by delay, otherwise the stage
/// may run out of travel.
pub struct DelayStage<S: NewportStage> {
    stage: S,
    /// Length of the stage in stage units.
    stage_length: f64,
    /// Speed of light in stage units per picosecond.
    c: f64,
    one_mm: f64,
}

impl<S: NewportStage> DelayStage<S> {
    pub fn new(stage: S, stage_length: f64, c: f64, one_mm: f64) -> Self {
        Self {
            stage,
            stage_length,
            c,
            one_mm,
        }
    }

    /// Round-trip delay in ps.
    pub fn delay(&mut self) -> Result<f64, InstrumentError> {
        let position = self.stage.position()?;
        Ok(2.0 * (self.stage_length - position) / self.c)
    }

    pub fn set_delay(&mut self, ps: f64) -> Result<(), InstrumentError> {
        let position = self.stage_length - self.c * ps * 0.5;
        debug!("Delay {ps} ps -> position {position}");
        self.stage.set_position(position)
    }

    pub fn find_zero(&mut self) -> Result<(), InstrumentError> {
        self.stage.find_zero(self.one_mm)
    }

    pub fn stage(&mut self) -> &mut S {
        &mut self.stage
    }

    pub fn into_inner(self) -> S {
        self.stage
    }
}

/// The 600 mm delay line on the ESP300, in mm.
pub fn long_stage<B: Bus>(stage: Esp300Stage<B>) -> DelayStage<Esp300Stage<B>> {
    DelayStage::new(stage, 600.0, 0.3, 1.0)
}

/// The 100 mm delay line on the MM3000, in tenths of a micron.
pub fn short_stage<B: Bus>(stage: Mm3000Stage<B>) -> DelayStage<Mm3000Stage<B>> {
    let mm = 1e4;
    DelayStage::new(stage, 100.0 * mm, 0.3 * mm, mm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockPort;
    use crate::bus::{shared, SerialBus};

    fn bus(port: &MockPort) -> SerialBus<MockPort> {
        SerialBus::new(port.clone(), "\r\n").with_lag(Duration::ZERO)
    }

    fn esp(port: &MockPort, axis: u8) -> Esp300Stage<SerialBus<MockPort>> {
        Esp300Stage::new(axis, bus(port)).with_poll_interval(Duration::from_millis(1))
    }

    fn mm3000(port: &MockPort) -> Mm3000Stage<SerialBus<MockPort>> {
        Mm3000Stage::new(1, bus(port)).with_poll_interval(Duration::from_millis(1))
    }

    #[test]
    fn esp300_relative_move_waits_for_motion_done() {
        let port = MockPort::new();
        port.reply("");
        port.reply("0\r\n");
        port.reply("1\r\n");
        let mut stage = esp(&port, 2);
        stage.move_by(-0.25).unwrap();
        assert_eq!(
            port.written_strings(),
            vec!["2PR-0.250000\r\n", "2MD?\r\n", "2MD?\r\n"]
        );
    }

    #[test]
    fn position_reply_may_carry_units() {
        let port = MockPort::new();
        port.reply("12.5\r\n");
        port.reply("-400 COUNTS\r\n");
        let mut stage = esp(&port, 1);
        assert_eq!(stage.position().unwrap(), 12.5);
        assert_eq!(stage.position().unwrap(), -400.0);
    }

    #[test]
    fn find_zero_sequence() {
        let port = MockPort::new();
        port.reply("");
        port.reply("");
        port.reply("1\r\n");
        port.reply("");
        port.reply("1\r\n");
        port.reply("");
        let mut stage = esp(&port, 1);
        stage.find_zero(1.0).unwrap();
        assert_eq!(
            port.written_strings(),
            vec!["1MO\r\n", "1MT-\r\n", "1MD?\r\n", "1PR1.000000\r\n", "1MD?\r\n", "1DH0\r\n"]
        );
    }

    #[test]
    fn axes_share_one_controller() {
        let port = MockPort::new();
        port.reply("1.5\r\n");
        port.reply("2.5\r\n");
        let esp = shared(bus(&port));
        let mut x = Esp300Stage::new(1, esp.clone());
        let mut y = Esp300Stage::new(2, esp);
        assert_eq!(x.position().unwrap(), 1.5);
        assert_eq!(y.position().unwrap(), 2.5);
        assert_eq!(port.written_strings(), vec!["1PA?\r\n", "2PA?\r\n"]);
    }

    #[test]
    fn esp300_calibration_and_units() {
        let port = MockPort::new();
        port.reply("3\r\n");
        port.reply("0.2\r\n");
        let mut stage = esp(&port, 1);
        assert_eq!(stage.unit().unwrap(), StageUnit::Micrometer);
        assert_eq!(stage.step_size().unwrap(), 0.2);

        stage.initialize(&SHORTY).unwrap();
        let sent = port.written_strings();
        assert_eq!(
            &sent[2..],
            &[
                "1SN2\r\n",
                "1FR0.200000\r\n",
                "1SU0.000100\r\n",
                "1VU2.000000\r\n",
                "1VA1.500000\r\n"
            ]
        );
        assert_eq!(StageUnit::Millimeter.to_string(), "mm");
    }

    #[test]
    fn z612b_calibration() {
        let port = MockPort::new();
        let mut stage = esp(&port, 3);
        stage.initialize(&THORLABS_Z612B).unwrap();
        let sent = port.written_strings();
        assert_eq!(sent[0], "3SN3\r\n");
        assert_eq!(sent[1], "3FR1.953125\r\n");
        assert_eq!(sent[2], "3SU0.040690\r\n");
    }

    #[test]
    fn motor_status_bits() {
        let status = MotorStatus(0b0100_0101);
        assert!(status.moving());
        assert!(!status.motor_off());
        assert!(status.positive_direction());
        assert!(!status.positive_limit());
        assert!(!status.negative_limit());
        assert!(!status.positive_side_of_home());
    }

    #[test]
    fn mm3000_uses_integer_positions() {
        let port = MockPort::new();
        port.reply("");
        port.reply("A\r\n");
        port.reply("@\r\n");
        let mut stage = mm3000(&port);
        stage.set_position(1234.6).unwrap();
        assert_eq!(
            port.written_strings(),
            vec!["1PA1235\r\n", "1MS\r\n", "1MS\r\n"]
        );
    }

    #[test]
    fn mm3000_motor_off_bit() {
        let port = MockPort::new();
        port.reply("B\r\n");
        let mut stage = mm3000(&port);
        assert!(!stage.is_on().unwrap());
    }

    #[test]
    fn long_stage_delay_in_picoseconds() {
        let port = MockPort::new();
        port.reply("300.0\r\n");
        let mut stage = long_stage(esp(&port, 1));
        assert_eq!(stage.delay().unwrap(), 2000.0);

        port.reply("");
        port.reply("1\r\n");
        stage.set_delay(1000.0).unwrap();
        assert_eq!(port.written_strings()[1], "1PA450.000000\r\n");
    }

    #[test]
    fn short_stage_delay_in_picoseconds() {
        let port = MockPort::new();
        port.reply("");
        port.reply("@\r\n");
        let mut stage = short_stage(mm3000(&port));
        stage.set_delay(2.0).unwrap();
        assert_eq!(port.written_strings()[0], "1PA997000\r\n");
    }

    #[test]
    fn stuck_stage_times_out() {
        let port = MockPort::new();
        for _ in 0..100 {
            port.reply("0\r\n");
        }
        let mut stage = esp(&port, 1).with_motion_timeout(Duration::from_millis(20));
        assert!(matches!(
            stage.wait(Duration::from_millis(1)),
            Err(InstrumentError::Timeout(_))
        ));
    }
}
