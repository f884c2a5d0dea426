//! Lock-in amplifiers: Stanford Research SR830 and EG&G 5110.

use log::{debug, info};
use std::fmt;

use crate::bus::Bus;
use crate::error::InstrumentError;
use crate::utils::{parse_f64, parse_flag, parse_i64};

/// Usual GPIB address of the SR830.
pub const SRS830_ADDR: u8 = 8;
/// Usual GPIB address of the 5110.
pub const EGG5110_ADDR: u8 = 12;

const ADC_RANGE: std::ops::RangeInclusive<u8> = 1..=4;

/// The 5110's sensitivity settings, indexed by code.
pub const EGG5110_SENSITIVITIES: [(f64, &str); 22] = [
    (100.0, "nV"),
    (200.0, "nV"),
    (500.0, "nV"),
    (1.0, "uV"),
    (2.0, "uV"),
    (5.0, "uV"),
    (10.0, "uV"),
    (20.0, "uV"),
    (50.0, "uV"),
    (100.0, "uV"),
    (200.0, "uV"),
    (500.0, "uV"),
    (1.0, "mV"),
    (2.0, "mV"),
    (5.0, "mV"),
    (10.0, "mV"),
    (20.0, "mV"),
    (50.0, "mV"),
    (100.0, "mV"),
    (200.0, "mV"),
    (500.0, "mV"),
    (1.0, "V"),
];

/// The 5110's time constants, indexed by code.
pub const EGG5110_TIME_CONSTANTS: [(f64, &str); 13] = [
    (0.0, "MIN"),
    (1.0, "ms"),
    (3.0, "ms"),
    (10.0, "ms"),
    (30.0, "ms"),
    (100.0, "ms"),
    (300.0, "ms"),
    (1.0, "s"),
    (3.0, "s"),
    (10.0, "s"),
    (30.0, "s"),
    (100.0, "s"),
    (300.0, "s"),
];

/// The SR830's time constants (`OFLT`), indexed by code.
pub const SRS830_TIME_CONSTANTS: [(f64, &str); 20] = [
    (10.0, "us"),
    (30.0, "us"),
    (100.0, "us"),
    (300.0, "us"),
    (1.0, "ms"),
    (3.0, "ms"),
    (10.0, "ms"),
    (30.0, "ms"),
    (100.0, "ms"),
    (300.0, "ms"),
    (1.0, "s"),
    (3.0, "s"),
    (10.0, "s"),
    (30.0, "s"),
    (100.0, "s"),
    (300.0, "s"),
    (1.0, "ks"),
    (3.0, "ks"),
    (10.0, "ks"),
    (30.0, "ks"),
];

/// A value with the unit the instrument reports it in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantity {
    pub value: f64,
    pub unit: &'static str,
}

impl Quantity {
    pub fn new(value: f64, unit: &'static str) -> Self {
        Self { value, unit }
    }

    /// Convert a time to seconds. Fails for units that are not a time,
    /// including the 5110's `MIN` setting.
    pub fn seconds(&self) -> Result<f64, InstrumentError> {
        match self.unit {
            "us" => Ok(self.value / 1e6),
            "ms" => Ok(self.value / 1e3),
            "s" => Ok(self.value),
            "ks" => Ok(self.value * 1e3),
            other => Err(InstrumentError::parse("time unit", other)),
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

fn lookup(
    table: &[(f64, &'static str)],
    code: i64,
    what: &str,
) -> Result<Quantity, InstrumentError> {
    usize::try_from(code)
        .ok()
        .and_then(|i| table.get(i))
        .map(|&(value, unit)| Quantity::new(value, unit))
        .ok_or_else(|| InstrumentError::parse(what, code.to_string()))
}

fn check_code(table_len: usize, code: u8, what: &str) -> Result<(), InstrumentError> {
    if usize::from(code) < table_len {
        Ok(())
    } else {
        Err(InstrumentError::OutOfRange(format!(
            "{what} code {code} (valid 0..={})",
            table_len - 1
        )))
    }
}

fn check_adc(n: u8) -> Result<(), InstrumentError> {
    if ADC_RANGE.contains(&n) {
        Ok(())
    } else {
        Err(InstrumentError::OutOfRange(format!(
            "Indicate ADC in range (1, 2, 3, 4), got {n}"
        )))
    }
}

/// The standard lock-in outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measurement {
    X,
    Y,
    Magnitude,
}

/// What a wavelength scan needs from a lock-in.
pub trait LockIn {
    /// Signal magnitude, in whatever scale the instrument reports.
    fn magnitude(&mut self) -> Result<f64, InstrumentError>;

    /// Current time constant.
    fn time_constant(&mut self) -> Result<Quantity, InstrumentError>;
}

impl<L: LockIn + ?Sized> LockIn for Box<L> {
    fn magnitude(&mut self) -> Result<f64, InstrumentError> {
        (**self).magnitude()
    }

    fn time_constant(&mut self) -> Result<Quantity, InstrumentError> {
        (**self).time_constant()
    }
}

/// Stanford Research Systems SR830 DSP lock-in.
pub struct Srs830<B: Bus> {
    bus: B,
}

impl<B: Bus> Srs830<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    /// Read X, Y or R in volts.
    pub fn measure(&mut self, measurement: Measurement) -> Result<f64, InstrumentError> {
        let channel = match measurement {
            Measurement::X => 1,
            Measurement::Y => 2,
            Measurement::Magnitude => 3,
        };
        let reply = self.bus.ask(&format!("OUTP?{channel}"))?;
        parse_f64(&reply, "SR830 output")
    }

    pub fn x(&mut self) -> Result<f64, InstrumentError> {
        self.measure(Measurement::X)
    }

    pub fn y(&mut self) -> Result<f64, InstrumentError> {
        self.measure(Measurement::Y)
    }

    pub fn r(&mut self) -> Result<f64, InstrumentError> {
        self.measure(Measurement::Magnitude)
    }

    /// Read one of the rear-panel auxiliary inputs, in volts.
    pub fn adc(&mut self, n: u8) -> Result<f64, InstrumentError> {
        check_adc(n)?;
        let reply = self.bus.ask(&format!("OAUX?{n}"))?;
        parse_f64(&reply, "aux input")
    }

    pub fn time_constant(&mut self) -> Result<Quantity, InstrumentError> {
        let reply = self.bus.ask("OFLT?")?;
        lookup(
            &SRS830_TIME_CONSTANTS,
            parse_i64(&reply, "time constant code")?,
            "time constant code",
        )
    }

    pub fn set_time_constant(&mut self, code: u8) -> Result<(), InstrumentError> {
        check_code(SRS830_TIME_CONSTANTS.len(), code, "time constant")?;
        self.bus.write(&format!("OFLT {code}"))
    }

    pub fn bus(&mut self) -> &mut B {
        &mut self.bus
    }
}

impl<B: Bus> LockIn for Srs830<B> {
    fn magnitude(&mut self) -> Result<f64, InstrumentError> {
        self.r()
    }

    fn time_constant(&mut self) -> Result<Quantity, InstrumentError> {
        Srs830::time_constant(self)
    }
}

/// EG&G Princeton Applied Research model 5110 lock-in.
///
/// Readings come back as ten-thousandths of full scale; [`Egg5110::measure`]
/// returns that fraction and [`Egg5110::measure_scaled`] multiplies it by
/// the current sensitivity.
pub struct Egg5110<B: Bus> {
    bus: B,
}

impl<B: Bus> Egg5110<B> {
    /// Connect, checking that the instrument identifies as a 5110.
    pub fn new(mut bus: B) -> Result<Self, InstrumentError> {
        let id = bus.ask("ID")?;
        if id != "5110" {
            return Err(InstrumentError::unexpected(
                "ID",
                format!("5110 lockin not found, got {id:?}"),
            ));
        }
        info!("EG&G 5110 lock-in connected");
        Ok(Self { bus })
    }

    pub fn sensitivity(&mut self) -> Result<Quantity, InstrumentError> {
        let reply = self.bus.ask("SEN")?;
        lookup(
            &EGG5110_SENSITIVITIES,
            parse_i64(&reply, "sensitivity code")?,
            "sensitivity code",
        )
    }

    pub fn set_sensitivity(&mut self, code: u8) -> Result<(), InstrumentError> {
        check_code(EGG5110_SENSITIVITIES.len(), code, "sensitivity")?;
        self.bus.write(&format!("SEN {code}"))
    }

    pub fn time_constant(&mut self) -> Result<Quantity, InstrumentError> {
        let reply = self.bus.ask("TC")?;
        lookup(
            &EGG5110_TIME_CONSTANTS,
            parse_i64(&reply, "time constant code")?,
            "time constant code",
        )
    }

    pub fn set_time_constant(&mut self, code: u8) -> Result<(), InstrumentError> {
        check_code(EGG5110_TIME_CONSTANTS.len(), code, "time constant")?;
        self.bus.write(&format!("TC {code}"))
    }

    /// Read X, Y or MAG as a fraction of full scale.
    pub fn measure(&mut self, measurement: Measurement) -> Result<f64, InstrumentError> {
        let command = match measurement {
            Measurement::X => "X",
            Measurement::Y => "Y",
            Measurement::Magnitude => "MAG",
        };
        let reply = self.bus.ask(command)?;
        let fraction = parse_i64(&reply, "measurement")? as f64 / 10000.0;
        debug!("5110 {command} = {fraction}");
        Ok(fraction)
    }

    /// Read X, Y or MAG in the units of the current sensitivity.
    pub fn measure_scaled(
        &mut self,
        measurement: Measurement,
    ) -> Result<Quantity, InstrumentError> {
        let fraction = self.measure(measurement)?;
        let sensitivity = self.sensitivity()?;
        Ok(Quantity::new(fraction * sensitivity.value, sensitivity.unit))
    }

    pub fn x(&mut self) -> Result<f64, InstrumentError> {
        self.measure(Measurement::X)
    }

    pub fn y(&mut self) -> Result<f64, InstrumentError> {
        self.measure(Measurement::Y)
    }

    pub fn r(&mut self) -> Result<f64, InstrumentError> {
        self.measure(Measurement::Magnitude)
    }

    /// Reference phase in degrees.
    pub fn phase(&mut self) -> Result<f64, InstrumentError> {
        let reply = self.bus.ask("PHA")?;
        Ok(parse_i64(&reply, "phase")? as f64 / 1000.0)
    }

    /// Read one of the four ADC inputs, in volts.
    pub fn adc(&mut self, n: u8) -> Result<f64, InstrumentError> {
        check_adc(n)?;
        let reply = self.bus.ask(&format!("ADC {n}"))?;
        Ok(parse_f64(&reply, "ADC reading")? / 1000.0)
    }

    /// Adjust the reference phase to maximize X and null Y.
    pub fn autophase(&mut self) -> Result<(), InstrumentError> {
        self.bus.write("AQN")
    }

    /// Whether the front panel lights are on.
    pub fn lights(&mut self) -> Result<bool, InstrumentError> {
        let reply = self.bus.ask("LTS")?;
        parse_flag(&reply, "lights")
    }

    pub fn set_lights(&mut self, on: bool) -> Result<(), InstrumentError> {
        self.bus.write(&format!("LTS {}", u8::from(on)))
    }

    pub fn bus(&mut self) -> &mut B {
        &mut self.bus
    }
}

impl<B: Bus> LockIn for Egg5110<B> {
    fn magnitude(&mut self) -> Result<f64, InstrumentError> {
        self.r()
    }

    fn time_constant(&mut self) -> Result<Quantity, InstrumentError> {
        Egg5110::time_constant(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockPort;
    use crate::bus::SerialBus;
    use std::time::Duration;

    fn bus(port: &MockPort) -> SerialBus<MockPort> {
        SerialBus::new(port.clone(), "\n").with_lag(Duration::ZERO)
    }

    fn egg(port: &MockPort) -> Egg5110<SerialBus<MockPort>> {
        port.reply("5110\r\n");
        Egg5110::new(bus(port)).unwrap()
    }

    #[test]
    fn srs830_outputs_and_aux_inputs() {
        let port = MockPort::new();
        port.reply("1.25e-3\n");
        port.reply("-0.5\n");
        port.reply("0.002\n");
        port.reply("3.3\n");
        let mut li = Srs830::new(bus(&port));

        assert_eq!(li.x().unwrap(), 1.25e-3);
        assert_eq!(li.y().unwrap(), -0.5);
        assert_eq!(li.r().unwrap(), 0.002);
        assert_eq!(li.adc(4).unwrap(), 3.3);
        assert_eq!(
            port.written_strings(),
            vec!["OUTP?1\n", "OUTP?2\n", "OUTP?3\n", "OAUX?4\n"]
        );
    }

    #[test]
    fn adc_channel_is_checked_before_asking() {
        let port = MockPort::new();
        let mut li = Srs830::new(bus(&port));
        assert!(matches!(li.adc(0), Err(InstrumentError::OutOfRange(_))));
        assert!(matches!(li.adc(5), Err(InstrumentError::OutOfRange(_))));
        assert!(port.written().is_empty());
    }

    #[test]
    fn srs830_time_constant_table() {
        let port = MockPort::new();
        port.reply("10\n");
        let mut li = Srs830::new(bus(&port));
        let tc = li.time_constant().unwrap();
        assert_eq!(tc, Quantity::new(1.0, "s"));
        assert_eq!(tc.seconds().unwrap(), 1.0);
    }

    #[test]
    fn egg5110_rejects_other_instruments() {
        let port = MockPort::new();
        port.reply("7265\r\n");
        assert!(Egg5110::new(bus(&port)).is_err());
    }

    #[test]
    fn egg5110_measurements_are_fractions_of_full_scale() {
        let port = MockPort::new();
        let mut li = egg(&port);

        port.reply("5000\n");
        assert_eq!(li.r().unwrap(), 0.5);

        port.reply("-2500\n");
        port.reply("14\n");
        assert_eq!(
            li.measure_scaled(Measurement::X).unwrap(),
            Quantity::new(-1.25, "mV")
        );
    }

    #[test]
    fn egg5110_tables() {
        let port = MockPort::new();
        let mut li = egg(&port);

        port.reply("0\n");
        assert_eq!(li.sensitivity().unwrap(), Quantity::new(100.0, "nV"));
        port.reply("21\n");
        assert_eq!(li.sensitivity().unwrap(), Quantity::new(1.0, "V"));
        port.reply("22\n");
        assert!(matches!(li.sensitivity(), Err(InstrumentError::Parse { .. })));

        port.reply("5\n");
        assert_eq!(li.time_constant().unwrap().seconds().unwrap(), 0.1);
        port.reply("0\n");
        assert!(li.time_constant().unwrap().seconds().is_err());

        assert!(li.set_sensitivity(22).is_err());
        li.set_time_constant(12).unwrap();
        assert_eq!(port.written_strings().last().unwrap(), "TC 12\n");
    }

    #[test]
    fn egg5110_phase_adc_and_lights() {
        let port = MockPort::new();
        let mut li = egg(&port);

        port.reply("-45500\n");
        assert_eq!(li.phase().unwrap(), -45.5);
        port.reply("2500\n");
        assert_eq!(li.adc(1).unwrap(), 2.5);
        port.reply("1\n");
        assert!(li.lights().unwrap());

        li.set_lights(false).unwrap();
        li.autophase().unwrap();
        let sent = port.written_strings();
        assert_eq!(&sent[sent.len() - 2..], &["LTS 0\n", "AQN\n"]);
    }
}
