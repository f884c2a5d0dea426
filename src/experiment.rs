//! Generic measurement loops: time series, parameter scans, and scanned
//! spectra taken with a monochromator and a lock-in.
//!
//! All of these are lazy iterators, so a caller can log, plot or stop after
//! any point.

use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::InstrumentError;
use crate::instruments::lockin::LockIn;
use crate::instruments::spectrometer::Monochromator;

/// Default multiple of the lock-in time constant to settle after a move.
pub const DEFAULT_WAIT_FACTOR: f64 = 1.75;

/// One point of a scan, as written to a data log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPoint {
    pub x: f64,
    pub y: f64,
}

impl From<(f64, f64)> for ScanPoint {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// Iterator returned by [`monitor`].
pub struct Monitor<'a, F> {
    read: F,
    interval: Duration,
    absolute: bool,
    stop: &'a AtomicBool,
    start: Option<Instant>,
    done: bool,
}

/// Call `read` every `interval` and yield `(time, value)` until `stop` is
/// set or a read fails.
///
/// Time is seconds since the first reading, or since the Unix epoch when
/// `absolute` is set.
pub fn monitor<F, T>(
    read: F,
    interval: Duration,
    absolute: bool,
    stop: &AtomicBool,
) -> Monitor<'_, F>
where
    F: FnMut() -> Result<T, InstrumentError>,
{
    Monitor {
        read,
        interval,
        absolute,
        stop,
        start: None,
        done: false,
    }
}

impl<F, T> Iterator for Monitor<'_, F>
where
    F: FnMut() -> Result<T, InstrumentError>,
{
    type Item = Result<(f64, T), InstrumentError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.stop.load(Ordering::SeqCst) {
            return None;
        }
        let start = match self.start {
            Some(start) => {
                std::thread::sleep(self.interval);
                if self.stop.load(Ordering::SeqCst) {
                    return None;
                }
                start
            }
            None => *self.start.insert(Instant::now()),
        };
        let t = if self.absolute {
            Utc::now().timestamp_micros() as f64 / 1e6
        } else {
            start.elapsed().as_secs_f64()
        };
        match (self.read)() {
            Ok(value) => Some(Ok((t, value))),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// A generic scan: for each x, apply it, wait `lag`, then measure.
///
/// Yields `(x, y)` pairs. The first error ends the scan.
///
/// ```no_run
/// use std::time::Duration;
/// use optolab::experiment::Scanner;
///
/// let mut position = 0.0;
/// let scan = Scanner::new(
///     vec![0.0, 0.5, 1.0],
///     |x| { position = x; Ok(()) },
///     || Ok(42.0),
///     Duration::from_millis(300),
/// );
/// for point in scan {
///     let (x, y) = point?;
///     println!("{x} {y}");
/// }
/// # Ok::<(), optolab::InstrumentError>(())
/// ```
pub struct Scanner<I, S, G> {
    xvals: I,
    set: S,
    get: G,
    lag: Duration,
    done: bool,
}

impl<It, S, G, Y> Scanner<It, S, G>
where
    It: Iterator<Item = f64>,
    S: FnMut(f64) -> Result<(), InstrumentError>,
    G: FnMut() -> Result<Y, InstrumentError>,
{
    pub fn new<I>(xvals: I, set: S, get: G, lag: Duration) -> Self
    where
        I: IntoIterator<Item = f64, IntoIter = It>,
    {
        Self {
            xvals: xvals.into_iter(),
            set,
            get,
            lag,
            done: false,
        }
    }
}

impl<I, S, G, Y> Iterator for Scanner<I, S, G>
where
    I: Iterator<Item = f64>,
    S: FnMut(f64) -> Result<(), InstrumentError>,
    G: FnMut() -> Result<Y, InstrumentError>,
{
    type Item = Result<(f64, Y), InstrumentError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let x = self.xvals.next()?;
        let step = (self.set)(x).and_then(|_| {
            std::thread::sleep(self.lag);
            (self.get)()
        });
        match step {
            Ok(y) => Some(Ok((x, y))),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Scan a monochromator across `wavelengths`, recording the lock-in
/// magnitude at each one.
///
/// Before every reading the scan waits `wait_factor` lock-in time
/// constants; `averages` readings are averaged per wavelength. Yields
/// `(wavelength, signal)`.
pub fn spectrum_scan<'a, M, L>(
    wavelengths: impl IntoIterator<Item = f64> + 'a,
    monochromator: &'a mut M,
    lockin: &'a mut L,
    averages: usize,
    wait_factor: f64,
) -> Result<impl Iterator<Item = Result<(f64, f64), InstrumentError>> + 'a, InstrumentError>
where
    M: Monochromator + ?Sized,
    L: LockIn + ?Sized,
{
    if averages == 0 {
        return Err(InstrumentError::OutOfRange(
            "a scan needs at least one reading per point".to_string(),
        ));
    }
    let time_constant = lockin.time_constant()?;
    let wait = Duration::from_secs_f64(time_constant.seconds()? * wait_factor);
    info!("Scanning with time constant {time_constant}, waiting {wait:?} per reading");

    Ok(Scanner::new(
        wavelengths,
        move |wl| monochromator.set_wavelength(wl),
        move || {
            let mut tally = 0.0;
            for _ in 0..averages {
                std::thread::sleep(wait);
                tally += lockin.magnitude()?;
            }
            let signal = tally / averages as f64;
            debug!("signal {signal}");
            Ok(signal)
        },
        Duration::ZERO,
    ))
}

/// Evenly spaced values from `start` to `stop` inclusive.
pub fn steps(start: f64, stop: f64, step: f64) -> Result<Vec<f64>, InstrumentError> {
    if step <= 0.0 || !step.is_finite() {
        return Err(InstrumentError::OutOfRange(format!("scan step {step}")));
    }
    let count = ((stop - start).abs() / step + 1e-9).floor() as usize + 1;
    let sign = if stop >= start { 1.0 } else { -1.0 };
    Ok((0..count).map(|i| start + sign * step * i as f64).collect())
}
