use std::time::{Duration, Instant};

use crate::error::InstrumentError;

/// Error type for polling operations
#[derive(Debug)]
pub enum PollError<E> {
    /// Operation timed out
    Timeout,
    /// Error occurred in the condition/operation function
    ConditionError(E),
}

impl<E> std::fmt::Display for PollError<E>
where
    E: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Timeout => write!(f, "Operation timed out"),
            PollError::ConditionError(e) => write!(f, "Condition error: {}", e),
        }
    }
}

impl<E> std::error::Error for PollError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::Timeout => None,
            PollError::ConditionError(e) => Some(e),
        }
    }
}

impl PollError<InstrumentError> {
    /// Flatten into an [`InstrumentError`], naming what was being waited for.
    pub fn into_instrument_error(self, waiting_for: &str) -> InstrumentError {
        match self {
            PollError::Timeout => InstrumentError::Timeout(format!("waiting for {waiting_for}")),
            PollError::ConditionError(e) => e,
        }
    }
}

/// Poll a condition with timeout
///
/// Repeatedly calls `condition` until it returns `Ok(true)` or timeout is reached.
///
/// # Arguments
/// * `condition` - Function that returns `Ok(true)` when complete, `Ok(false)` to continue polling
/// * `timeout` - Maximum duration to wait
/// * `poll_interval` - Duration to sleep between condition checks
///
/// # Example
/// ```
/// use std::time::Duration;
/// use optolab::utils::poll_until;
///
/// let mut polls = 0;
/// poll_until(
///     || {
///         polls += 1;
///         Ok::<bool, &str>(polls >= 3)
///     },
///     Duration::from_secs(1),
///     Duration::from_millis(1),
/// )
/// .unwrap();
/// ```
pub fn poll_until<F, E>(
    mut condition: F,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Result<bool, E>,
{
    let start = Instant::now();

    loop {
        if start.elapsed() >= timeout {
            return Err(PollError::Timeout);
        }

        match condition() {
            Ok(true) => return Ok(()),
            Ok(false) => {
                std::thread::sleep(poll_interval);
            }
            Err(e) => return Err(PollError::ConditionError(e)),
        }
    }
}

/// Parse an instrument reply as a number.
///
/// Replies without a decimal point are read as integers, everything else as
/// floating point. Both come back as `f64`.
pub fn num(reply: &str) -> Result<f64, InstrumentError> {
    let trimmed = reply.trim();
    if trimmed.contains('.') {
        trimmed
            .parse::<f64>()
            .map_err(|_| InstrumentError::parse("number", reply))
    } else {
        trimmed
            .parse::<i64>()
            .map(|v| v as f64)
            .map_err(|_| InstrumentError::parse("integer", reply))
    }
}

/// Parse a reply holding a single float.
pub fn parse_f64(reply: &str, what: &str) -> Result<f64, InstrumentError> {
    reply
        .trim()
        .parse::<f64>()
        .map_err(|_| InstrumentError::parse(what, reply))
}

/// Parse a reply holding a single integer.
pub fn parse_i64(reply: &str, what: &str) -> Result<i64, InstrumentError> {
    reply
        .trim()
        .parse::<i64>()
        .map_err(|_| InstrumentError::parse(what, reply))
}

/// Parse a `0`/`1` flag reply.
pub fn parse_flag(reply: &str, what: &str) -> Result<bool, InstrumentError> {
    Ok(parse_i64(reply, what)? != 0)
}

/// Replace CR and LF with visible markers, for traffic logs.
pub fn show_newlines(data: &str) -> String {
    data.replace('\r', "<CR>").replace('\n', "<LF>")
}

/// Round `value` to `significant` significant figures.
pub fn sciround(value: f64, significant: u32) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }
    let magnitude = value.abs().log10().floor() as i32;
    let digits = significant as i32 - 1 - magnitude;
    if digits >= 0 {
        let factor = 10f64.powi(digits);
        (value * factor).round() / factor
    } else {
        let factor = 10f64.powi(-digits);
        (value / factor).round() * factor
    }
}

/// Format like C's `%.0E`: one mantissa digit, signed two-digit exponent.
pub fn format_sci(value: f64) -> String {
    let rust = format!("{value:.0E}");
    match rust.split_once('E') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}E{sign}{:02}", exponent.abs())
        }
        None => rust,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_poll_until_success() {
        let counter = Arc::new(Mutex::new(0));
        let counter_clone = counter.clone();

        let result = poll_until(
            || {
                let mut count = counter_clone.lock().unwrap();
                *count += 1;
                Ok::<bool, &str>(*count >= 3)
            },
            Duration::from_millis(500),
            Duration::from_millis(10),
        );

        assert!(result.is_ok());
        assert!(*counter.lock().unwrap() >= 3);
    }

    #[test]
    fn test_poll_until_timeout() {
        let result = poll_until(
            || Ok::<bool, &str>(false),
            Duration::from_millis(50),
            Duration::from_millis(10),
        );

        assert!(matches!(result, Err(PollError::Timeout)));
    }

    #[test]
    fn test_poll_until_error() {
        let result = poll_until(
            || Err::<bool, &str>("test error"),
            Duration::from_millis(100),
            Duration::from_millis(10),
        );

        assert!(matches!(result, Err(PollError::ConditionError("test error"))));
    }

    #[test]
    fn test_num_picks_integer_or_float() {
        assert_eq!(num("42").unwrap(), 42.0);
        assert_eq!(num(" -7\r\n").unwrap(), -7.0);
        assert_eq!(num("12.5").unwrap(), 12.5);
        assert!(num("1e5").is_err());
        assert!(num("abc").is_err());
    }

    #[test]
    fn test_show_newlines() {
        assert_eq!(show_newlines("PA?\r\n"), "PA?<CR><LF>");
    }

    #[test]
    fn test_sciround() {
        assert_eq!(sciround(0.0043, 1), 0.004);
        assert_eq!(sciround(3.7, 1), 4.0);
        assert_eq!(sciround(12.0, 1), 10.0);
        assert_eq!(sciround(0.0, 1), 0.0);
        assert!((sciround(2.04e-7, 1) - 2e-7).abs() < 1e-18);
    }

    #[test]
    fn test_format_sci() {
        assert_eq!(format_sci(0.004), "4E-03");
        assert_eq!(format_sci(10.0), "1E+01");
        assert_eq!(format_sci(1.0), "1E+00");
        assert_eq!(format_sci(2e-9), "2E-09");
    }
}
