use chrono::Local;
use log::warn;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use crate::error::InstrumentError;
use crate::utils::show_newlines;

/// Appends a timestamped record of bus traffic to a file.
///
/// ```text
/// time (s) event  data
/// -------- -----  ----
///
///     0.00 write: 1PA?<CR><LF>
///     0.05  read: 12.5<CR><LF>
/// ```
pub struct TrafficLog {
    writer: BufWriter<File>,
    start: Instant,
}

impl TrafficLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, InstrumentError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| InstrumentError::io(e, format!("opening traffic log {path:?}")))?;
        let mut writer = BufWriter::new(file);
        let header = format!(
            "\n\nstart logging at {}\n\ntime (s) event  data\n{} {}  {}\n\n",
            Local::now().format("%a %b %e %H:%M:%S %Y"),
            "-".repeat(8),
            "-".repeat(5),
            "-".repeat(4),
        );
        writer
            .write_all(header.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| InstrumentError::io(e, format!("writing traffic log {path:?}")))?;
        Ok(Self {
            writer,
            start: Instant::now(),
        })
    }

    /// Record one event. Failures are logged and otherwise ignored so a full
    /// disk never interrupts a measurement.
    pub fn record(&mut self, event: &str, data: &str) {
        let event: String = event.chars().take(5).collect();
        let line = format!(
            "{:8.2} {:>5}: {}\n",
            self.start.elapsed().as_secs_f64(),
            event,
            show_newlines(data)
        );
        if let Err(e) = self
            .writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.flush())
        {
            warn!("Traffic log write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_events_with_visible_newlines() {
        let path = std::env::temp_dir().join(format!(
            "optolab_traffic_{}_{:?}.log",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_file(&path);

        let mut log = TrafficLog::open(&path).unwrap();
        log.record("write", "1PA?\r\n");
        log.record("readback", "12.5\r\n");
        drop(log);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("start logging at"));
        assert!(content.contains("time (s) event  data"));
        assert!(content.contains("write: 1PA?<CR><LF>"));
        assert!(content.contains("readb: 12.5<CR><LF>"));
        std::fs::remove_file(&path).unwrap();
    }
}
