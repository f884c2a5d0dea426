use log::{error, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use std::ffi::OsStr;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::InstrumentError;

/// Buffered writer for measurement records.
///
/// Records are appended to a JSON Lines file every `buffer_size` entries.
/// With `final_format_json` set, the file is rewritten as a pretty-printed
/// JSON array when the logger is finalized or dropped.
///
/// A failed flush keeps the buffer and is retried on the next one, so a
/// briefly unavailable disk does not abort a measurement. Only after
/// `max_flush_failures` failures in a row is the error returned.
#[derive(Debug)]
pub struct DataLogger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    buffer: Vec<T>,
    buffer_size: usize,
    file_path: PathBuf,
    final_format_json: bool,
    flush_failures: usize,
    max_flush_failures: usize,
}

impl<T> DataLogger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    pub fn new<P: Into<PathBuf>>(
        file_path: P,
        buffer_size: usize,
        final_format_json: bool,
    ) -> Self {
        let mut path = file_path.into();
        let extension = if final_format_json { "json" } else { "jsonl" };
        if path.extension() != Some(OsStr::new(extension)) {
            path.set_extension(extension);
        }

        Self {
            buffer: Vec::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
            file_path: path,
            final_format_json,
            flush_failures: 0,
            max_flush_failures: 10,
        }
    }

    pub fn with_max_flush_failures(mut self, max: usize) -> Self {
        self.max_flush_failures = max.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn add(&mut self, record: T) -> Result<(), InstrumentError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    fn append_buffer(&self) -> Result<(), InstrumentError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .map_err(|e| InstrumentError::io(e, format!("opening {:?}", self.file_path)))?;
        let mut writer = BufWriter::new(file);
        for record in &self.buffer {
            serde_json::to_writer(&mut writer, record)?;
            writeln!(writer)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), InstrumentError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        match self.append_buffer() {
            Ok(()) => {
                info!("Wrote {} records to {:?}", self.buffer.len(), self.file_path);
                self.flush_failures = 0;
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                error!(
                    "Flush failure {}/{}: {e}",
                    self.flush_failures, self.max_flush_failures
                );
                if self.flush_failures % 3 == 0 {
                    warn!(
                        "Experiencing intermittent flush failures ({}/{})",
                        self.flush_failures, self.max_flush_failures
                    );
                }
                if self.flush_failures >= self.max_flush_failures {
                    return Err(InstrumentError::Io {
                        source: std::io::Error::other(e.to_string()),
                        context: format!(
                            "{} consecutive flush failures for {:?}",
                            self.flush_failures, self.file_path
                        ),
                    });
                }
                Ok(())
            }
        }
    }

    /// Rewrite the JSON Lines file as a JSON array.
    pub fn finalize_as_json(&mut self) -> Result<(), InstrumentError> {
        if !self.final_format_json {
            return Ok(());
        }
        self.flush()?;
        if !self.file_path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&self.file_path)
            .map_err(|e| InstrumentError::io(e, format!("reading {:?}", self.file_path)))?;
        // already converted by an earlier call
        if content.trim_start().starts_with('[') {
            return Ok(());
        }
        let records = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<Vec<T>, _>>()?;

        std::fs::write(&self.file_path, serde_json::to_string_pretty(&records)?)
            .map_err(|e| InstrumentError::io(e, format!("writing {:?}", self.file_path)))?;
        info!("Converted {} records to JSON", records.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl<T> Drop for DataLogger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    fn drop(&mut self) {
        if let Err(e) = self.flush().and_then(|_| self.finalize_as_json()) {
            error!("Losing logged data for {:?}: {e}", self.file_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::ScanPoint;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("optolab_{name}_{}", std::process::id()))
    }

    #[test]
    fn buffers_until_full_then_appends_lines() {
        let path = temp_path("lines").with_extension("jsonl");
        let _ = std::fs::remove_file(&path);

        let mut log = DataLogger::new(&path, 2, false);
        log.add(ScanPoint { x: 770.0, y: 0.5 }).unwrap();
        assert_eq!(log.len(), 1);
        assert!(!path.exists());
        log.add(ScanPoint { x: 770.5, y: 0.75 }).unwrap();
        assert!(log.is_empty());

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert_eq!(content.lines().next().unwrap(), r#"{"x":770.0,"y":0.5}"#);
        drop(log);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn drop_converts_to_json_array() {
        let path = temp_path("array");
        let mut log = DataLogger::new(&path, 100, true);
        let written = log.path().to_path_buf();
        assert_eq!(written.extension(), Some(OsStr::new("json")));
        let _ = std::fs::remove_file(&written);

        log.add(ScanPoint { x: 1.0, y: 2.0 }).unwrap();
        log.add(ScanPoint { x: 3.0, y: 4.0 }).unwrap();
        drop(log);

        let records: Vec<ScanPoint> =
            serde_json::from_str(&std::fs::read_to_string(&written).unwrap()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], ScanPoint { x: 3.0, y: 4.0 });
        std::fs::remove_file(&written).unwrap();
    }

    #[test]
    fn repeated_flush_failures_become_an_error() {
        let path = std::env::temp_dir()
            .join("optolab_missing_dir")
            .join("nested")
            .join("log");
        let mut log = DataLogger::new(&path, 1, false).with_max_flush_failures(2);
        assert!(log.add(ScanPoint { x: 0.0, y: 0.0 }).is_ok());
        assert!(log.add(ScanPoint { x: 1.0, y: 0.0 }).is_err());
        assert_eq!(log.len(), 2);
        std::mem::forget(log);
    }
}
