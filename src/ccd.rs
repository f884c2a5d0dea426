//! Client for the LabVIEW server that runs the CCD-2000 camera on the SPEX
//! 750M.
//!
//! The server computes the wavelength axis from its dispersion calibration,
//! so it needs to know where the grating is. The client does not move the
//! spectrometer itself: whenever the grating moves, update
//! [`CcdClient::set_center_wl`] to match.
//!
//! ```no_run
//! use optolab::ccd::CcdClient;
//!
//! let mut ccd = CcdClient::connect("192.168.1.20", 800.0)?;
//! let spectrum = ccd.spectrum()?;
//! println!("{} pixels, {} rows", spectrum.wavelengths.len(), spectrum.counts.nrows());
//! # Ok::<(), optolab::InstrumentError>(())
//! ```

use log::{debug, info, warn};
use ndarray::{Array1, Array2, Axis};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::InstrumentError;

pub const DEFAULT_PORT: u16 = 3663;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const HEADER_LEN: usize = 7;

/// One CCD exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    /// Wavelength of each pixel column, in nm.
    pub wavelengths: Array1<f64>,
    /// Counts, one row per CCD row.
    pub counts: Array2<f64>,
}

impl Spectrum {
    /// Sum the CCD rows into a single trace matching `wavelengths`.
    pub fn collapse(&self) -> Array1<f64> {
        self.counts.sum_axis(Axis(0))
    }

    /// Parse the server's payload: tab-separated columns, newline-terminated
    /// rows, wavelengths in the first row.
    pub fn parse(payload: &str) -> Result<Self, InstrumentError> {
        let mut rows: Vec<&str> = payload.split('\n').collect();
        // everything after the last newline is incomplete
        rows.pop();
        if rows.is_empty() {
            return Err(InstrumentError::parse("CCD spectrum", payload));
        }

        let mut values = Vec::new();
        let mut width = None;
        for row in &rows {
            let parsed = row
                .split('\t')
                .map(|cell| {
                    cell.trim()
                        .parse::<f64>()
                        .map_err(|_| InstrumentError::parse("CCD value", cell))
                })
                .collect::<Result<Vec<f64>, _>>()?;
            match width {
                None => width = Some(parsed.len()),
                Some(w) if w != parsed.len() => {
                    return Err(InstrumentError::parse(
                        "CCD spectrum",
                        format!("row of {} values, expected {w}", parsed.len()),
                    ));
                }
                Some(_) => {}
            }
            values.extend(parsed);
        }

        let width = width.unwrap_or(0);
        let all = Array2::from_shape_vec((rows.len(), width), values)
            .map_err(|e| InstrumentError::parse("CCD spectrum", e.to_string()))?;
        Ok(Spectrum {
            wavelengths: all.row(0).to_owned(),
            counts: all.slice(ndarray::s![1.., ..]).to_owned(),
        })
    }
}

/// The server reads the grating position as a decimal number of
/// hundredths of a nm, always written with a fractional part.
fn request_for(center_wl: f64) -> String {
    format!("Q{:?}", 100.0 * center_wl)
}

pub struct CcdClient {
    host: String,
    port: u16,
    center_wl: f64,
    timeout: Duration,
    stream: TcpStream,
}

impl CcdClient {
    /// Connect to the server on its default port.
    pub fn connect(host: &str, center_wl: f64) -> Result<Self, InstrumentError> {
        Self::connect_to(host, DEFAULT_PORT, center_wl, DEFAULT_TIMEOUT)
    }

    pub fn connect_to(
        host: &str,
        port: u16,
        center_wl: f64,
        timeout: Duration,
    ) -> Result<Self, InstrumentError> {
        let stream = Self::open(host, port, timeout)?;
        info!("Connected to CCD server at {host}:{port}");
        Ok(Self {
            host: host.to_string(),
            port,
            center_wl,
            timeout,
            stream,
        })
    }

    fn open(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, InstrumentError> {
        let stream = TcpStream::connect((host, port)).map_err(|e| {
            InstrumentError::io(e, format!("connecting to CCD server {host}:{port}"))
        })?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| InstrumentError::io(e, "setting CCD read timeout"))?;
        Ok(stream)
    }

    /// Re-open the connection, e.g. after the LabVIEW program was restarted.
    pub fn reconnect(&mut self) -> Result<(), InstrumentError> {
        self.stream = Self::open(&self.host, self.port, self.timeout)?;
        info!("Reconnected to CCD server at {}:{}", self.host, self.port);
        Ok(())
    }

    pub fn center_wl(&self) -> f64 {
        self.center_wl
    }

    /// Tell the server where the grating is now, in nm.
    pub fn set_center_wl(&mut self, nm: f64) {
        self.center_wl = nm;
    }

    /// Take a shot. If the server does not answer, reconnect and try once
    /// more.
    pub fn spectrum(&mut self) -> Result<Spectrum, InstrumentError> {
        match self.acquire() {
            Err(InstrumentError::NoResponse(msg)) => {
                warn!("{msg}");
                self.reconnect()?;
                self.acquire()
            }
            other => other,
        }
    }

    fn acquire(&mut self) -> Result<Spectrum, InstrumentError> {
        let request = request_for(self.center_wl);
        self.stream
            .write_all(request.as_bytes())
            .and_then(|_| self.stream.flush())
            .map_err(|e| InstrumentError::io(e, "sending CCD request"))?;

        let header = self.read_header()?;
        let length = header
            .trim()
            .parse::<usize>()
            .map_err(|_| InstrumentError::parse("CCD data length", header.as_str()))?;
        debug!("CCD sending {length} bytes");

        let mut payload = vec![0u8; length];
        self.stream
            .read_exact(&mut payload)
            .map_err(|e| InstrumentError::io(e, format!("reading {length} bytes of CCD data")))?;
        Spectrum::parse(&String::from_utf8_lossy(&payload))
    }

    fn read_header(&mut self) -> Result<String, InstrumentError> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            match self.stream.read(&mut header[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if filled == 0 && e.kind() == std::io::ErrorKind::ConnectionReset => break,
                Err(e) => return Err(InstrumentError::io(e, "reading CCD header")),
            }
        }
        if filled == 0 {
            return Err(InstrumentError::NoResponse(
                "no response from the CCD server, try reconnecting".to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&header[..filled]).into_owned())
    }
}
