mod config;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info, warn, LevelFilter};
use optolab::ccd::CcdClient;
use optolab::experiment::{self, ScanPoint, DEFAULT_WAIT_FACTOR};
use optolab::instruments::lockin::{Egg5110, LockIn, Srs830};
use optolab::instruments::spectrometer::{self, Monochromator, Spex750m, Triax320};
use optolab::instruments::wavemeter::{self, Burleigh};
use optolab::prologix::{GpibInstrument, PrologixBuilder, SharedController};
use optolab::{Bus, DataLogger};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::config::{
    load_config_or_default, AppConfig, ControllerKind, LockinModel, SpectrometerModel,
};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Lab instrument control
#[derive(Parser, Debug)]
#[command(name = "labctl")]
#[command(
    about = "Drive spectrometers, lock-ins and friends from the command line",
    long_about = None
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a query to a GPIB address and print the reply
    Ask {
        addr: u8,
        query: String,
    },
    /// Read, move or calibrate the spectrometer
    Wavelength {
        /// Move to this wavelength (nm)
        #[arg(long)]
        set: Option<f64>,
        /// Declare the current position to be this wavelength (nm)
        #[arg(long, conflicts_with = "set")]
        calibrate: Option<f64>,
    },
    /// Take one CCD exposure
    Spectrum {
        /// Grating position (nm), overriding the configuration
        #[arg(long)]
        center_wl: Option<f64>,
    },
    /// Scan the spectrometer and record the lock-in magnitude
    Scan {
        #[arg(long)]
        start: f64,
        #[arg(long)]
        stop: f64,
        #[arg(long)]
        step: f64,
        #[arg(long, default_value_t = 1)]
        averages: usize,
        /// Lock-in time constants to wait before each reading
        #[arg(long, default_value_t = DEFAULT_WAIT_FACTOR)]
        wait_factor: f64,
    },
    /// Print wavemeter readings until Ctrl+C
    Wavemeter {
        #[arg(long, default_value = wavemeter::DEFAULT_PORT)]
        port: String,
    },
}

/// One CCD exposure, as logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpectrumRecord {
    timestamp: DateTime<Utc>,
    center_wl: f64,
    wavelengths: Vec<f64>,
    counts: Vec<f64>,
}

fn main() -> CliResult<()> {
    let args = Args::parse();
    let config = load_config_or_default(args.config.as_deref())?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.console.verbosity.clone());
    initialize_logging(&log_level);
    log_startup_info(&config, args.config.as_deref());

    let result = match args.command {
        Command::Ask { addr, query } => run_ask(&config, addr, &query),
        Command::Wavelength { set, calibrate } => run_wavelength(&config, set, calibrate),
        Command::Spectrum { center_wl } => run_spectrum(&config, center_wl),
        Command::Scan {
            start,
            stop,
            step,
            averages,
            wait_factor,
        } => run_scan(&config, start, stop, step, averages, wait_factor),
        Command::Wavemeter { port } => run_wavemeter(&config, &port),
    };

    if let Err(ref e) = result {
        error!("✗ {e}");
    }
    result
}

fn log_startup_info(config: &AppConfig, config_path: Option<&Path>) {
    info!("=== labctl ===");
    match config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults / labctl.toml"),
    }
    info!(
        "Prologix: {:?} at {}",
        config.prologix.kind, config.prologix.address
    );
}

fn connect_prologix(config: &AppConfig) -> CliResult<SharedController> {
    let builder = PrologixBuilder::new()
        .lag(Duration::from_millis(config.prologix.lag_ms))
        .timeout(Duration::from_millis(config.prologix.timeout_ms));
    let builder = match config.prologix.kind {
        ControllerKind::Usb => builder.usb(&config.prologix.address),
        ControllerKind::Ethernet => builder.ethernet(&config.prologix.address),
    };
    let controller = builder.build()?;
    info!("Connected to Prologix controller");
    Ok(controller)
}

fn open_spectrometer(config: &AppConfig) -> CliResult<Box<dyn Monochromator>> {
    let port = config.spectrometer.port.as_deref();
    let mono: Box<dyn Monochromator> = match config.spectrometer.model {
        SpectrometerModel::Spex750m => Box::new(Spex750m::open(
            port.unwrap_or(spectrometer::SPEX750M_PORT),
        )?),
        SpectrometerModel::Triax320 => Box::new(Triax320::open(
            port.unwrap_or(spectrometer::TRIAX320_PORT),
        )?),
    };
    Ok(mono)
}

fn open_lockin(config: &AppConfig, controller: SharedController) -> CliResult<Box<dyn LockIn>> {
    let bus = GpibInstrument::new(controller, config.lockin.gpib_address);
    let lockin: Box<dyn LockIn> = match config.lockin.model {
        LockinModel::Egg5110 => Box::new(Egg5110::new(bus)?),
        LockinModel::Srs830 => Box::new(Srs830::new(bus)),
    };
    Ok(lockin)
}

fn run_ask(config: &AppConfig, addr: u8, query: &str) -> CliResult<()> {
    let controller = connect_prologix(config)?;
    let mut instrument = GpibInstrument::new(controller, addr);
    println!("{}", instrument.ask(query)?);
    Ok(())
}

fn run_wavelength(config: &AppConfig, set: Option<f64>, calibrate: Option<f64>) -> CliResult<()> {
    let mut mono = open_spectrometer(config)?;
    if let Some(nm) = calibrate {
        info!("Calibrating spectrometer to {nm} nm");
        mono.calibrate(nm)?;
    }
    if let Some(nm) = set {
        info!("Moving spectrometer to {nm} nm");
        mono.set_wavelength(nm)?;
    }
    println!("{}", mono.wavelength()?);
    Ok(())
}

fn run_spectrum(config: &AppConfig, center_wl: Option<f64>) -> CliResult<()> {
    let center_wl = center_wl.unwrap_or(config.ccd.center_wl);
    let mut ccd = CcdClient::connect_to(
        &config.ccd.host,
        config.ccd.port,
        center_wl,
        optolab::ccd::DEFAULT_TIMEOUT,
    )?;
    let spectrum = ccd.spectrum()?;
    let trace = spectrum.collapse();
    for (wl, counts) in spectrum.wavelengths.iter().zip(trace.iter()) {
        println!("{wl}\t{counts}");
    }

    if config.output.enabled {
        let path = create_log_file_path(&config.output.data_dir, "spectrum")?;
        let mut logger = DataLogger::new(path, 1, false);
        logger.add(SpectrumRecord {
            timestamp: Utc::now(),
            center_wl,
            wavelengths: spectrum.wavelengths.to_vec(),
            counts: trace.to_vec(),
        })?;
        info!("Saved spectrum to {}", logger.path().display());
    }
    Ok(())
}

fn run_scan(
    config: &AppConfig,
    start: f64,
    stop: f64,
    step: f64,
    averages: usize,
    wait_factor: f64,
) -> CliResult<()> {
    let wavelengths = experiment::steps(start, stop, step)?;
    info!(
        "Scanning {} points from {start} to {stop} nm",
        wavelengths.len()
    );

    let controller = connect_prologix(config)?;
    let mut lockin = open_lockin(config, controller)?;
    let mut mono = open_spectrometer(config)?;
    let shutdown_flag = setup_shutdown_handler()?;

    let mut logger = if config.output.enabled {
        let path = create_log_file_path(&config.output.data_dir, "scan")?;
        Some(DataLogger::new(path, 100, true))
    } else {
        None
    };

    let scan = experiment::spectrum_scan(
        wavelengths,
        mono.as_mut(),
        lockin.as_mut(),
        averages,
        wait_factor,
    )?;
    for point in scan {
        if shutdown_flag.load(Ordering::SeqCst) {
            warn!("Scan stopped by user");
            break;
        }
        let (wl, signal) = point?;
        println!("{wl}\t{signal}");
        if let Some(logger) = logger.as_mut() {
            logger.add(ScanPoint { x: wl, y: signal })?;
        }
    }

    if let Some(mut logger) = logger {
        logger.finalize_as_json()?;
        info!("Saved scan to {}", logger.path().display());
    }
    Ok(())
}

fn run_wavemeter(config: &AppConfig, port: &str) -> CliResult<()> {
    let mut meter = Burleigh::open(port)?;
    let shutdown_flag = setup_shutdown_handler()?;
    let mut logger = if config.output.enabled {
        let path = create_log_file_path(&config.output.data_dir, "wavemeter")?;
        Some(DataLogger::new(path, 100, false))
    } else {
        None
    };

    for reading in meter.stream(&shutdown_flag) {
        let (t, value) = reading?;
        match value {
            Some(wl) => {
                println!("{t:.2}\t{wl}");
                if let Some(logger) = logger.as_mut() {
                    logger.add(ScanPoint { x: t, y: wl })?;
                }
            }
            None => println!("{t:.2}\t---"),
        }
    }
    info!("Wavemeter stream stopped");
    Ok(())
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler() -> CliResult<Arc<AtomicBool>> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping after the current reading...");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
    })?;

    Ok(shutdown_flag)
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{log_level}', using 'info'");
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

fn create_log_file_path(data_dir: &str, kind: &str) -> CliResult<PathBuf> {
    let dir = PathBuf::from(data_dir);
    fs::create_dir_all(&dir)?;
    let filename = format!("{kind}_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"));
    Ok(dir.join(filename))
}
