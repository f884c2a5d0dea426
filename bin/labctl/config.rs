use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Highest primary address on a GPIB bus.
const MAX_GPIB_ADDR: u8 = 30;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub console: ConsoleConfig,
    #[serde(default)]
    pub prologix: PrologixConfig,
    #[serde(default)]
    pub spectrometer: SpectrometerConfig,
    #[serde(default)]
    pub lockin: LockinConfig,
    #[serde(default)]
    pub ccd: CcdConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prologix.address.trim().is_empty() {
            return Err(ConfigError::Message(
                "prologix.address must name a serial port or an IP address".to_string(),
            ));
        }
        if self.lockin.gpib_address > MAX_GPIB_ADDR {
            return Err(ConfigError::Message(format!(
                "lockin.gpib_address must be 0..={MAX_GPIB_ADDR}, got {}",
                self.lockin.gpib_address
            )));
        }
        if self.ccd.center_wl <= 0.0 {
            return Err(ConfigError::Message(format!(
                "ccd.center_wl must be positive, got {}",
                self.ccd.center_wl
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConsoleConfig {
    pub verbosity: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    #[default]
    Usb,
    Ethernet,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PrologixConfig {
    pub kind: ControllerKind,
    /// Serial port for USB controllers, IP address for Ethernet ones.
    pub address: String,
    #[serde(default = "default_lag_ms")]
    pub lag_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_lag_ms() -> u64 {
    100
}

fn default_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpectrometerModel {
    #[default]
    Spex750m,
    Triax320,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SpectrometerConfig {
    pub model: SpectrometerModel,
    /// Serial port; each model has its usual default.
    pub port: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LockinModel {
    #[default]
    Egg5110,
    Srs830,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LockinConfig {
    pub model: LockinModel,
    pub gpib_address: u8,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CcdConfig {
    pub host: String,
    #[serde(default = "default_ccd_port")]
    pub port: u16,
    /// Grating position, as read from the spectrometer window.
    pub center_wl: f64,
}

fn default_ccd_port() -> u16 {
    optolab::ccd::DEFAULT_PORT
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OutputConfig {
    pub enabled: bool,
    pub data_dir: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            verbosity: "info".to_string(),
        }
    }
}

impl Default for PrologixConfig {
    fn default() -> Self {
        Self {
            kind: ControllerKind::Usb,
            address: "/dev/ttyUSBgpib".to_string(),
            lag_ms: default_lag_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for LockinConfig {
    fn default() -> Self {
        Self {
            model: LockinModel::Egg5110,
            gpib_address: optolab::instruments::lockin::EGG5110_ADDR,
        }
    }
}

impl Default for CcdConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: default_ccd_port(),
            center_wl: 800.0,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: "./data".to_string(),
        }
    }
}

/// Load configuration from a file, with `LABCTL__SECTION__KEY` environment
/// overrides on top.
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder();

    let mut config_file_found = false;
    if let Some(path) = config_path {
        if !path.exists() {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(File::from(path));
        config_file_found = true;
    } else {
        for path in ["labctl.toml", "config.toml"] {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                config_file_found = true;
                break;
            }
        }
    }

    if !config_file_found {
        builder = builder.add_source(Config::try_from(&AppConfig::default())?);
    }

    builder = builder.add_source(
        Environment::with_prefix("LABCTL")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let app_config = builder.build()?.try_deserialize::<AppConfig>()?;
    app_config.validate()?;
    Ok(app_config)
}

/// Load configuration, falling back to defaults only when no file was asked
/// for and none was found.
pub fn load_config_or_default(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match load_config(config_path) {
        Ok(config) => Ok(config),
        Err(e) if config_path.is_some() => Err(e),
        Err(e) => {
            log::warn!("Using default configuration: {e}");
            Ok(AppConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(name: &str, body: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("labctl_{name}_{}.toml", std::process::id()));
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn defaults_are_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let path = write_config(
            "partial",
            r#"
[prologix]
kind = "ethernet"
address = "192.168.1.50"

[spectrometer]
model = "triax320"
"#,
        );
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.prologix.kind, ControllerKind::Ethernet);
        assert_eq!(config.prologix.lag_ms, 100);
        assert_eq!(config.spectrometer.model, SpectrometerModel::Triax320);
        assert_eq!(config.lockin.gpib_address, 12);
        assert_eq!(config.ccd.port, 3663);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn bad_gpib_address_is_rejected() {
        let path = write_config("badaddr", "[lockin]\nmodel = \"srs830\"\ngpib_address = 31\n");
        assert!(load_config(Some(&path)).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let path = Path::new("/nonexistent/labctl.toml");
        assert!(load_config_or_default(Some(path)).is_err());
    }
}
