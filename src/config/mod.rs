//! Configuration module - environment variable parsing and simulator settings

pub mod settings;

pub use settings::{
    ConfigParseError, ConfigResolver, ConfigValidationError, GuiSettings, SanityLimits,
    SettingsError, SimulatorSettings, WindSettings,
};

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default TCP port for interactive clients
pub const DEFAULT_SIM_PORT: u16 = 30300;

/// Server process configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// TCP binding address for interactive clients
    pub server_addr: SocketAddr,
    /// HTTP binding address for the passive monitor endpoint
    pub http_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Directory holding settings.json, contacts.json, maps/, boats/ and simulations/
    pub data_dir: PathBuf,
    /// Simulation file name (without extension) under `simulations/`
    pub sim_name: String,
    /// Password for the `__admin__` user
    pub admin_code: String,

    /// Allowed origin for monitor CORS ("*" allows any)
    pub monitor_origin: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // PORT wins over SIM_ADDR so hosted deployments can inject it
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SIM_ADDR").unwrap_or_else(|_| format!("0.0.0.0:{}", DEFAULT_SIM_PORT))
        };
        let http_addr = env::var("HTTP_ADDR")
            .unwrap_or_else(|_| format!("0.0.0.0:{}", DEFAULT_SIM_PORT + 1));

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress("SIM_ADDR"))?,
            http_addr: http_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress("HTTP_ADDR"))?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data")),
            sim_name: env::var("SIM_NAME").map_err(|_| ConfigError::Missing("SIM_NAME"))?,
            admin_code: env::var("ADMIN_CODE").map_err(|_| ConfigError::Missing("ADMIN_CODE"))?,

            monitor_origin: env::var("MONITOR_ORIGIN").unwrap_or_else(|_| "*".to_string()),
        })
    }
}

/// Environment configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid socket address in {0}")]
    InvalidAddress(&'static str),
}
