use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::enums::{Interpolation, Processor, SortBy, WindowLevelPolicy};
use crate::render::DEFAULT_MAX_VIEWPORT;
use crate::scene::SceneConfig;

/// Serve ray-cast renderings of a DICOM series to remote viewers.
#[derive(Clone, Debug, Parser)]
#[command(name = "dicom-volume-viewer")]
#[command(version)]
pub struct Config {
    /// Address to bind.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Lower the default log level to debug.
    #[arg(long, env = "DEBUG")]
    pub debug: bool,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Also write logs to this file.
    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[arg(long, env = "PROCESSOR", value_enum, default_value_t = Processor::GPU)]
    pub processor: Processor,

    #[arg(long, env = "VIEW_WIDTH", default_value_t = 1024)]
    pub width: u32,

    #[arg(long, env = "VIEW_HEIGHT", default_value_t = 1024)]
    pub height: u32,

    /// Sampling between voxel centers.
    #[arg(long, env = "INTERPOLATION", value_enum, default_value_t = Interpolation::Linear)]
    pub interpolation: Interpolation,

    /// Slice ordering inside a series.
    #[arg(long, env = "SORT_BY", value_enum, default_value_t = SortBy::ImagePositionPatient)]
    pub sort_by: SortBy,

    /// Keep a custom colormap when the window/level changes.
    #[arg(long, env = "KEEP_COLORMAP")]
    pub keep_colormap_on_window_level: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address {0}")]
    Address(String),

    #[error("window size must be between 1 and {max}, got {0}x{1}", max = DEFAULT_MAX_VIEWPORT)]
    WindowSize(u32, u32),

    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("tracing has already been initialised")]
    AlreadyInitialised,
}

impl Config {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ConfigError::Address(format!("{}:{}", self.host, self.port)))
    }

    pub fn window_level_policy(&self) -> WindowLevelPolicy {
        if self.keep_colormap_on_window_level {
            WindowLevelPolicy::KeepCustomColormap
        } else {
            WindowLevelPolicy::RebuildBoth
        }
    }

    pub fn scene_config(&self) -> Result<SceneConfig, ConfigError> {
        let valid = 1..=DEFAULT_MAX_VIEWPORT;
        if !valid.contains(&self.width) || !valid.contains(&self.height) {
            return Err(ConfigError::WindowSize(self.width, self.height));
        }
        Ok(SceneConfig {
            width: self.width,
            height: self.height,
            interpolation: self.interpolation,
            window_level_policy: self.window_level_policy(),
            ..SceneConfig::default()
        })
    }

    fn default_directive(&self) -> &str {
        if self.debug { "debug" } else { &self.log_level }
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level. Keep the returned guard alive so file output is flushed.
pub fn init_logging(config: &Config) -> Result<Option<WorkerGuard>, ConfigError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.default_directive())?,
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| ConfigError::LogFile {
                    path: path.clone(),
                    source,
                })?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| ConfigError::AlreadyInitialised)?;

    Ok(guard)
}
