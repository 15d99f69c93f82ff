//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// Builder for the process-wide tracing subscriber.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    name: Option<&'static str>,
    version: Option<&'static str>,
    logging: LoggingConfig,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    pub fn with_version(mut self, version: &'static str) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_logging(mut self, logging: &LoggingConfig) -> Self {
        self.logging = logging.clone();
        self
    }

    /// Installs the global subscriber. `RUST_LOG` wins over the configured level.
    ///
    /// Registering twice keeps the first subscriber.
    pub fn register(self) -> Self {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.logging.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let result = match self.logging.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_current_span(true)
                .try_init(),
            LogFormat::Plain => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .try_init(),
        };
        if let Err(e) = result {
            eprintln!("tracing subscriber already installed: {e}");
        }

        tracing::info!(
            name = self.name.unwrap_or("unknown"),
            version = self.version.unwrap_or("unknown"),
            format = ?self.logging.format,
            "Telemetry registered"
        );
        self
    }
}
