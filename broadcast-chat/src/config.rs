use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, ensure};

use crate::{cli::ServerArgs, protocol::DEFAULT_MAX_LINE_LENGTH};

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Events buffered before submitters wait for the hub worker.
    pub queue_capacity: usize,
    /// Upper bound for a single fan-out write to one recipient.
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub hub: HubConfig,
    pub max_line_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            hub: HubConfig::default(),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.hub.queue_capacity > 0, "queue capacity must be at least 1");
        ensure!(
            !self.hub.write_timeout.is_zero(),
            "write timeout must be at least 1ms"
        );
        ensure!(self.max_line_length > 0, "max line length must be at least 1");
        Ok(())
    }
}

impl TryFrom<ServerArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServerArgs) -> Result<Self> {
        let config = Self {
            listen: args.listen,
            hub: HubConfig {
                queue_capacity: args.queue_capacity,
                write_timeout: Duration::from_millis(args.write_timeout_ms),
            },
            max_line_length: args.max_line_length,
        };
        config.validate()?;
        Ok(config)
    }
}
