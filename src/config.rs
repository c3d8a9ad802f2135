//! Client configuration.
//!
//! A [`Configuration`] is assembled with [`Configuration::builder`] and validated once by
//! [`ConfigurationBuilder::build`]; the rest of the crate only reads it.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use tether::Configuration;
//!
//! let config = Configuration::builder()
//!     .host("127.0.0.1")
//!     .port(9103)
//!     .heartbeat(Duration::from_secs(10))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.port(), 9103);
//! ```
use std::time::Duration;

use thiserror::Error;

use crate::connection::{DEFAULT_HEARTBEAT_INTERVAL, writer::DEFAULT_WRITER_CAPACITY};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RECONNECT_INITIAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no host configured")]
    MissingHost,
    #[error("port must be non-zero")]
    InvalidPort,
    #[error("'{0}' must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone)]
pub struct Configuration {
    host: String,
    port: u16,
    heartbeat: Duration,
    request_timeout: Option<Duration>,
    connect_timeout: Duration,
    writer_capacity: usize,
    reconnect_initial: Duration,
    reconnect_max: Duration,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Interval between heartbeat packets.
    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    /// Timeout applied to requests issued through [`Client`](crate::Client). `None`
    /// disables request timeouts.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Packets the writer buffers before callers block.
    pub fn writer_capacity(&self) -> usize {
        self.writer_capacity
    }

    pub fn reconnect_initial(&self) -> Duration {
        self.reconnect_initial
    }

    pub fn reconnect_max(&self) -> Duration {
        self.reconnect_max
    }
}

#[derive(Debug, Clone)]
pub struct ConfigurationBuilder {
    host: Option<String>,
    port: u16,
    heartbeat: Duration,
    request_timeout: Option<Duration>,
    connect_timeout: Duration,
    writer_capacity: usize,
    reconnect_initial: Duration,
    reconnect_max: Duration,
}

impl Default for ConfigurationBuilder {
    fn default() -> Self {
        Self {
            host: None,
            port: 0,
            heartbeat: DEFAULT_HEARTBEAT_INTERVAL,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            writer_capacity: DEFAULT_WRITER_CAPACITY,
            reconnect_initial: DEFAULT_RECONNECT_INITIAL,
            reconnect_max: DEFAULT_RECONNECT_MAX,
        }
    }
}

impl ConfigurationBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn writer_capacity(mut self, capacity: usize) -> Self {
        self.writer_capacity = capacity;
        self
    }

    pub fn reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial = initial;
        self.reconnect_max = max;
        self
    }

    pub fn build(self) -> Result<Configuration, ConfigError> {
        let host = match self.host {
            Some(host) if !host.trim().is_empty() => host,
            _ => return Err(ConfigError::MissingHost),
        };
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.heartbeat.is_zero() {
            return Err(ConfigError::Zero("heartbeat"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Zero("connect_timeout"));
        }
        if self.writer_capacity == 0 {
            return Err(ConfigError::Zero("writer_capacity"));
        }

        Ok(Configuration {
            host,
            port: self.port,
            heartbeat: self.heartbeat,
            request_timeout: self.request_timeout,
            connect_timeout: self.connect_timeout,
            writer_capacity: self.writer_capacity,
            reconnect_initial: self.reconnect_initial,
            reconnect_max: self.reconnect_max.max(self.reconnect_initial),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let config = Configuration::builder()
            .host("localhost")
            .port(9000)
            .build()
            .unwrap();

        assert_eq!(config.heartbeat(), DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(config.writer_capacity(), DEFAULT_WRITER_CAPACITY);
        assert_eq!(config.request_timeout(), Some(DEFAULT_REQUEST_TIMEOUT));
    }

    #[test]
    fn host_and_port_are_required() {
        assert_eq!(
            Configuration::builder().port(1).build().unwrap_err(),
            ConfigError::MissingHost
        );
        assert_eq!(
            Configuration::builder().host("h").build().unwrap_err(),
            ConfigError::InvalidPort
        );
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = Configuration::builder()
            .host("h")
            .port(1)
            .writer_capacity(0)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::Zero("writer_capacity"));
    }

    #[test]
    fn backoff_max_never_below_initial() {
        let config = Configuration::builder()
            .host("h")
            .port(1)
            .reconnect_backoff(Duration::from_secs(5), Duration::from_secs(1))
            .build()
            .unwrap();
        assert_eq!(config.reconnect_max(), Duration::from_secs(5));
    }
}
