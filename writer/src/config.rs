use crate::queue::Kind;
use sluice_utils::{env, NZUsize};
use std::{num::NonZeroUsize, str::FromStr};
use thiserror::Error;

/// Environment variable overriding [Config::max_pending_bytes].
pub const MAX_PENDING_BYTES_VAR: &str = "SLUICE_MAX_PENDING_BYTES";
/// Environment variable overriding [Config::max_write_reentrants].
pub const MAX_WRITE_REENTRANTS_VAR: &str = "SLUICE_MAX_WRITE_REENTRANTS";
/// Environment variable overriding [Config::direct_write].
pub const DIRECT_WRITE_VAR: &str = "SLUICE_DIRECT_WRITE";
/// Environment variable overriding [Config::queue].
pub const WRITE_QUEUE_VAR: &str = "SLUICE_WRITE_QUEUE";
/// Environment variable overriding [Config::record_pool_size].
pub const RECORD_POOL_SIZE_VAR: &str = "SLUICE_RECORD_POOL_SIZE";

/// Error returned when a configuration value cannot be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("expected {expected}, got {value:?}")]
pub struct ParseError {
    value: String,
    expected: &'static str,
}

impl ParseError {
    pub(crate) fn new(value: &str, expected: &'static str) -> Self {
        Self {
            value: value.to_string(),
            expected,
        }
    }
}

/// Maximum number of bytes that may be queued on a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Limit {
    /// Four times the socket's send buffer, or no limit if the socket does not
    /// report one.
    #[default]
    Auto,
    /// No limit.
    Unlimited,
    /// At most this many bytes.
    Bytes(usize),
}

impl Limit {
    /// Resolve the limit for a socket with the given send buffer size.
    ///
    /// Returns `None` when there is no limit.
    pub fn resolve(self, send_buffer_size: Option<usize>) -> Option<usize> {
        match self {
            Self::Auto => send_buffer_size.map(|size| size.saturating_mul(4)),
            Self::Unlimited => None,
            Self::Bytes(bytes) => Some(bytes),
        }
    }
}

impl FromStr for Limit {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "auto" => Ok(Self::Auto),
            "unlimited" => Ok(Self::Unlimited),
            bytes => bytes
                .parse()
                .map(Self::Bytes)
                .map_err(|_| ParseError::new(value, "`auto`, `unlimited` or a byte count")),
        }
    }
}

/// Configuration for an [crate::AsyncQueueWriter].
#[derive(Debug, Clone)]
pub struct Config {
    /// Default limit on the bytes queued per connection. Connections may
    /// override it with [crate::Connection::with_limit].
    pub max_pending_bytes: Limit,

    /// Maximum depth of nested writes issued on one thread (for example by a
    /// completion handler that writes again). Deeper writes are deferred to
    /// the event loop.
    pub max_write_reentrants: usize,

    /// Whether a write against an idle connection is written immediately on
    /// the caller's thread.
    pub direct_write: bool,

    /// Queue implementation used for new connections.
    pub queue: Kind,

    /// Maximum number of idle records kept for reuse.
    pub record_pool_size: NonZeroUsize,

    /// Memory manager configuration for copies of borrowed slices
    /// ([crate::AsyncQueueWriter::write_slice]).
    pub memory: sluice_buffer::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_pending_bytes: Limit::Auto,
            max_write_reentrants: 10,
            direct_write: true,
            queue: Kind::Concurrent,
            record_pool_size: NZUsize!(1024),
            memory: sluice_buffer::Config::default(),
        }
    }
}

impl Config {
    /// Preset for connections served by a single writer thread.
    pub fn single_writer() -> Self {
        Self {
            queue: Kind::Locked,
            ..Self::default()
        }
    }

    /// Read the configuration from the environment, falling back to the
    /// defaults for unset variables.
    pub fn from_env() -> Result<Self, env::Error> {
        let mut config = Self {
            memory: sluice_buffer::Config::from_env()?,
            ..Self::default()
        };
        if let Some(limit) = env::var(MAX_PENDING_BYTES_VAR)? {
            config.max_pending_bytes = limit;
        }
        if let Some(reentrants) = env::var(MAX_WRITE_REENTRANTS_VAR)? {
            config.max_write_reentrants = reentrants;
        }
        if let Some(direct_write) = env::var(DIRECT_WRITE_VAR)? {
            config.direct_write = direct_write;
        }
        if let Some(queue) = env::var(WRITE_QUEUE_VAR)? {
            config.queue = queue;
        }
        if let Some(size) = env::var(RECORD_POOL_SIZE_VAR)? {
            config.record_pool_size = size;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_parse() {
        assert_eq!("auto".parse::<Limit>(), Ok(Limit::Auto));
        assert_eq!("unlimited".parse::<Limit>(), Ok(Limit::Unlimited));
        assert_eq!("4096".parse::<Limit>(), Ok(Limit::Bytes(4096)));
        assert!("lots".parse::<Limit>().is_err());
    }

    #[test]
    fn test_limit_resolve() {
        assert_eq!(Limit::Auto.resolve(Some(1000)), Some(4000));
        assert_eq!(Limit::Auto.resolve(None), None);
        assert_eq!(Limit::Unlimited.resolve(Some(1000)), None);
        assert_eq!(Limit::Bytes(10).resolve(Some(1000)), Some(10));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_pending_bytes, Limit::Auto);
        assert_eq!(config.max_write_reentrants, 10);
        assert!(config.direct_write);
        assert_eq!(config.queue, Kind::Concurrent);
        assert_eq!(config.record_pool_size.get(), 1024);
        assert_eq!(Config::single_writer().queue, Kind::Locked);
    }

    #[test]
    fn test_from_env() {
        std::env::set_var(MAX_PENDING_BYTES_VAR, "65536");
        std::env::set_var(MAX_WRITE_REENTRANTS_VAR, "4");
        std::env::set_var(DIRECT_WRITE_VAR, "false");
        std::env::set_var(WRITE_QUEUE_VAR, "locked");
        std::env::set_var(RECORD_POOL_SIZE_VAR, "16");
        let config = Config::from_env().unwrap();
        for var in [
            MAX_PENDING_BYTES_VAR,
            MAX_WRITE_REENTRANTS_VAR,
            DIRECT_WRITE_VAR,
            WRITE_QUEUE_VAR,
            RECORD_POOL_SIZE_VAR,
        ] {
            std::env::remove_var(var);
        }

        assert_eq!(config.max_pending_bytes, Limit::Bytes(65536));
        assert_eq!(config.max_write_reentrants, 4);
        assert!(!config.direct_write);
        assert_eq!(config.queue, Kind::Locked);
        assert_eq!(config.record_pool_size.get(), 16);
    }

    #[test]
    fn test_from_env_invalid() {
        std::env::set_var("SLUICE_WRITER_TEST_LIMIT", "sometimes");
        let err = env::var::<Limit>("SLUICE_WRITER_TEST_LIMIT").unwrap_err();
        assert!(matches!(err, env::Error::Invalid { .. }));
    }
}
