//! Gateway and broker configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). Every broker timing and capacity has a
//! default, so [`BrokerConfig::default`] is a complete configuration for
//! library users who never touch the environment.

use std::net::SocketAddr;
use std::time::Duration;

/// Default read deadline, renewed on every pong.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Default write deadline for message frames and blocking enqueues.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default wait for room in a full inbound queue before dropping a message.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
/// Default keepalive ping interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(54);
/// Default write deadline for keepalive pings.
pub const DEFAULT_PING_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default per-direction queue capacity of a session.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
/// Default capacity of the broker control input.
pub const DEFAULT_CONTROL_CAPACITY: usize = 256;

/// Timing and capacity settings shared by a broker and all of its sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Read deadline; renewed whenever a pong arrives.
    pub read_timeout: Duration,
    /// Deadline for writing a message frame and for waiting on a full
    /// control input.
    pub write_timeout: Duration,
    /// How long the inbound pump waits for room in a full inbound queue
    /// before dropping the message.
    pub idle_timeout: Duration,
    /// Interval between keepalive pings.
    pub ping_interval: Duration,
    /// Deadline for writing a keepalive ping.
    pub ping_write_timeout: Duration,
    /// Capacity of each session's inbound and outbound queue.
    pub queue_capacity: usize,
    /// Capacity of the broker control input.
    pub control_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_write_timeout: DEFAULT_PING_WRITE_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            control_capacity: DEFAULT_CONTROL_CAPACITY,
        }
    }
}

impl BrokerConfig {
    /// Loads broker settings from `BROKER_*` environment variables.
    ///
    /// Missing or unparsable values fall back to the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting configuration fails
    /// [`BrokerConfig::validate`].
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = Self {
            read_timeout: parse_env_secs("BROKER_READ_TIMEOUT_SECS", DEFAULT_READ_TIMEOUT),
            write_timeout: parse_env_secs("BROKER_WRITE_TIMEOUT_SECS", DEFAULT_WRITE_TIMEOUT),
            idle_timeout: parse_env_secs("BROKER_IDLE_TIMEOUT_SECS", DEFAULT_IDLE_TIMEOUT),
            ping_interval: parse_env_secs("BROKER_PING_INTERVAL_SECS", DEFAULT_PING_INTERVAL),
            ping_write_timeout: parse_env_secs(
                "BROKER_PING_WRITE_TIMEOUT_SECS",
                DEFAULT_PING_WRITE_TIMEOUT,
            ),
            queue_capacity: parse_env("BROKER_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY),
            control_capacity: parse_env("BROKER_CONTROL_CAPACITY", DEFAULT_CONTROL_CAPACITY),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the pumps rely on.
    ///
    /// # Errors
    ///
    /// Returns an error if a capacity is zero, a timeout is zero, or the
    /// ping interval is not shorter than the read timeout (the peer would
    /// time out before the first keepalive).
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.queue_capacity == 0 || self.control_capacity == 0 {
            return Err("queue and control capacities must be greater than zero".into());
        }
        if self.read_timeout.is_zero()
            || self.write_timeout.is_zero()
            || self.idle_timeout.is_zero()
            || self.ping_interval.is_zero()
            || self.ping_write_timeout.is_zero()
        {
            return Err("broker timeouts must be greater than zero".into());
        }
        if self.ping_interval >= self.read_timeout {
            return Err(format!(
                "ping interval ({:?}) must be shorter than read timeout ({:?})",
                self.ping_interval, self.read_timeout
            )
            .into());
        }
        Ok(())
    }
}

/// Top-level gateway configuration.
///
/// Loaded once at startup via [`GatewayConfig::from_env`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Socket address to bind the HTTP server to (e.g. `0.0.0.0:8080`).
    pub listen_addr: SocketAddr,

    /// Broker timings and capacities.
    pub broker: BrokerConfig,
}

impl GatewayConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to sensible defaults when a variable is not set.
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns an error if `LISTEN_ADDR` is set but cannot be parsed as
    /// a [`SocketAddr`], or if the broker settings are invalid.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let listen_addr: SocketAddr = std::env::var("LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()?;

        let broker = BrokerConfig::from_env()?;

        Ok(Self {
            listen_addr,
            broker,
        })
    }
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses an environment variable holding whole seconds.
fn parse_env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}
