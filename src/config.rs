use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address
    pub bind_addr: String,

    /// Port to listen on
    pub port: u16,

    /// Upper bound on concurrent dispatch units per tick
    pub dispatch_threads: usize,

    /// Connections handed to a dispatch worker at a time
    pub dispatch_batch_size: usize,

    /// Initial capacity of the connection table
    pub initial_connections: usize,

    /// Period of the tick loop in milliseconds
    pub tick_interval_ms: u64,

    /// Cap on events drained per connection per tick (None drains everything)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_events_per_tick: Option<usize>,

    /// Largest accepted frame payload in bytes
    pub max_frame_size: usize,

    /// Scratch read buffer size (per read call)
    pub read_buffer_size: usize,

    /// Unwritten output held per connection before `send` reports `WouldBlock`
    pub max_outbound_bytes: usize,

    /// TCP nodelay
    pub tcp_nodelay: bool,

    /// Log level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 9000,
            dispatch_threads: num_cpus::get(),
            dispatch_batch_size: 1,
            initial_connections: 16,
            tick_interval_ms: 16,
            max_events_per_tick: None,
            max_frame_size: 4096,
            read_buffer_size: 8 * 1024, // 8KB
            max_outbound_bytes: 1024 * 1024, // 1MB
            tcp_nodelay: true,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing keys fall back to their defaults.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use tickloop_server::Config;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = Config::from_file("config.toml")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dispatch_threads == 0 {
            anyhow::bail!("dispatch_threads must be > 0");
        }

        if self.dispatch_batch_size == 0 {
            anyhow::bail!("dispatch_batch_size must be > 0");
        }

        if self.tick_interval_ms == 0 {
            anyhow::bail!("tick_interval_ms must be > 0");
        }

        if self.max_events_per_tick == Some(0) {
            anyhow::bail!("max_events_per_tick must be > 0 when set");
        }

        if self.max_frame_size == 0 || self.max_frame_size > u16::MAX as usize {
            anyhow::bail!("max_frame_size must be between 1 and {}", u16::MAX);
        }

        if self.read_buffer_size < 512 {
            anyhow::bail!("read_buffer_size must be >= 512");
        }

        // One maximal frame plus its length prefix must always fit
        if self.max_outbound_bytes < self.max_frame_size + 2 {
            anyhow::bail!(
                "max_outbound_bytes must be >= max_frame_size + 2 ({})",
                self.max_frame_size + 2
            );
        }

        self.socket_addr()?;
        Ok(())
    }

    /// Resolve `bind_addr:port` into a socket address
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.bind_addr, self.port);
        addr.parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address '{}': {}", addr, e))
    }

    /// Tick period as a duration
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 9000);
        assert_eq!(config.initial_connections, 16);
        assert!(config.max_events_per_tick.is_none());
    }

    #[test]
    fn rejects_zero_workers_and_batches() {
        let config = Config {
            dispatch_threads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            dispatch_batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unparseable_bind_address() {
        let config = Config {
            bind_addr: "not an address".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_frames_beyond_length_prefix() {
        let config = Config {
            max_frame_size: 70_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn outbound_bound_must_hold_one_full_frame() {
        let config = Config {
            max_frame_size: 4096,
            max_outbound_bytes: 4097,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_outbound_bytes: 4098,
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_round_trip_keeps_values() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("server.toml");

        let config = Config {
            port: 7777,
            dispatch_threads: 3,
            max_events_per_tick: Some(64),
            ..Default::default()
        };
        config.to_file(&path)?;

        let loaded = Config::from_file(&path)?;
        assert_eq!(loaded.port, 7777);
        assert_eq!(loaded.dispatch_threads, 3);
        assert_eq!(loaded.max_events_per_tick, Some(64));
        Ok(())
    }

    #[test]
    fn partial_file_falls_back_to_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("partial.toml");
        fs::write(&path, "port = 9100\n")?;

        let loaded = Config::from_file(&path)?;
        assert_eq!(loaded.port, 9100);
        assert_eq!(loaded.bind_addr, "0.0.0.0");
        assert_eq!(loaded.tick_interval_ms, 16);
        Ok(())
    }
}
