//! NTRIP caster configuration objects

use std::time::Duration;

/// NTRIP (Networked Transport of RTCM via Internet Protocol) caster configuration
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CasterConfig {
    /// Host name or IP address to bind the listener to
    #[cfg_attr(
        feature = "clap",
        clap(long = "host", env = "NTRIP_CASTER_HOST", default_value = "0.0.0.0")
    )]
    pub host: String,

    /// Port number to bind the listener to
    #[cfg_attr(
        feature = "clap",
        clap(long = "port", env = "NTRIP_CASTER_PORT", default_value_t = 2101)
    )]
    pub port: u16,

    /// Maximum size, in bytes, of any single handshake or payload read
    #[cfg_attr(
        feature = "clap",
        clap(long = "read-buffer-size", default_value_t = 65536)
    )]
    pub read_buffer_size: usize,

    /// Capacity of each subscriber's fan-out channel; a full channel causes
    /// the forwarder to drop the current slice for that subscriber rather
    /// than block
    #[cfg_attr(
        feature = "clap",
        clap(long = "subscriber-channel-capacity", default_value_t = 64)
    )]
    pub subscriber_channel_capacity: usize,

    /// Listener `listen()` backlog
    #[cfg_attr(feature = "clap", clap(long = "backlog", default_value_t = 5))]
    pub backlog: u32,

    /// Server agent string advertised in the source table `Server:` header
    #[cfg_attr(
        feature = "clap",
        clap(long = "agent", default_value = "NTRIP ntrip-caster/0.1.0")
    )]
    pub agent: String,
}

impl CasterConfig {
    /// Generate a bind address ("host:port") from the CasterConfig
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// TCP keepalive: idle time before probing starts
    pub fn keepalive_idle(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// TCP keepalive: interval between probes
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// TCP keepalive: number of unanswered probes before the connection is
    /// considered dead
    pub fn keepalive_retries(&self) -> u32 {
        3
    }
}

impl Default for CasterConfig {
    fn default() -> Self {
        CasterConfig {
            host: "0.0.0.0".to_string(),
            port: 2101,
            read_buffer_size: 65536,
            subscriber_channel_capacity: 64,
            backlog: 5,
            agent: "NTRIP ntrip-caster/0.1.0".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_addr() {
        let cfg = CasterConfig {
            host: "127.0.0.1".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.bind_addr(), "127.0.0.1:2101");
    }
}
