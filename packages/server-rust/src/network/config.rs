//! Connection pipeline configuration.

use std::time::Duration;

use msgque_core::DEFAULT_MAX_PAYLOAD;

/// Settings shared by every connection of a [`MsgQueModule`](super::module::MsgQueModule).
#[derive(Debug, Clone)]
pub struct MsgQueConfig {
    /// Encrypt every outbound framed payload not already flagged encrypted.
    /// Requires a cipher on the pipeline's payload transform.
    pub auto_encrypt: bool,
    /// Compress outbound framed payloads at least this long. 0 disables.
    pub auto_compress_len: u32,
    /// Largest payload accepted in a frame header.
    pub max_payload_len: u32,
    /// Inactivity timeout used by connections whose own timeout is 0.
    pub default_timeout: Duration,
    /// Bounded capacity of each connection's outbound channel.
    pub outbound_channel_capacity: usize,
    /// Initial read buffer size for stream transports.
    pub read_buffer_size: usize,
    /// Disable Nagle's algorithm on TCP sockets.
    pub tcp_nodelay: bool,
}

impl Default for MsgQueConfig {
    fn default() -> Self {
        Self {
            auto_encrypt: false,
            auto_compress_len: 0,
            max_payload_len: DEFAULT_MAX_PAYLOAD,
            default_timeout: Duration::from_secs(180),
            outbound_channel_capacity: 64,
            read_buffer_size: 4096,
            tcp_nodelay: true,
        }
    }
}

/// Address a listener binds to or a dialer connects to.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub host: String,
    /// Port to use. 0 means OS-assigned when listening.
    pub port: u16,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
        }
    }
}

impl EndpointConfig {
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msgque_config_defaults() {
        let config = MsgQueConfig::default();
        assert!(!config.auto_encrypt);
        assert_eq!(config.auto_compress_len, 0);
        assert_eq!(config.max_payload_len, 1024 * 1024);
        assert_eq!(config.default_timeout, Duration::from_secs(180));
        assert_eq!(config.outbound_channel_capacity, 64);
        assert_eq!(config.read_buffer_size, 4096);
        assert!(config.tcp_nodelay);
    }

    #[test]
    fn endpoint_config_defaults() {
        let config = EndpointConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 0);
        assert_eq!(config.addr(), "0.0.0.0:0");
    }
}
