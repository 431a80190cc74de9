use std::time::Duration;

use clap::ValueEnum;

/// Whether the sender of a message also receives the relayed copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum DeliveryPolicy {
    /// Peer chat: the sender only sees its own message through local echo.
    #[default]
    ExcludeOriginator,
    /// Moderated rooms: an observer must see everything, including its own traffic.
    IncludeOriginator,
}

impl DeliveryPolicy {
    pub fn includes_originator(self) -> bool {
        matches!(self, DeliveryPolicy::IncludeOriginator)
    }
}

/// Text representation used when an envelope goes out on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum WireFormat {
    /// `{"username": .., "message": ..}`
    #[default]
    Structured,
    /// `name: body`
    Delimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub policy: DeliveryPolicy,
    pub wire_format: WireFormat,
    /// Frames queued per recipient before it is dropped as too slow.
    pub outbound_buffer: usize,
    /// Upper bound on a single socket write.
    pub send_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            policy: DeliveryPolicy::default(),
            wire_format: WireFormat::default(),
            outbound_buffer: 64,
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Retry budget after an unclean close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub identity: String,
    pub target: String,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    /// Outbound format; the client always accepts both on the way in.
    pub wire_format: WireFormat,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            target: String::new(),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            wire_format: WireFormat::Delimited,
        }
    }
}
