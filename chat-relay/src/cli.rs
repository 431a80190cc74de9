use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::{ClientConfig, DeliveryPolicy, ReconnectPolicy, RelayConfig, WireFormat};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting WebSocket connections and fanning messages out.
    Relay(RelayArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Whether senders also receive their own messages.
    #[arg(long, value_enum, default_value_t = DeliveryPolicy::ExcludeOriginator)]
    pub policy: DeliveryPolicy,

    /// Format of relayed messages.
    #[arg(long, value_enum, default_value_t = WireFormat::Structured)]
    pub wire_format: WireFormat,

    /// Messages queued per client before it is dropped as too slow.
    #[arg(long, default_value_t = 64)]
    pub outbound_buffer: usize,

    /// Maximum time a single write to a client may take, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub send_timeout_ms: u64,
}

impl From<RelayArgs> for RelayConfig {
    fn from(args: RelayArgs) -> Self {
        Self {
            policy: args.policy,
            wire_format: args.wire_format,
            outbound_buffer: args.outbound_buffer,
            send_timeout: Duration::from_millis(args.send_timeout_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name shown to other participants.
    #[arg(long)]
    pub name: Option<String>,

    /// Relay address, e.g. ws://127.0.0.1:8080.
    #[arg(long)]
    pub server: Option<String>,

    /// Automatic reconnection attempts after the connection drops.
    #[arg(long, default_value_t = 5)]
    pub max_retries: u32,

    /// Backoff unit in milliseconds; attempt n waits 2^n units.
    #[arg(long, default_value_t = 1000)]
    pub backoff_base_ms: u64,

    /// Give up on a single handshake after this many milliseconds.
    #[arg(long, default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    /// Format of outgoing messages.
    #[arg(long, value_enum, default_value_t = WireFormat::Delimited)]
    pub wire_format: WireFormat,
}

impl From<ClientArgs> for ClientConfig {
    fn from(args: ClientArgs) -> Self {
        Self {
            identity: args.name.unwrap_or_default(),
            target: args.server.unwrap_or_default(),
            reconnect: ReconnectPolicy {
                max_attempts: args.max_retries,
                base_delay: Duration::from_millis(args.backoff_base_ms),
            },
            connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            wire_format: args.wire_format,
        }
    }
}
