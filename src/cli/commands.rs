//! CLI command definitions

use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "ksbus")]
#[command(about = "Publish, subscribe and request on a ksbus message bus", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Bus server address
    #[arg(long, env = "KSBUS_ADDRESS", default_value = "localhost:9313", global = true)]
    pub address: String,

    /// Client identity (random if not specified)
    #[arg(long, env = "KSBUS_ID", global = true)]
    pub id: Option<String>,

    /// Server path of the bus endpoint
    #[arg(long, env = "KSBUS_PATH", default_value = ksbus_client::DEFAULT_PATH, global = true)]
    pub path: String,

    /// Connect with wss
    #[arg(long, env = "KSBUS_SECURE", global = true)]
    pub secure: bool,

    /// Reconnect when the connection drops
    #[arg(long, global = true)]
    pub auto_restart: bool,

    /// Delay between reconnection attempts, in seconds
    #[arg(long, default_value_t = 5, global = true)]
    pub restart_every: u64,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print messages published on one or more topics
    ///
    /// Each message is printed as one JSON line.
    ///
    /// Examples:
    ///   ksbus listen greet
    ///   ksbus listen jobs alerts --count 10
    Listen {
        /// Topic(s) to subscribe to
        #[arg(required = true)]
        topics: Vec<String>,

        /// Exit after this many messages
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Publish a payload to a topic
    ///
    /// Payloads that are not valid JSON are sent as a JSON string.
    ///
    /// Examples:
    ///   ksbus publish greet '{"msg":"hi"}'
    ///   ksbus publish greet hello
    Publish {
        /// Topic to publish to
        topic: String,

        /// JSON payload
        #[arg(value_parser = parse_payload)]
        payload: Value,
    },

    /// Send a payload to one client identity
    Send {
        /// Target client identity
        id: String,

        /// JSON payload
        #[arg(value_parser = parse_payload)]
        payload: Value,
    },

    /// Publish to a topic and print the first reply
    Request {
        /// Topic to publish to
        topic: String,

        /// JSON payload
        #[arg(value_parser = parse_payload)]
        payload: Value,

        /// How long to wait for the reply, in milliseconds
        #[arg(long, default_value_t = 500)]
        timeout_ms: u64,
    },

    /// Send to one client identity and print the first reply
    RequestId {
        /// Target client identity
        id: String,

        /// JSON payload
        #[arg(value_parser = parse_payload)]
        payload: Value,

        /// How long to wait for the reply, in milliseconds
        #[arg(long, default_value_t = 500)]
        timeout_ms: u64,
    },
}

fn parse_payload(s: &str) -> Result<Value, String> {
    Ok(serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string())))
}
