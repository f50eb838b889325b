use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay broker, accepting text and file channel connections.
    Broker(BrokerArgs),
    /// Connect to a broker and chat or transfer files interactively.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Address both channel listeners bind to.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_ip: IpAddr,

    /// Port of the low-latency text channel.
    #[arg(long, default_value_t = 5555)]
    pub text_port: u16,

    /// Port of the bulk file channel.
    #[arg(long, default_value_t = 5556)]
    pub file_port: u16,

    /// Bound on in-memory history entries (text and file combined).
    #[arg(long, default_value_t = 100)]
    pub max_history: usize,

    /// Reject-limit for a single envelope, in bytes.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    pub max_frame_bytes: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Broker address to connect both channels to.
    #[arg(long, default_value = "127.0.0.1")]
    pub server_ip: IpAddr,

    /// Broker's text channel port.
    #[arg(long, default_value_t = 5555)]
    pub text_port: u16,

    /// Broker's file channel port.
    #[arg(long, default_value_t = 5556)]
    pub file_port: u16,

    /// Directory incoming files are saved into.
    #[arg(long, default_value = "received")]
    pub save_dir: PathBuf,

    /// Reject-limit for a single envelope, in bytes.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    pub max_frame_bytes: u64,
}
