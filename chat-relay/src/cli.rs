use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::config::{Framing, OverflowPolicy, QueueConfig, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting TCP connections.
    Serve(ServeArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub listen: String,

    /// Per-client delivery queue depth; 0 means unbounded.
    #[arg(long, default_value_t = crate::config::DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// What to do when a client's delivery queue is full.
    #[arg(long, value_enum, default_value_t = OverflowPolicy::Disconnect)]
    pub overflow: OverflowPolicy,

    /// How inbound bytes are split into messages.
    #[arg(long, value_enum, default_value_t = Framing::Lines)]
    pub framing: Framing,

    /// Longest inbound line in bytes before it is split into several messages.
    #[arg(long, default_value_t = crate::config::DEFAULT_MAX_LINE)]
    pub max_line: usize,

    /// Enable the `rename|<name>` and `who` commands.
    #[arg(long)]
    pub commands: bool,
}

impl ServeArgs {
    pub fn config(&self) -> RelayConfig {
        let queue = match self.queue_capacity {
            0 => QueueConfig {
                capacity: None,
                overflow: self.overflow,
            },
            capacity => QueueConfig::bounded(capacity, self.overflow),
        };
        RelayConfig::default()
            .with_queue(queue)
            .with_framing(self.framing)
            .with_commands(self.commands)
            .with_max_line(self.max_line)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub server: SocketAddr,
}
