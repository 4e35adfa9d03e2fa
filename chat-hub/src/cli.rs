use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat hub, relaying lines between TCP clients.
    Serve(ServeArgs),
    /// Connect to a hub and bridge it to this terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the hub should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:31337")]
    pub listen: SocketAddr,

    /// Events buffered between sessions and the hub.
    #[arg(long, default_value_t = crate::config::DEFAULT_EVENT_CAPACITY)]
    pub event_capacity: usize,

    /// Milliseconds a broadcast write may take before the recipient is dropped.
    #[arg(long, default_value_t = 5_000)]
    pub write_timeout_ms: u64,

    /// Longest input chunk, in bytes, treated as a single line.
    #[arg(long, default_value_t = crate::config::DEFAULT_MAX_LINE_BYTES)]
    pub max_line_bytes: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the hub to connect to.
    #[arg(long, default_value = "127.0.0.1:31337")]
    pub server: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults() {
        let cli = Cli::try_parse_from(["chat_hub", "serve"]).expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve command");
        };
        assert_eq!(args.listen, "0.0.0.0:31337".parse::<SocketAddr>().expect("addr"));
        assert_eq!(args.event_capacity, 1024);
        assert_eq!(args.write_timeout_ms, 5_000);
        assert_eq!(args.max_line_bytes, 1024);
    }

    #[test]
    fn client_accepts_server_flag() {
        let cli = Cli::try_parse_from(["chat_hub", "client", "--server", "10.0.0.2:4000"])
            .expect("parse");
        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };
        assert_eq!(args.server, "10.0.0.2:4000".parse::<SocketAddr>().expect("addr"));
    }
}
