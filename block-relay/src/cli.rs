use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::{
    nonzero, RelayConfig, DEFAULT_AUDIT_INTERVAL_SECS, DEFAULT_DATABASE, DEFAULT_LISTEN,
    DEFAULT_SERVER, DEFAULT_WRITE_TIMEOUT_MS,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, storing and broadcasting every message it receives.
    Serve(ServeArgs),
    /// Connect to a relay and send or retrieve records interactively.
    Client(ClientArgs),
    /// Print every record in a relay database.
    Dump(DumpArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = DEFAULT_LISTEN)]
    pub listen: SocketAddr,

    /// SQLite database holding the record log. Created if missing.
    #[arg(long, default_value = DEFAULT_DATABASE)]
    pub database: PathBuf,

    /// Give up on a peer whose write takes longer than this during a broadcast. 0 waits forever.
    #[arg(long, default_value_t = DEFAULT_WRITE_TIMEOUT_MS)]
    pub write_timeout_ms: u64,

    /// Log the whole record log every N seconds. 0 disables.
    #[arg(long, default_value_t = DEFAULT_AUDIT_INTERVAL_SECS)]
    pub audit_interval_secs: u64,
}

impl From<ServeArgs> for RelayConfig {
    fn from(args: ServeArgs) -> Self {
        let mut config = RelayConfig::new(args.listen, args.database);
        config.write_timeout = nonzero(Duration::from_millis(args.write_timeout_ms));
        config.audit_interval = nonzero(Duration::from_secs(args.audit_interval_secs));
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = DEFAULT_SERVER)]
    pub server: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct DumpArgs {
    #[arg(long, default_value = DEFAULT_DATABASE)]
    pub database: PathBuf,
}
