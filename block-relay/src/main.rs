use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use block_relay::{
    cli::{Cli, Command, DumpArgs},
    client,
    config::RelayConfig,
    server::Server,
    store::RecordStore,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn dump(args: DumpArgs) -> Result<()> {
    if !args.database.exists() {
        bail!("no record store at {}", args.database.display());
    }
    let store = RecordStore::open(&args.database)
        .with_context(|| format!("failed to open record store at {}", args.database.display()))?;
    for record in store.all()? {
        let marker = if record.verify() { "" } else { "\t(hash mismatch)" };
        println!("{}\t{}\t{}{}", record.id, record.hash, record.message, marker);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let config = RelayConfig::from(args);
            let server = Server::bind(&config).await?;
            let addr = server.local_addr()?;
            info!(database = %config.database.display(), "record store ready");
            info!("relay listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("relay exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
        Command::Dump(args) => dump(args)?,
    }

    Ok(())
}
