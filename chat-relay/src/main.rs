use anyhow::Result;
use clap::Parser;
use tracing::warn;

use chat_relay::{
    cli::{Cli, Command},
    client, relay,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            if let Err(err) = relay::serve_until(&args.listen, args.config(), relay::ctrl_c()).await
            {
                warn!("relay exited with error: {err:?}");
                return Err(err.into());
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
