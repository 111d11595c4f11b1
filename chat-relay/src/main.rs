use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use chat_relay::{
    cli::{Cli, Command},
    client,
    dispatcher::Dispatcher,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let listener = TcpListener::bind(args.listen)
                .await
                .with_context(|| format!("failed to bind {}", args.listen))?;
            let dispatcher = Dispatcher::new(listener, args.server_config())?;
            let addr = dispatcher.local_addr()?;
            info!("chat relay listening on {}", addr);
            if let Err(err) = dispatcher.run_until_ctrl_c().await {
                warn!("chat relay exited with error: {err:?}");
                return Err(err);
            }
            info!("chat relay stopped");
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
