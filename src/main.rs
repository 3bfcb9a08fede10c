use clap::Parser;
use log::{error, info};
use std::path::PathBuf;

use wlrelay::{Config, Relay};

#[derive(Debug, Parser)]
#[command(name = "wlrelay", about = "Relay display-protocol clients to a local compositor")]
struct Args {
    /// Configuration file (default: <config dir>/wlrelay/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, `ip:port` or `unix:/path`
    #[arg(short, long)]
    listen: Option<String>,

    /// Compositor socket name or path
    #[arg(long)]
    compositor: Option<String>,
}

fn load_config(args: &Args) -> std::io::Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(listen) = &args.listen {
        config.listen = listen.clone();
    }
    if let Some(compositor) = &args.compositor {
        config.compositor = Some(compositor.clone());
    }
    Ok(config)
}

async fn task(config: Config) -> std::io::Result<()> {
    let mut relay = Relay::bind(&config).await?;

    // The relay never returns; Ctrl-C drops it so a Unix socket file is
    // removed on the way out.
    tokio::select! {
        _ = relay.run() => Ok(()),
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted, shutting down");
            Ok(())
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            error!("Failed to load configuration: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = task(config).await {
        error!("Failed to start relay: {}", err);
        std::process::exit(1);
    }
}
