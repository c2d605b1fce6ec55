use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::args::Args;

mod args;
mod logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logger::init(&args);
    log::info!("Claudish {}", env!("CARGO_PKG_VERSION"));

    let runtime = config::RuntimeConfig::from_env();
    let shutdown = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Shutting down");
                shutdown.cancel();
            }
        });
    }

    let (bound_sender, bound_receiver) = tokio::sync::oneshot::channel();

    let server = tokio::spawn(proxy::serve(proxy::ServeConfig {
        port: args.port,
        runtime,
        options: args.router_options(),
        shutdown,
        bound_addr_sender: Some(bound_sender),
    }));

    if let Ok(address) = bound_receiver.await {
        // The launcher reads this line to learn the ephemeral port.
        println!("CLAUDISH_LISTENING={address}");
    }

    server.await??;

    Ok(())
}
