use anyhow::Result;
use clap::Parser;
use tracing::warn;

use chat_relay::{
    broker::{Broker, BrokerConfig},
    cli::{Cli, Command},
    client,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Broker(args) => {
            // The broker's reactor runs on at least four worker threads.
            let workers = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .max(4);
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(workers)
                .enable_all()
                .build()?;
            runtime.block_on(async {
                let config = BrokerConfig {
                    bind_ip: args.bind_ip,
                    text_port: args.text_port,
                    file_port: args.file_port,
                    max_history: args.max_history,
                    max_frame_bytes: args.max_frame_bytes,
                };
                let broker = Broker::bind(&config).await?;
                if let Err(err) = broker.run_until_ctrl_c().await {
                    warn!("broker exited with error: {err:?}");
                    return Err(err);
                }
                Ok(())
            })
        }
        Command::Client(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()?;
            runtime.block_on(client::run(args))
        }
    }
}
