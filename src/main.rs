//! wire-pair: a length-framed TCP exchange
//!
//! Two subcommands share one configuration:
//! - `listen`: accept connections and answer each message (echo or acknowledge)
//! - `connect`: send one message and print the reply
//!
//! Configuration comes from CLI arguments and an optional TOML file.

use clap::Parser;
use std::error::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wire_pair::config::{CliArgs, Command, Config, ConnectArgs, ListenArgs};
use wire_pair::greeting::{greeting, DEFAULT_MESSAGE};
use wire_pair::provider::{parse_endpoint, AddressProvider, FileAddressProvider};
use wire_pair::{Connector, Listener, Reply};

fn main() -> Result<(), Box<dyn Error>> {
    let cli = CliArgs::parse();

    // Load configuration
    let config = Config::from_args(&cli)?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.endpoint.host,
        port = config.endpoint.port,
        framing = ?config.exchange.framing,
        max_frame_size = config.exchange.max_frame_size,
        "Starting wire-pair"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Command::Listen(args) => runtime.block_on(run_listener(config, args)),
        Command::Connect(args) => runtime.block_on(run_connector(config, args)),
    }
}

/// Serve until interrupted, or for exactly one exchange with `--once`.
async fn run_listener(config: Config, args: ListenArgs) -> Result<(), Box<dyn Error>> {
    let reply = Reply::new(config.listener.reply, &config.listener.ack_text);
    info!(reply = ?config.listener.reply, once = args.once, "Using reply policy");

    let mut listener = Listener::open(config)?;

    let shutdown = listener.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt signal (Ctrl+C)");
            shutdown.cancel();
        }
    });

    if args.once {
        let result = listener.serve_once(&reply).await;
        listener.close();

        let exchange = result?;
        info!(
            peer = %exchange.peer,
            request_bytes = exchange.request.len(),
            reply_bytes = exchange.reply.len(),
            "Exchange complete"
        );
        println!("{}", String::from_utf8_lossy(&exchange.request));
    } else {
        listener.serve(reply).await?;
    }

    Ok(())
}

/// Send one message and print the reply.
async fn run_connector(mut config: Config, args: ConnectArgs) -> Result<(), Box<dyn Error>> {
    if let Some(ref path) = args.address_file {
        let text = FileAddressProvider::for_path(path).address()?;
        let (host, port) = parse_endpoint(&text, config.endpoint.port)?;
        info!(path = %path.display(), host = %host, port, "Loaded server address");
        config.endpoint.host = host;
        config.endpoint.port = port;
    }

    let message = match args.message {
        Some(message) => message,
        None if args.greet => greeting()?,
        None => DEFAULT_MESSAGE.to_string(),
    };

    let mut connector = Connector::from_config(&config);

    let cancel = connector.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt signal (Ctrl+C)");
            cancel.cancel();
        }
    });

    let reply = connector.exchange(message.as_bytes()).await?;
    println!("{}", String::from_utf8_lossy(&reply));

    Ok(())
}
