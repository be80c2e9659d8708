//! CLI for nt4
//!
//! Subcommands:
//! - `server`: run an NT4 server until Ctrl-C
//! - `watch`: connect as a client and log every topic and value change

use clap::{Parser, Subcommand};
use tracing::{error, info};

use nt4::broker::Server;
use nt4::broker::engine::lock;
use nt4::client::{Client, ClientEvent};
use nt4::config::{ClientSettings, ServerSettings, load_config};
use nt4::persistence::Persistence;
use nt4::transport::start_websocket_server;
use nt4::utils::logging;

#[derive(Parser)]
#[command(name = "nt4", version, about = "NetworkTables 4 server and client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the NT4 server
    Server {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Directory of the sled database holding persistent topics
        #[arg(long)]
        persist: Option<String>,
    },
    /// Connect to a server and log announcements and values
    Watch {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Client name sent in the connection path
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            return;
        }
    };
    logging::init(&config.log.level);

    let res = match cli.command {
        Command::Server {
            host,
            port,
            persist,
        } => {
            let settings = ServerSettings {
                host: host.unwrap_or(config.server.host),
                port: port.unwrap_or(config.server.port),
                persistence_path: persist.or(config.server.persistence_path),
            };
            run_server(settings).await
        }
        Command::Watch { host, port, name } => {
            let settings = ClientSettings {
                host: host.unwrap_or(config.client.host),
                port: port.unwrap_or(config.client.port),
                name: name.or(config.client.name),
                reconnect_delay_ms: config.client.reconnect_delay_ms,
            };
            run_watch(settings).await
        }
    };

    if let Err(e) = res {
        error!("{e}");
    }
}

async fn run_server(settings: ServerSettings) -> nt4::Result<()> {
    let addr = format!("{}:{}", settings.host, settings.port);
    let server = match &settings.persistence_path {
        Some(path) => Server::new_with_persistence(Persistence::open(path)?),
        None => Server::new(),
    };
    let server = server.into_shared();

    tokio::select! {
        res = start_websocket_server(addr, server.clone()) => {
            res?;
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    // sled only flushes on an interval
    lock(&server).flush()?;
    info!("Persistent topics flushed");

    Ok(())
}

async fn run_watch(settings: ClientSettings) -> nt4::Result<()> {
    let client = Client::new(&settings);
    let mut events = client.events();
    client.start();
    info!(url = client.url(), "Watching");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(e) => error!("Event stream: {e}"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received. Exiting gracefully.");
                break;
            }
        }
    }

    client.disconnect();
    Ok(())
}

fn log_event(event: &ClientEvent) {
    match event {
        ClientEvent::Connected => info!("Connected"),
        ClientEvent::Disconnected => info!("Disconnected"),
        ClientEvent::Announced {
            name, id, type_str, ..
        } => info!(topic = %name, id, type_str = %type_str, "Announced"),
        ClientEvent::Unannounced { name, id } => info!(topic = %name, id, "Unannounced"),
        ClientEvent::PropertiesChanged { name, update } => {
            info!(topic = %name, update = %serde_json::Value::Object(update.clone()), "Properties changed")
        }
        ClientEvent::ValueChanged {
            name,
            value,
            timestamp,
        } => info!(topic = %name, timestamp, "{value:?}"),
    }
}
