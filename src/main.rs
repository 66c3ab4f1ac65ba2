//! tagwire demo
//!
//! A small chat server and client on top of the tagwire library.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tagwire::config::{self, Config};
use tagwire::network::ClientError;
use tagwire::protocol::{bincode_encode, TagRegistry, DEFAULT_PORT};
use tagwire::{Client, Message, NetworkConfig, Server, TransportKind};

const CHAT_MESSAGE_ID: u32 = 0;
const SHUTDOWN_MESSAGE_ID: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ChatMessage {
    text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ShutdownMessage {
    text: String,
}

#[derive(Debug, Clone, PartialEq)]
enum DemoPayload {
    Chat(ChatMessage),
    Shutdown(ShutdownMessage),
}

fn demo_codec() -> TagRegistry<DemoPayload> {
    TagRegistry::new(|payload: &DemoPayload| match payload {
        DemoPayload::Chat(chat) => bincode_encode(chat),
        DemoPayload::Shutdown(shutdown) => bincode_encode(shutdown),
    })
    .register_bincode(CHAT_MESSAGE_ID, DemoPayload::Chat)
    .register_bincode(SHUTDOWN_MESSAGE_ID, DemoPayload::Shutdown)
}

/// tagwire - tag-framed message server
#[derive(Parser)]
#[command(name = "tagwire")]
#[command(author = "Tagwire Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Tag-framed message server and chat demo", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat server
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Transport to listen on (overrides the config file)
        #[arg(short, long, value_enum)]
        transport: Option<TransportKind>,
    },

    /// Send one message to a server and print the replies
    Chat {
        /// Server address
        #[arg(short, long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
        server: String,

        /// Transport to use
        #[arg(short, long, value_enum, default_value_t = TransportKind::Stream)]
        transport: TransportKind,

        /// Text to send
        #[arg(long, default_value = "Hi!")]
        text: String,

        /// Ask the server to shut down instead of chatting
        #[arg(long)]
        shutdown: bool,

        /// How long to wait for replies (seconds)
        #[arg(short, long, default_value_t = 2)]
        wait: u64,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { port, transport } => {
            let mut server_config = config.server.clone();
            if let Some(port) = port {
                server_config.port = port;
            }
            if let Some(transport) = transport {
                server_config.transport = transport;
            }
            run_server(NetworkConfig::try_from(&server_config)?).await?;
        }
        Commands::Chat {
            server,
            transport,
            text,
            shutdown,
            wait,
        } => {
            run_chat(&server, transport, text, shutdown, Duration::from_secs(wait)).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Run the chat server until a client asks it to stop or Ctrl+C
async fn run_server(net_config: NetworkConfig) -> anyhow::Result<()> {
    let server = Server::bind(&net_config, demo_codec()).await?;
    let mut channels = server.start().await?;

    println!("tagwire chat server on {} ({})", server.local_addr(), server.transport());
    println!("Press Ctrl+C to stop.\n");

    loop {
        tokio::select! {
            Some(addr) = channels.new_connections.recv() => {
                tracing::info!(%addr, "Client connected");
                let greeting = DemoPayload::Chat(ChatMessage {
                    text: "Hello there!".to_string(),
                });
                channels.outbound.send(Message::new(addr, CHAT_MESSAGE_ID, greeting)).await?;
            }
            Some(addr) = channels.closed_connections.recv() => {
                tracing::info!(%addr, "Client disconnected");
            }
            Some(msg) = channels.inbound.recv() => {
                tracing::debug!(address = %msg.address(), msg_id = msg.msg_id(), "Message received");
                match msg.payload() {
                    DemoPayload::Chat(chat) => {
                        println!("{}: {}", msg.address(), chat.text);
                    }
                    DemoPayload::Shutdown(shutdown) => {
                        tracing::info!(address = %msg.address(), reason = %shutdown.text, "Shutdown requested");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.shutdown().await?;
    tracing::info!("Server stopped");

    Ok(())
}

/// Send a single chat or shutdown message and print what comes back
async fn run_chat(
    server: &str,
    transport: TransportKind,
    text: String,
    shutdown: bool,
    wait: Duration,
) -> anyhow::Result<()> {
    let server_addr = resolve(server).await?;
    let mut client = Client::connect(transport, server_addr, demo_codec()).await?;

    let (tag, payload) = if shutdown {
        (SHUTDOWN_MESSAGE_ID, DemoPayload::Shutdown(ShutdownMessage { text }))
    } else {
        (CHAT_MESSAGE_ID, DemoPayload::Chat(ChatMessage { text }))
    };
    client.send(tag, &payload).await?;

    loop {
        match client.recv_timeout(wait).await {
            Ok(Some(frame)) => match frame.payload {
                DemoPayload::Chat(chat) => println!("server: {}", chat.text),
                DemoPayload::Shutdown(shutdown) => println!("server is shutting down: {}", shutdown.text),
            },
            Ok(None) => {
                println!("Server closed the connection");
                break;
            }
            Err(ClientError::Timeout) => break,
            Err(e) => return Err(e.into()),
        }
    }

    client.close().await?;
    Ok(())
}

/// Resolve `host:port` to a socket address
async fn resolve(server: &str) -> anyhow::Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host(server).await?;
    addrs
        .next()
        .ok_or_else(|| anyhow::anyhow!("Could not resolve host: {}", server))
}
