use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

mod bus;
mod chat;
mod config;
mod entity;
mod error;
mod interface;
mod normalize;
mod responder;
mod server;
mod store;
mod transport;
mod widget;

/// How long queued end-of-conversation markers get before the process exits.
const BEACON_GRACE: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "parley", version, about = "Lead-capture chat widget and webhook proxy")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    config: config::Config,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP proxy in front of the chat webhook (default)
    Serve,
    /// Chat from the terminal through the proxy
    Chat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before parsing so it can supply flag defaults
    let dotenv = dotenvy::dotenv();

    // Logs go to stderr; stdout belongs to the terminal chat
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dotenv {
        // It's not fatal if .env doesn't exist
        info!("No .env file found or failed to load: {}", e);
    }

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cli.config).await,
        Command::Chat => chat(cli.config).await,
    }
}

async fn serve(config: config::Config) -> anyhow::Result<()> {
    if config.webhook_url.is_none() {
        error!("CHATBOT_WEBHOOK_URL is not set; chat requests will fail with a configuration error");
    }

    let port = config.port;
    let app = server::router(Arc::new(server::ProxyState::new(config)?));

    info!("Starting chat proxy on port {}", port);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                error!("Server stopped with error: {}", e);
            }
        }
    }

    Ok(())
}

async fn chat(config: config::Config) -> anyhow::Result<()> {
    let session = store::open_session_store(config.session_path().as_deref()).await;

    let http = Arc::new(transport::HttpTransport::new(
        config.function_url.clone(),
        config.timeout(),
    ));
    info!("Chatting through {}", http.endpoint());

    let bus = Arc::new(bus::EventBus::new());
    let widget = Arc::new(widget::ChatWidget::new(widget::AppContext {
        config,
        record: store::ConversationRecord::new(session),
        transport: http.clone(),
        bus: bus.clone(),
    }));

    let terminal = interface::terminal::TerminalInterface::new(bus, widget);
    tokio::select! {
        res = terminal.run() => {
            if let Err(e) = res {
                error!("Terminal chat stopped with error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, leaving chat...");
            terminal.leave().await;
        }
    }

    http.flush_beacons(BEACON_GRACE).await;
    Ok(())
}
