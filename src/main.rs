use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::Arc;

use callwire::config::ServerConfig;
use callwire::rest::RestClient;
use callwire::store::{ChatStore, UserDirectory};
use callwire::transport::WsChannelFactory;
use callwire::{CallDirectory, EventBus, ParticipantId, SessionContext};

#[derive(Parser, Debug)]
#[command(name = "callwire", about = "Chat and call signaling client")]
struct Cli {
    /// Base URL of the chat server's HTTP API.
    #[arg(long, global = true, env = "CALLWIRE_HTTP")]
    http: Option<String>,

    /// Base URL of the chat server's WebSocket endpoint.
    #[arg(long, global = true, env = "CALLWIRE_WS")]
    ws: Option<String>,

    #[arg(long, global = true, env = "CALLWIRE_TOKEN", default_value = "")]
    token: String,

    /// Our own participant id.
    #[arg(long, global = true, env = "CALLWIRE_USER_ID", default_value_t = 0)]
    user_id: ParticipantId,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List known users.
    Users,
    /// Print the chat history with a peer.
    History { peer: ParticipantId },
    /// Send a chat message to a peer.
    Send { peer: ParticipantId, message: String },
    /// Follow the chat with a peer. Incoming calls are declined.
    Watch { peer: ParticipantId },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let cli = Cli::parse();
    let defaults = ServerConfig::default();
    let server = ServerConfig {
        http_base: cli.http.clone().unwrap_or(defaults.http_base),
        ws_base: cli.ws.clone().unwrap_or(defaults.ws_base),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(run(cli, server))
}

async fn run(cli: Cli, server: ServerConfig) -> Result<()> {
    let rest = Arc::new(RestClient::new(&server.http_base, &cli.token));

    match cli.command {
        Command::Users => {
            for user in rest.users().await? {
                println!("{:>6}  {}", user.id, user.username);
            }
        }
        Command::History { peer } => {
            for message in rest.messages(peer).await? {
                print_message(&message);
            }
        }
        Command::Send { peer, ref message } => {
            let ctx = connect(&cli, &server, peer, rest).await?;
            let saved = ctx.send_chat(message).await?;
            print_message(&saved);
            ctx.detach().await;
        }
        Command::Watch { peer } => watch(connect(&cli, &server, peer, rest).await?).await?,
    }
    Ok(())
}

async fn connect(
    cli: &Cli,
    server: &ServerConfig,
    peer: ParticipantId,
    rest: Arc<RestClient>,
) -> Result<Arc<SessionContext>> {
    let factory = WsChannelFactory::new(&server.ws_base, &cli.token);
    let ctx = SessionContext::builder(cli.user_id, peer)
        .with_directory(Arc::new(CallDirectory::new()))
        .with_events(Arc::new(EventBus::new()))
        .with_chat_store(rest)
        .connect(&factory)
        .await
        .with_context(|| format!("connecting to the chat with {peer}"))?;
    Ok(ctx)
}

async fn watch(ctx: Arc<SessionContext>) -> Result<()> {
    let events = ctx.events();
    let mut chats = events.chat_message.subscribe();
    let mut calls = events.incoming_call.subscribe();
    let mut ended = events.call_ended.subscribe();
    info!("Watching the chat with {} (Ctrl-C to stop)", ctx.remote_id());

    loop {
        tokio::select! {
            Ok(chat) = chats.recv() => print_message(&chat.message),
            Ok(call) = calls.recv() => {
                info!("Incoming {} call from {}, declining", call.media_kind, call.caller_id);
                if let Err(e) = call.call.reject() {
                    warn!("Could not decline call: {e}");
                }
            }
            Ok(end) = ended.recv() => {
                info!("Call with {} ended ({})", end.remote_id, end.reason);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    ctx.detach().await;
    Ok(())
}

fn print_message(message: &callwire::wirecore::ChatMessage) {
    let sender = message
        .sender
        .as_ref()
        .map_or("?", |user| user.username.as_str());
    let at = message.timestamp.as_deref().unwrap_or("");
    println!("[{at}] {sender}: {}", message.content);
}
