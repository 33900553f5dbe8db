//! `ChatLink` — terminal client for the live-conversation engine.
//!
//! Connects to a chat server, loads the selected conversation's history,
//! prints live messages as they arrive, and sends stdin lines as outbound
//! messages. Configuration via CLI flags, environment variables, or a
//! config file (`~/.config/chatlink/config.toml`).
//!
//! ```bash
//! CHATLINK_TOKEN=... chatlink --api-url http://127.0.0.1:8000 \
//!     --ws-url ws://127.0.0.1:8000 42
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use chatlink::auth::StaticCredentials;
use chatlink::config::{CliArgs, ClientConfig};
use chatlink::history::HttpHistoryClient;
use chatlink::store::{ChatStore, ConnectionPhase, Notice, StoreEvent};
use chatlink::transport::WsConnector;
use chatlink_proto::message::OutboundPayload;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    init_logging(&cli.log_level);

    let config = match ClientConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let Some(peer) = cli.peer.clone() else {
        eprintln!("error: no conversation given (pass a remote participant id)");
        return ExitCode::FAILURE;
    };

    let creds = match &cli.token {
        Some(token) => StaticCredentials::with_token(token.clone()),
        None => {
            tracing::warn!("no access token configured; the server will reject us");
            StaticCredentials::new()
        }
    };

    let history = match HttpHistoryClient::new(config.api_base_url.clone(), config.request_timeout)
    {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: could not build HTTP client: {e}");
            return ExitCode::FAILURE;
        }
    };
    let connector = WsConnector::new(config.connect_timeout);

    let (store, mut events) = ChatStore::new(creds, history, connector, config.to_store_config());
    store.select_conversation(&peer);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            line = stdin.next_line() => match line {
                Ok(Some(line)) => send_line(&store, line).await,
                Ok(None) => {
                    // stdin closed: leave the conversation and exit.
                    store.teardown();
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "stdin read failed");
                    store.teardown();
                    break;
                }
            },
        }
    }

    ExitCode::SUCCESS
}

/// Initialize stderr logging so stdout stays clean for the conversation.
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .init();
}

async fn send_line<P, H, C>(store: &Arc<ChatStore<P, H, C>>, line: String)
where
    P: chatlink::auth::CredentialProvider + 'static,
    H: chatlink::history::HistoryApi + 'static,
    C: chatlink::transport::Connector + 'static,
{
    let payload = OutboundPayload {
        text: line,
        image: None,
    };
    if let Err(e) = store.send_outbound(&payload).await {
        eprintln!("send failed: {e}");
    }
}

fn print_event(event: &StoreEvent) {
    match event {
        StoreEvent::SelectionChanged { user } => {
            println!("--- conversation with {user} ---");
        }
        StoreEvent::ConnectionChanged(phase) => match phase {
            ConnectionPhase::Open => println!("--- connected ---"),
            ConnectionPhase::Retrying { attempt } => {
                println!("--- connection lost, retrying (attempt {attempt}) ---");
            }
            ConnectionPhase::Exhausted => println!("--- gave up reconnecting ---"),
            ConnectionPhase::Idle | ConnectionPhase::Connecting => {}
        },
        StoreEvent::HistoryLoaded {
            conversation,
            count,
        } => {
            println!("--- {count} earlier messages with {conversation} ---");
        }
        StoreEvent::MessageMerged(msg) => {
            let body = msg.text.as_deref().unwrap_or("");
            match &msg.image {
                Some(image) => println!("{}: {body} [image: {image}]", msg.sender_id),
                None => println!("{}: {body}", msg.sender_id),
            }
        }
        StoreEvent::Notice(notice) => print_notice(notice),
    }
}

fn print_notice(notice: &Notice) {
    match notice {
        Notice::Unauthenticated => eprintln!("! not authenticated, please log in again"),
        Notice::InvalidResponseFormat => eprintln!("! server sent unusable history"),
        Notice::HistoryUnavailable => eprintln!("! failed to load chat history"),
        Notice::MalformedFrame => eprintln!("! dropped an unreadable message"),
        Notice::TransportClosed { attempt, retry_in } => {
            eprintln!(
                "! disconnected, retry {attempt} in {}s",
                retry_in.as_secs()
            );
        }
        Notice::ReconnectExhausted => eprintln!("! could not reconnect, reselect to try again"),
        Notice::EmptyMessage => eprintln!("! cannot send an empty message"),
        Notice::NotConnected => eprintln!("! not connected"),
        Notice::InvalidSelection => eprintln!("! invalid conversation id"),
    }
}
