//! `devconnect`: terminal client for `DevConnect` one-to-one chat.
//!
//! Opens a chat session with one peer, prints the timeline as it changes,
//! and sends every line typed on stdin. Configuration via CLI flags,
//! environment variables, or config file (`~/.config/devconnect/config.toml`).
//!
//! ```bash
//! # Chat with bob through a local development relay
//! cargo run --bin devconnect -- --api-url http://127.0.0.1:7000 \
//!     --token alice --user-id alice --first-name Alice --peer bob
//!
//! # List conversations
//! DEVCONNECT_TOKEN=alice cargo run --bin devconnect -- --list
//! ```
//!
//! Commands: `/reload` reloads history, `/retry` resends failed messages,
//! `/reconnect` retries a failed connection, `/quit` exits.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use devconnect::chat::history::HttpHistoryLoader;
use devconnect::chat::message::{DeliveryState, Message};
use devconnect::chat::{ChatSession, SessionEvent, SessionFailure, SessionState};
use devconnect::config::{CliArgs, ClientConfig};
use devconnect::transport::hybrid::HybridConnector;
use devconnect::transport::polling::PollingConnector;
use devconnect::transport::websocket::WebSocketConnector;
use devconnect_proto::message::MessageId;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Logs go to a file; stdout belongs to the chat view.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(api = %config.api_url, "devconnect starting");

    let result = if cli.list {
        list_chats(&config).await
    } else {
        run_chat(&config).await
    };

    match result {
        Ok(()) => {
            tracing::info!("devconnect exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(err = %e, "devconnect failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown so buffered
/// log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("devconnect.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

fn history_loader(config: &ClientConfig) -> Result<HttpHistoryLoader, BoxError> {
    Ok(HttpHistoryLoader::new(&config.api_url)?
        .with_auth_token(config.auth_token.clone())
        .with_request_timeout(config.request_timeout))
}

async fn list_chats(config: &ClientConfig) -> Result<(), BoxError> {
    let chats = history_loader(config)?.list_conversations().await?;
    if chats.is_empty() {
        println!("No conversations yet.");
    }
    for chat in chats {
        let (id, name) = chat.other_user.as_ref().map_or_else(
            || ("?".to_string(), String::new()),
            |u| {
                let name = [u.first_name.as_deref(), u.last_name.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" ");
                (u.id.to_string(), name)
            },
        );
        let preview = chat.last_message.map(|m| m.text).unwrap_or_default();
        println!("{id:<26} {name:<24} {preview}");
    }
    Ok(())
}

async fn run_chat(config: &ClientConfig) -> Result<(), BoxError> {
    let local = config.local_participant()?;
    let peer = config.peer_id()?;

    let connector = HybridConnector::new(
        WebSocketConnector::new(config.websocket_url())
            .with_auth_token(config.auth_token.clone())
            .with_connect_timeout(config.connect_timeout),
        PollingConnector::new(&config.api_url, &config.poll_path)?
            .with_auth_token(config.auth_token.clone())
            .with_request_timeout(config.request_timeout)
            .with_poll_timeout(config.poll_timeout),
    );
    let (session, mut events) = ChatSession::open(
        config.to_session_config(),
        local,
        peer.clone(),
        history_loader(config)?,
        connector,
    );

    println!("Chatting with {peer}. Commands: /reload /retry /reconnect /quit");
    let mut view = TimelineView::new(&config.timestamp_format);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/reload" => {
                        if let Err(e) = session.reload_history().await {
                            println!("! history reload failed: {e}");
                        }
                    }
                    "/reconnect" => session.reconnect(),
                    "/retry" => {
                        let failed: Vec<MessageId> = session
                            .timeline()
                            .into_iter()
                            .filter(|m| m.delivery_state == DeliveryState::Failed)
                            .map(|m| m.id)
                            .collect();
                        if failed.is_empty() {
                            println!("! nothing to retry");
                        }
                        for id in failed {
                            if let Err(e) = session.retry_failed(&id).await {
                                println!("! retry failed: {e}");
                            }
                        }
                    }
                    text => {
                        if let Err(e) = session.send_message(text).await {
                            println!("! not sent: {e}");
                        }
                    }
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::TimelineUpdated | SessionEvent::DeliveryChanged { .. } => {
                        view.render(&session.timeline());
                    }
                    SessionEvent::MessageConfirmed { local_id, id } => view.rename(&local_id, id),
                    SessionEvent::ConnectionChanged(state) => println!("* {state}"),
                    SessionEvent::HistoryLoaded { count } => {
                        println!("* loaded {count} earlier messages");
                    }
                    SessionEvent::HistoryFailed { reason } => {
                        println!("* could not load history ({reason}); /reload to retry");
                    }
                    SessionEvent::ConnectFailed { reason } => {
                        println!("* could not connect ({reason}); /reconnect to retry");
                    }
                }
            }
        }
    }

    if let SessionState::Failed(SessionFailure::History(reason)) = session.state() {
        tracing::warn!(reason = %reason, "closing with history unavailable");
    }
    session.close();
    Ok(())
}

/// Prints timeline entries the first time they are seen and again when
/// their delivery state changes.
struct TimelineView {
    format: String,
    shown: HashMap<MessageId, DeliveryState>,
}

impl TimelineView {
    fn new(format: &str) -> Self {
        Self {
            format: format.to_string(),
            shown: HashMap::new(),
        }
    }

    fn rename(&mut self, local_id: &MessageId, id: MessageId) {
        if let Some(state) = self.shown.remove(local_id) {
            self.shown.insert(id, state);
        }
    }

    fn render(&mut self, timeline: &[Message]) {
        for message in timeline {
            if self.shown.get(&message.id) == Some(&message.delivery_state) {
                continue;
            }
            println!("{}", self.line(message));
            self.shown.insert(message.id.clone(), message.delivery_state);
        }
    }

    fn line(&self, message: &Message) -> String {
        let mut stamp = String::new();
        if let Some(dt) = message.created_at.to_datetime() {
            let local = dt.with_timezone(&chrono::Local);
            if write!(stamp, "{}", local.format(&self.format)).is_err() {
                stamp = local.format("%H:%M").to_string();
            }
        }
        let marker = match message.delivery_state {
            DeliveryState::Pending => " (sending)",
            DeliveryState::Sent => "",
            DeliveryState::Failed => " (failed, /retry)",
        };
        format!(
            "[{stamp}] {}: {}{marker}",
            message.sender_display_name(),
            message.text
        )
    }
}
