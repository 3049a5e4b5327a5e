//! `Hearth`: line-mode chat client.
//!
//! Connects to a relay, shows the conversation timeline and keeps it in
//! sync: sends appear immediately, failures stay visible until retried or
//! dropped, and server changes are merged in as they arrive.
//!
//! ```bash
//! cargo run --bin hearth -- --relay-url ws://127.0.0.1:9000/ws \
//!     --sender-id alice --display-name Alice --conversation general
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use hearth::chat::drafts::DraftStore;
use hearth::chat::{Author, ChatSession};
use hearth::cli::{self, Command, CommandError};
use hearth::config::{CliArgs, ClientConfig};
use hearth::optimistic::RetryRoute;
use hearth::realtime::RealtimeClient;
use hearth_proto::message::ConversationId;

type Session = ChatSession<RealtimeClient, RealtimeClient>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let Some(relay_url) = config.relay_url.clone() else {
        eprintln!("No relay configured; pass --relay-url or set HEARTH_RELAY_URL");
        return ExitCode::FAILURE;
    };

    tracing::info!(relay = %relay_url, conversation = %config.conversation, "hearth starting");

    let (client, mut feed) = match RealtimeClient::connect(&relay_url, config.realtime_options()).await {
        Ok(connected) => connected,
        Err(e) => {
            eprintln!("Failed to connect to {relay_url}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let conversation_id = ConversationId::new(config.conversation.clone());
    if let Err(e) = client.subscribe(&conversation_id).await {
        eprintln!("Failed to subscribe to {conversation_id}: {e}");
        return ExitCode::FAILURE;
    }

    let drafts = open_drafts(config.drafts_dir.as_deref(), conversation_id);
    let author = config.author().unwrap_or_else(default_author);
    let mut session = ChatSession::new(
        author,
        client.clone(),
        client,
        drafts,
        config.session_options(),
    );

    if let Err(e) = session.load_latest().await {
        eprintln!("Failed to load history: {e}");
    }
    session.restore_drafts();
    render(&mut session, &config.timestamp_format);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_line(&mut session, &line).await {
                        break;
                    }
                    render(&mut session, &config.timestamp_format);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "failed to read stdin");
                    break;
                }
            },
            change = feed.next_change() => {
                let Some(change) = change else {
                    eprintln!("Connection to relay closed");
                    break;
                };
                session.apply_change(change);
                render(&mut session, &config.timestamp_format);
            }
        }
    }

    tracing::info!(pending = session.optimistic().len(), "hearth exiting");
    ExitCode::SUCCESS
}

/// Initialize file-based logging.
///
/// Logs go to a file so they never interleave with the timeline on stdout.
/// Returns a [`WorkerGuard`] that must be held until shutdown to flush
/// buffered entries.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("hearth.log");
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

fn open_drafts(dir: Option<&Path>, conversation_id: ConversationId) -> DraftStore {
    let Some(dir) = dir else {
        return DraftStore::in_memory(conversation_id);
    };
    match DraftStore::open(dir, conversation_id.clone()) {
        Ok(store) => store,
        Err(e) => {
            tracing::warn!(error = %e, "could not open draft store, drafts will not persist");
            DraftStore::in_memory(conversation_id)
        }
    }
}

fn default_author() -> Author {
    let name = std::env::var("USER").unwrap_or_else(|_| "anonymous".to_string());
    Author::new(name)
}

/// Runs one input line. Returns `false` when the client should exit.
async fn handle_line(session: &mut Session, line: &str) -> bool {
    let command = match Command::parse(line) {
        Ok(command) => command,
        Err(CommandError::Empty) => return true,
        Err(e) => {
            eprintln!("{e}");
            return true;
        }
    };

    match command {
        Command::Send(text) => {
            if let Err(e) = session.send_text(&text, None).await {
                eprintln!("Not sent: {e}");
            }
        }
        Command::Retry(key) => {
            if session.retry(&key).await == RetryRoute::Unhandled {
                eprintln!("Nothing to retry for {key}");
            }
        }
        Command::Drop(key) => {
            if !session.discard(&key) {
                eprintln!("No pending message {key}");
            }
        }
        Command::Older => match session.load_older().await {
            Ok(0) => eprintln!("No older messages"),
            Ok(_) => {}
            Err(e) => eprintln!("Failed to load history: {e}"),
        },
        Command::Edit { id, content } => {
            let conversation_id = session.conversation_id().clone();
            if let Err(e) = session.source().edit(&conversation_id, &id, &content).await {
                eprintln!("Edit failed: {e}");
            }
        }
        Command::Delete(id) => {
            let conversation_id = session.conversation_id().clone();
            if let Err(e) = session.source().delete(&conversation_id, &id).await {
                eprintln!("Delete failed: {e}");
            }
        }
        Command::Quit => return false,
    }
    true
}

fn render(session: &mut Session, timestamp_format: &str) {
    let rendered = cli::render_timeline(session.timeline(), timestamp_format);
    println!("\n{rendered}");
}
