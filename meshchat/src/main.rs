//! `MeshChat`: scripted chat session against a simulated peer.
//!
//! Creates a local profile, adds the configured peer as a contact, sends
//! each `--message` and waits for every delivery lifecycle to finish, then
//! prints the transcript and the conversation list. Configuration via CLI
//! flags, environment variables, or config file
//! (`~/.config/meshchat/config.toml`).
//!
//! ```bash
//! cargo run --bin meshchat -- -m hello -m "how are you?"
//!
//! # Machine-readable output
//! MESHCHAT_USER=alice cargo run --bin meshchat -- --json
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use meshchat_proto::contact::NewContact;
use meshchat_proto::message::Message;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use meshchat::clock::SystemClock;
use meshchat::config::{CliArgs, ClientConfig};
use meshchat::delivery::DeliveryEvent;
use meshchat::ids::{IdGenerator, RandomIds};
use meshchat::session::{ConversationSummary, Session, SessionError};
use meshchat::store::InMemoryStore;

/// Errors that end a run.
#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything printed at the end of a run.
#[derive(Debug, Serialize)]
struct Transcript {
    messages: Vec<Message>,
    conversations: Vec<ConversationSummary>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // CLI args > env > config file > defaults.
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("meshchat starting");

    let messages = if cli.messages.is_empty() {
        vec!["hello".to_string()]
    } else {
        cli.messages.clone()
    };

    let result = run(&config, &messages, cli.json).await;
    let code = match result {
        Ok(transcript) => match print_transcript(&transcript, &config, cli.json) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    };

    tracing::info!("meshchat exiting");
    code
}

/// Initialize logging.
///
/// Logs go to `file_path` when given and to stderr otherwise, so stdout
/// carries only the transcript. Returns a [`WorkerGuard`] that must be held
/// until shutdown to flush buffered entries.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some(log_path) = file_path else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .init();
        return None;
    };

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Runs the scripted session and collects its results.
async fn run(
    config: &ClientConfig,
    messages: &[String],
    json: bool,
) -> Result<Transcript, RunError> {
    let ids: Arc<dyn IdGenerator> = Arc::new(RandomIds);
    let store = Arc::new(InMemoryStore::with_ids(Arc::clone(&ids)));
    let (session, events) = Session::new(
        store,
        ids,
        Arc::new(SystemClock),
        &config.session_config(),
    );
    let event_log = tokio::spawn(log_events(events, !json));

    let profile = session
        .create_profile(
            &config.username,
            config.display_name.as_deref(),
            config.fingerprint.clone(),
        )
        .await?;
    tracing::info!(username = %profile.username, fingerprint = %profile.fingerprint, "signed in");

    let peer = session
        .add_contact(NewContact {
            username: config.peer.username.clone(),
            display_name: config.peer.display_name.clone(),
            fingerprint: config.peer.fingerprint.clone(),
            avatar_url: None,
        })
        .await?;
    let chat = session.open_chat(&peer.id).await?;
    let poller = chat.spawn_poller(config.poll_interval);

    for text in messages {
        match chat.send_and_track(text).await {
            Ok(message) => tracing::debug!(message_id = %message.id, "sent"),
            Err(SessionError::Validation(e)) => {
                tracing::warn!(error = %e, "skipping message");
            }
            Err(e) => return Err(e.into()),
        }
    }

    while session.engine().in_flight() > 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if let Err(e) = chat.refresh().await {
        tracing::warn!(error = %e, "final refresh failed");
    }

    poller.abort();
    session.shutdown();
    let conversations = session.conversations(None).await?;
    event_log.abort();

    Ok(Transcript {
        messages: chat.snapshot().to_vec(),
        conversations,
    })
}

/// Reports delivery events until the channel closes or the task is aborted.
///
/// With `echo` set, each event is also printed to stdout as it happens.
async fn log_events(mut events: mpsc::Receiver<DeliveryEvent>, echo: bool) {
    while let Some(event) = events.recv().await {
        match event {
            DeliveryEvent::StatusChanged {
                message_id, status, ..
            } => {
                tracing::info!(%message_id, %status, "status changed");
                if echo {
                    println!("  {} {message_id} {status}", status.symbol());
                }
            }
            DeliveryEvent::ReplyReceived { reply, .. } => {
                tracing::info!(message_id = %reply.id, from = %reply.from, "reply received");
                if echo {
                    println!("  <- {}: {}", reply.from, reply.text);
                }
            }
        }
    }
}

fn print_transcript(
    transcript: &Transcript,
    config: &ClientConfig,
    json: bool,
) -> Result<(), RunError> {
    if json {
        println!("{}", serde_json::to_string_pretty(transcript)?);
        return Ok(());
    }

    println!();
    for message in &transcript.messages {
        let sender = if message.from.is_me() {
            config.username.as_str()
        } else {
            config.peer.display_name.as_str()
        };
        println!(
            "[{}] {sender}: {} {}",
            format_timestamp_ms(message.timestamp.as_millis(), &config.timestamp_format),
            message.text,
            message.status.symbol(),
        );
    }

    println!();
    for summary in &transcript.conversations {
        let name = summary
            .contact
            .as_ref()
            .map_or("(deleted contact)", |c| c.display_name.as_str());
        let last = summary
            .conversation
            .last_message_text
            .as_deref()
            .unwrap_or("");
        println!("{name}: {last}");
    }
    Ok(())
}

fn format_timestamp_ms(ms: u64, format: &str) -> String {
    use chrono::{Local, TimeZone};
    let secs = i64::try_from(ms / 1000).unwrap_or(i64::MAX);
    let nsecs = u32::try_from((ms % 1000) * 1_000_000).unwrap_or(0);
    match Local.timestamp_opt(secs, nsecs) {
        chrono::LocalResult::Single(dt) => dt.format(format).to_string(),
        _ => "??:??".to_string(),
    }
}
