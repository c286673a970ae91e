//! Conversation Bot Demo
//!
//! A signup flow built on [`ConversationHandler`]: `/start` asks for a name,
//! then an age, and stores both in chat data. `/cancel` leaves the flow at
//! any point and the conversation times out after five idle minutes.
//!
//! The demo has no Bot API client, so replies are written to the log.
//!
//! # Usage
//!
//! ```bash
//! # Long polling with the token from courier.toml or COURIER_BOT__TOKEN
//! cargo run --package conversation-bot
//!
//! # Webhook server as configured in [webhook]
//! cargo run --package conversation-bot -- --webhook
//!
//! # One update JSON object per line on stdin
//! cargo run --package conversation-bot -- --stdin < updates.jsonl
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use courier::core::UpdateQueue;
use courier::prelude::*;
use courier::runtime::ConfigLoader;
use courier::runtime::config::PersistenceBackend;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

const NAME: &str = "NAME";
const AGE: &str = "AGE";

#[derive(Debug, Parser)]
#[command(about = "Signup conversation demo")]
struct Cli {
    /// Config file to load instead of searching the current directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Receive updates through the webhook server.
    #[arg(long, conflicts_with = "stdin")]
    webhook: bool,

    /// Read updates from stdin, one JSON object per line.
    #[arg(long)]
    stdin: bool,
}

// ============================================================================
// Handler Functions
// ============================================================================

fn reply(chat: &Chat, text: &str) {
    info!(chat_id = chat.id, "> {text}");
}

async fn ask_name(chat: Chat) -> &'static str {
    reply(&chat, "Hi! What is your name?");
    NAME
}

async fn save_name(message: Message, data: ChatData) -> Result<&'static str> {
    let name = message.text.unwrap_or_default();
    data.set("name", name.trim())?;
    reply(&message.chat, &format!("Nice to meet you, {}. How old are you?", name.trim()));
    Ok(AGE)
}

async fn save_age(message: Message, data: ChatData) -> Result<Outcome> {
    let age: u32 = message.text.as_deref().unwrap_or_default().trim().parse()?;
    data.set("age", age)?;

    let name: String = data.get("name").unwrap_or_default();
    reply(&message.chat, &format!("Signed up {name}, age {age}."));
    Ok(Outcome::end())
}

async fn bad_age(chat: Chat) {
    reply(&chat, "Please send your age as a number.");
}

async fn cancel(chat: Chat, data: ChatData) -> Outcome {
    data.clear();
    reply(&chat, "Signup cancelled.");
    Outcome::end()
}

async fn timed_out(chat: Chat) {
    reply(&chat, "Signup timed out, send /start to try again.");
}

async fn whoami(chat: Chat, data: ChatData) {
    match (data.get::<String>("name"), data.get::<u32>("age")) {
        (Some(name), Some(age)) => reply(&chat, &format!("You are {name}, age {age}.")),
        _ => reply(&chat, "I don't know you yet, send /start."),
    }
}

async fn log_failure(update: std::sync::Arc<Update>, Failure(err): Failure) {
    error!(update_id = update.update_id, "Handler failed: {err:#}");
}

/// The flow survives restarts when a persistence backend is configured.
fn signup(persistent: bool) -> Result<ConversationHandler> {
    let numeric = filters::regex(r"^\s*\d{1,3}\s*$")?;

    let conversation = ConversationHandler::builder()
        .name("signup")
        .persistent(persistent)
        .entry(on_command("start").handler(ask_name))
        .state(
            NAME,
            [on_message(filters::text() & !filters::command()).handler(save_name)],
        )
        .state(
            AGE,
            [
                on_message(numeric).handler(save_age),
                on_message(filters::text() & !filters::command()).handler(bad_age),
            ],
        )
        .fallback(on_command("cancel").handler(cancel))
        .on_timeout(on_message(filters::any()).handler(timed_out))
        .timeout(Duration::from_secs(300))
        .build()?;
    Ok(conversation)
}

// ============================================================================
// Update Sources
// ============================================================================

/// Pushes stdin lines into `queue` until EOF, then drops it to end the run.
async fn feed_stdin(queue: UpdateQueue) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Update>(&line) {
            Ok(update) => {
                if queue.enqueue(update).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!("Skipping line that is not an update: {err}"),
        }
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut loader = ConfigLoader::new().with_current_dir();
    if let Some(path) = &args.config {
        loader = loader.file(path);
    }
    let config = loader.load().context("failed to load configuration")?;
    let app = Application::from_config(&config)?;

    let persistent = config.persistence.backend != PersistenceBackend::None;
    app.add_handler(signup(persistent)?, 0)?;
    app.add_handler(on_command("whoami").handler(whoami), 1)?;
    app.add_error_handler(ErrorHandler::new(log_failure));

    if args.stdin {
        let (queue, source) = update_queue(64);
        let feeder = tokio::spawn(feed_stdin(queue));
        app.run(source).await?;
        feeder.await??;
    } else if args.webhook {
        app.run_webhook().await?;
    } else {
        app.run_polling().await?;
    }

    info!("Bot stopped");
    Ok(())
}
