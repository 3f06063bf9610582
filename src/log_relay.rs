//! Mirrors log events into a Telegram chat for operators.
//!
//! WARN and ERROR go out right away. INFO lines are batched and flushed
//! every few seconds, or sooner when the batch fills up.

use std::fmt::Write as _;
use std::time::Duration;

use teloxide::prelude::*;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

const FLUSH_EVERY: Duration = Duration::from_secs(5);
const MAX_BATCH: usize = 50;
/// Telegram rejects messages over 4096 characters.
const MAX_MESSAGE_CHARS: usize = 4000;

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Urgent(String),
    Routine(String),
}

pub struct LogRelayLayer {
    tx: mpsc::UnboundedSender<Line>,
}

impl LogRelayLayer {
    /// Must be called from within a tokio runtime.
    pub fn new(bot: Bot, chat_id: ChatId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(relay(bot, chat_id, rx));
        Self { tx }
    }
}

async fn relay(bot: Bot, chat_id: ChatId, mut rx: mpsc::UnboundedReceiver<Line>) {
    let mut batch: Vec<String> = Vec::new();
    let mut ticker = tokio::time::interval(FLUSH_EVERY);

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(Line::Urgent(text)) => {
                    // Keep ordering: anything already batched goes first.
                    flush(&bot, chat_id, &mut batch).await;
                    send(&bot, chat_id, &text).await;
                }
                Some(Line::Routine(text)) => {
                    batch.push(text);
                    if batch.len() >= MAX_BATCH {
                        flush(&bot, chat_id, &mut batch).await;
                    }
                }
                None => {
                    flush(&bot, chat_id, &mut batch).await;
                    break;
                }
            },
            _ = ticker.tick() => flush(&bot, chat_id, &mut batch).await,
        }
    }
}

async fn flush(bot: &Bot, chat_id: ChatId, batch: &mut Vec<String>) {
    if batch.is_empty() {
        return;
    }
    let combined = batch.join("\n");
    batch.clear();
    send(bot, chat_id, &combined).await;
}

async fn send(bot: &Bot, chat_id: ChatId, text: &str) {
    let text = clip(text, MAX_MESSAGE_CHARS);
    if let Err(e) = bot.send_message(chat_id, text).await {
        // Not through tracing, that would feed back into this layer.
        eprintln!("Failed to relay log to Telegram: {e}");
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}...")
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    extras: String,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.extras, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.extras, " {}={:?}", field.name(), value);
        }
    }
}

fn classify(level: Level, text: String) -> Option<Line> {
    match level {
        Level::ERROR => Some(Line::Urgent(format!("❌ {text}"))),
        Level::WARN => Some(Line::Urgent(format!("⚠️ {text}"))),
        Level::INFO => Some(Line::Routine(text)),
        _ => None,
    }
}

impl<S: Subscriber> Layer<S> for LogRelayLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // HTTP client internals would echo every relayed message.
        if metadata.target().starts_with("reqwest") || metadata.target().starts_with("hyper") {
            return;
        }

        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        if let Some(line) = classify(*metadata.level(), fields.message + &fields.extras)
            && self.tx.send(line).is_err()
        {
            eprintln!("Log channel closed, message dropped");
        }
    }
}
