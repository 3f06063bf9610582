mod config;
mod llm;
mod log_relay;
mod ocr;
mod solver;
mod telegram;

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::command::BotCommands;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;

use config::Config;
use ocr::TesseractOcr;
use solver::{
    AnswerConfig, AnswerService, InputNormalizer, Outcome, Pipeline, PipelineConfig, Question,
    RateLimiter, SolveRequest,
};
use telegram::{Interaction, TelegramImageSource, attached_image, display_name, info_text};

#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
enum Command {
    #[command(description = "solve a maths question from text or an attached image.")]
    Solve(String),
    #[command(description = "how to use the bot and the rate limits.")]
    Info,
    #[command(description = "show this text.")]
    Help,
}

type SolvePipeline = Pipeline<TelegramImageSource, TesseractOcr, llm::Client>;

struct BotState {
    config: Config,
    pipeline: SolvePipeline,
    /// Our own username, so `/solve@this_bot` parses.
    username: String,
}

impl BotState {
    fn new(config: Config, bot: &Bot, limiter: Arc<RateLimiter>, username: String) -> Self {
        let normalizer = InputNormalizer::new(
            TelegramImageSource::new(bot.clone()),
            TesseractOcr::new(config.tesseract_path.clone(), config.ocr_language.clone()),
            config.supported_extensions.clone(),
            config.download_timeout,
        );

        let client = llm::Client::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone(),
            config.model_timeout,
        );
        let answers = AnswerService::new(
            client,
            AnswerConfig {
                text_model: config.text_model.clone(),
                vision_model: config.vision_model.clone(),
                temperature: config.temperature,
                max_tokens: config.max_tokens,
                retry: config.retry,
            },
        );

        let pipeline = Pipeline::new(
            PipelineConfig {
                allowed_chat_id: config.allowed_chat_id.0,
                channel_label: config.channel_label.clone(),
                bot_name: config.bot_name.clone(),
                preview_max_chars: config.preview_max_chars,
            },
            limiter,
            normalizer,
            answers,
        );

        Self {
            config,
            pipeline,
            username,
        }
    }
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "solvebot.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {e}");
            std::process::exit(1);
        }
    };

    let bot = Bot::new(&config.telegram_bot_token);

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("solvebot.log"))
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("ERROR: failed to open log file in {}: {e}", log_dir.display());
            std::process::exit(1);
        }
    };
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    let relay = config
        .log_chat_id
        .map(|chat_id| log_relay::LogRelayLayer::new(bot.clone(), chat_id));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(relay)
        .init();

    info!("🚀 Starting solvebot...");
    info!("Loaded config from {config_path}");
    info!(
        "Answering in chat {} ({} requests per {}s, moderator role {:?})",
        config.allowed_chat_id,
        config.rate_limit_requests,
        config.rate_limit_window.as_secs(),
        config.moderator_role
    );
    info!(
        "Models: {} / {} (vision), up to {} attempts per question",
        config.text_model,
        config.vision_model,
        config.retry.max_attempts()
    );

    let username = match bot.get_me().await {
        Ok(me) => {
            info!("Bot user ID: {}, username: @{}", me.id, me.username());
            me.username().to_string()
        }
        Err(e) => {
            error!("Failed to reach Telegram: {e}");
            std::process::exit(1);
        }
    };

    match bot.set_my_commands(Command::bot_commands()).await {
        Ok(_) => info!("Registered {} command(s)", Command::bot_commands().len()),
        Err(e) => warn!("Failed to register commands: {e}"),
    }

    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_requests,
        config.rate_limit_window,
    ));
    let state = Arc::new(BotState::new(config, &bot, limiter, username));
    if let Some(every) = state.config.sweep_interval {
        spawn_sweeper(state.pipeline.limiter().clone(), every);
    }

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

/// Periodically forget users whose requests have all aged out.
fn spawn_sweeper(limiter: Arc<RateLimiter>, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = limiter.sweep().await;
            if removed > 0 {
                debug!(
                    "Swept {removed} idle user(s) from the rate limiter, {} still tracked",
                    limiter.tracked_users().await
                );
            }
        }
    });
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    // Photos carry the command in their caption.
    let Some(text) = msg.text().or(msg.caption()) else {
        return Ok(());
    };
    let Ok(command) = Command::parse(text, &state.username) else {
        return Ok(());
    };
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };

    match command {
        Command::Solve(question) => {
            let requester = display_name(user);
            let request = SolveRequest {
                chat_id: msg.chat.id.0,
                user_id: user.id.0,
                requester: requester.clone(),
                question: Question::new(Some(question), attached_image(&msg)),
            };
            let source = request.question.source();

            let interaction = Interaction::new(&bot, &state.config, &msg, user.id);
            let outcome = state.pipeline.handle(&interaction, request).await;
            if outcome == Outcome::Failed {
                warn!(
                    "/solve from {requester} ({}) [{}] failed",
                    user.id,
                    source.label()
                );
            } else {
                info!(
                    "/solve from {requester} ({}) [{}] → {outcome:?}",
                    user.id,
                    source.label()
                );
            }
        }
        Command::Info => {
            let config = &state.config;
            let text = info_text(
                &config.bot_name,
                &config.channel_label,
                config.rate_limit_requests,
                config.rate_limit_window,
                &config.moderator_role,
                config.provider_limits.as_ref(),
            );
            bot.send_message(msg.chat.id, text)
                .parse_mode(ParseMode::Html)
                .await?;
        }
        Command::Help => {
            bot.send_message(msg.chat.id, Command::descriptions().to_string())
                .await?;
        }
    }

    Ok(())
}
