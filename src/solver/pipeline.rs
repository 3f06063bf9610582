//! One `/solve` request from admission to public answer.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::answer::{AnswerService, ModelEndpoint, REJECTION, ServiceError};
use super::classify::QuestionClassifier;
use super::normalize::{ImageSource, InputNormalizer, Question, TextExtractor};
use super::post::{AnswerPost, preview};
use super::rate_limit::{Quota, RateLimiter};

pub const WORKING: &str = "Working...";
pub const NO_QUESTION: &str = REJECTION;
pub const IMAGE_FAILED: &str = "Failed to process the image. Please try again with a clearer image.";
pub const GENERIC_ERROR: &str = "An error occurred while processing your request.";
pub const POSTED: &str = "✅ Answer posted!";

/// What the pipeline needs from the chat platform, scoped to one interaction.
pub trait ChatSurface {
    /// Handle for editing a private message after it was sent.
    type Receipt: Send + Sync;

    fn is_privileged(&self) -> impl Future<Output = bool> + Send;

    /// Send a message only the caller can see.
    fn reply_private(&self, text: &str) -> impl Future<Output = Result<Self::Receipt, String>> + Send;

    fn edit_private(
        &self,
        receipt: &Self::Receipt,
        text: &str,
    ) -> impl Future<Output = Result<(), String>> + Send;

    /// Post in the originating chat for everyone to see.
    fn publish(&self, post: &AnswerPost) -> impl Future<Output = Result<(), String>> + Send;
}

#[derive(Debug, Clone)]
pub struct SolveRequest {
    pub chat_id: i64,
    pub user_id: u64,
    /// Display name of the caller, shown on the public post.
    pub requester: String,
    pub question: Question,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub allowed_chat_id: i64,
    /// How the allowed chat is referred to in the wrong-channel message.
    pub channel_label: String,
    pub bot_name: String,
    pub preview_max_chars: usize,
}

/// Which way a request left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    WrongChannel,
    RateLimited,
    UnsupportedFormat,
    NoQuestion,
    ImageFailed,
    /// The model replied with the rejection sentence.
    Rejected,
    Failed,
    Posted { quota: Quota },
}

#[derive(Debug)]
enum PipelineError {
    Service(ServiceError),
    Publish(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service(e) => write!(f, "{e}"),
            Self::Publish(e) => write!(f, "failed to publish answer: {e}"),
        }
    }
}

impl From<ServiceError> for PipelineError {
    fn from(e: ServiceError) -> Self {
        PipelineError::Service(e)
    }
}

/// Final private reply for a request.
struct Reply {
    outcome: Outcome,
    message: String,
}

impl Reply {
    fn new(outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
        }
    }
}

pub struct Pipeline<S, X, M> {
    config: PipelineConfig,
    limiter: Arc<RateLimiter>,
    normalizer: InputNormalizer<S, X>,
    classifier: QuestionClassifier,
    answers: AnswerService<M>,
}

impl<S, X, M> Pipeline<S, X, M>
where
    S: ImageSource + Sync,
    X: TextExtractor + Sync,
    M: ModelEndpoint + Sync,
{
    pub fn new(
        config: PipelineConfig,
        limiter: Arc<RateLimiter>,
        normalizer: InputNormalizer<S, X>,
        answers: AnswerService<M>,
    ) -> Self {
        Self {
            config,
            limiter,
            normalizer,
            classifier: QuestionClassifier::new(),
            answers,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Run one request to completion. Never fails: every path ends in a private reply.
    pub async fn handle<C: ChatSurface + Sync>(&self, surface: &C, request: SolveRequest) -> Outcome {
        if request.chat_id != self.config.allowed_chat_id {
            let text = format!(
                "Please use {} for automated question solving",
                self.config.channel_label
            );
            send_private(surface, &text).await;
            return Outcome::WrongChannel;
        }

        let privileged = surface.is_privileged().await;
        let decision = self.limiter.check(request.user_id, privileged).await;
        if !decision.allowed {
            info!("Rate limited {} ({})", request.requester, request.user_id);
            let text = format!(
                "You have reached your rate limit of {} requests per {}. Please try again later.",
                self.limiter.max_requests(),
                window_label(self.limiter.window())
            );
            send_private(surface, &text).await;
            return Outcome::RateLimited;
        }
        info!(
            "Admitted {} ({}), remaining quota {}",
            request.requester,
            request.user_id,
            decision.quota.as_i64()
        );

        let receipt = match surface.reply_private(WORKING).await {
            Ok(receipt) => Some(receipt),
            Err(e) => {
                warn!("Failed to acknowledge {}: {e}", request.requester);
                None
            }
        };

        let reply = match self.solve(surface, &request, decision.quota).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(
                    "Unexpected error handling /solve from {} ({}): {e}",
                    request.requester, request.user_id
                );
                Reply::new(Outcome::Failed, GENERIC_ERROR)
            }
        };

        finish(surface, receipt.as_ref(), &reply.message).await;
        if let Outcome::Posted { .. } = reply.outcome {
            info!("Successfully processed request from {}", request.requester);
        }
        reply.outcome
    }

    async fn solve<C: ChatSurface + Sync>(
        &self,
        surface: &C,
        request: &SolveRequest,
        quota: Quota,
    ) -> Result<Reply, PipelineError> {
        let question = &request.question;

        if let Some(image) = question.image()
            && let Err(unsupported) = self.normalizer.validate_image(image)
        {
            return Ok(Reply::new(Outcome::UnsupportedFormat, unsupported.to_string()));
        }

        let input = match self.normalizer.normalize(question).await {
            Ok(input) => input,
            Err(e) => {
                warn!("Image processing error: {e}");
                return Ok(Reply::new(Outcome::ImageFailed, IMAGE_FAILED));
            }
        };

        if input.is_empty() {
            return Ok(Reply::new(Outcome::NoQuestion, NO_QUESTION));
        }

        // Images skip the local gate; the model decides whether they hold a question.
        if question.image().is_none() && !self.classifier.looks_like_math(&input.text) {
            return Ok(Reply::new(Outcome::NoQuestion, NO_QUESTION));
        }

        let answer = self.answers.answer(&input.text, input.image.as_ref()).await?;
        if answer.is_rejection() {
            info!("Model rejected input from {}", request.requester);
            return Ok(Reply::new(Outcome::Rejected, NO_QUESTION));
        }

        let post = AnswerPost {
            bot_name: self.config.bot_name.clone(),
            requester: request.requester.clone(),
            answer: answer.text,
            prompt_preview: preview(&input.text, self.config.preview_max_chars),
            source: question.source(),
            timestamp: chrono::Utc::now().format("%Y-%m-%d %H:%M UTC").to_string(),
        };
        surface.publish(&post).await.map_err(PipelineError::Publish)?;

        let message = match quota {
            Quota::Unlimited => POSTED.to_string(),
            Quota::Remaining(n) => format!(
                "{POSTED}\n\nYou have {n} requests remaining {}.",
                remaining_label(self.limiter.window())
            ),
        };
        Ok(Reply::new(Outcome::Posted { quota }, message))
    }
}

/// Best effort: failures are logged and dropped.
async fn send_private<C: ChatSurface>(surface: &C, text: &str) {
    if let Err(e) = surface.reply_private(text).await {
        warn!("Failed to send private reply: {e}");
    }
}

/// Replace the acknowledgment with the final message, or send it fresh.
async fn finish<C: ChatSurface>(surface: &C, receipt: Option<&C::Receipt>, text: &str) {
    if let Some(receipt) = receipt {
        match surface.edit_private(receipt, text).await {
            Ok(()) => return,
            Err(e) => warn!("Failed to edit acknowledgment: {e}"),
        }
    }
    send_private(surface, text).await;
}

/// "hour", "day", "minute", or a count like "30 minutes".
pub fn window_label(window: Duration) -> String {
    let secs = window.as_secs();
    match secs {
        60 => "minute".to_string(),
        3600 => "hour".to_string(),
        86400 => "day".to_string(),
        s if s % 3600 == 0 => format!("{} hours", s / 3600),
        s if s % 60 == 0 => format!("{} minutes", s / 60),
        s => format!("{s} seconds"),
    }
}

fn remaining_label(window: Duration) -> String {
    match window.as_secs() {
        60 | 3600 | 86400 => format!("this {}", window_label(window)),
        _ => format!("in the current {} window", window_label(window)),
    }
}
