//! Asks the hosted model for a final answer.

use std::fmt;
use std::future::Future;

use base64::Engine;
use tracing::info;

use crate::llm::{self, CompletionRequest};

use super::normalize::ImageData;
use super::retry::{Attempt, RetryError, RetryPolicy};

/// The exact reply the model is told to give for anything that isn't a question.
pub const REJECTION: &str = "Please upload a question to solve";

const SYSTEM_PROMPT: &str = "You are a maths question solver. The user will send maths questions \
as text or as screenshots.\n\n\
If the input is not a valid maths question or is empty/irrelevant, \
reply exactly: 'Please upload a question to solve'.\n\n\
If the input is a maths question, produce ONLY the final answer(s) with NO WORKINGS. \
Format the answer exactly as described: start with '# ' at the very beginning, \
then either '# Answer = ' or '# Answers:' followed by newline-separated \
'a = ' lines for multiple values. Do not include any additional text, \
context, or reasoning.";

pub trait ModelEndpoint {
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl Future<Output = Result<String, llm::Error>> + Send;
}

#[derive(Debug, Clone)]
pub struct AnswerConfig {
    pub text_model: String,
    pub vision_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub retry: RetryPolicy,
}

/// The model's trimmed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerResult {
    pub text: String,
}

impl AnswerResult {
    pub fn is_rejection(&self) -> bool {
        self.text == REJECTION
    }
}

#[derive(Debug)]
pub enum ServiceError {
    /// The last attempt timed out.
    Timeout { attempts: u32 },
    /// The last attempt got a non-success status.
    Exhausted { attempts: u32, last: llm::Error },
    /// The last attempt failed in transport or returned a malformed envelope.
    Transport { attempts: u32, last: llm::Error },
    Aborted(llm::Error),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { attempts } => {
                write!(f, "model endpoint timed out ({attempts} attempts)")
            }
            Self::Exhausted { attempts, last } => {
                write!(f, "model endpoint failed after {attempts} attempts: {last}")
            }
            Self::Transport { attempts, last } => {
                write!(f, "model endpoint unreachable after {attempts} attempts: {last}")
            }
            Self::Aborted(e) => write!(f, "model request aborted: {e}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<RetryError<llm::Error>> for ServiceError {
    fn from(e: RetryError<llm::Error>) -> Self {
        match e {
            RetryError::Aborted { error, .. } => ServiceError::Aborted(error),
            RetryError::Exhausted { attempts, last } => match last {
                llm::Error::Timeout => ServiceError::Timeout { attempts },
                llm::Error::Api { .. } => ServiceError::Exhausted { attempts, last },
                _ => ServiceError::Transport { attempts, last },
            },
        }
    }
}

pub struct AnswerService<M> {
    endpoint: M,
    config: AnswerConfig,
}

impl<M: ModelEndpoint> AnswerService<M> {
    pub fn new(endpoint: M, config: AnswerConfig) -> Self {
        Self { endpoint, config }
    }

    pub async fn answer(
        &self,
        question: &str,
        image: Option<&ImageData>,
    ) -> Result<AnswerResult, ServiceError> {
        let request = self.build_request(question, image);
        info!("Querying {}...", request.model);

        let endpoint = &self.endpoint;
        let request = &request;
        let text = self
            .config
            .retry
            .run(move |_| async move {
                match endpoint.complete(request).await {
                    Ok(text) => Attempt::Done(text),
                    Err(e) if e.is_retryable() => Attempt::Retry(e),
                    Err(e) => Attempt::Abort(e),
                }
            })
            .await?;

        Ok(AnswerResult {
            text: text.trim().to_string(),
        })
    }

    fn build_request(&self, question: &str, image: Option<&ImageData>) -> CompletionRequest {
        let user = format!(
            "{question}\n\nReturn only the final answer(s) in the required format; \
             do not output steps."
        );

        let (model, image_url) = match image {
            Some(image) => (&self.config.vision_model, Some(data_url(image))),
            None => (&self.config.text_model, None),
        };

        CompletionRequest {
            model: model.clone(),
            system: SYSTEM_PROMPT.to_string(),
            user,
            image_url,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        }
    }
}

fn data_url(image: &ImageData) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(&image.bytes);
    format!("data:{};base64,{}", image.media_type, encoded)
}
