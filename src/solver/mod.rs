//! Solver core - admits `/solve` requests and turns them into public answers.
//!
//! Platform, OCR and model access sit behind the traits re-exported here, so
//! everything in this module can be driven without Telegram or the network.

pub mod answer;
pub mod classify;
pub mod normalize;
pub mod pipeline;
pub mod post;
pub mod rate_limit;
pub mod retry;

#[cfg(test)]
mod tests;

pub use answer::{AnswerConfig, AnswerService, ModelEndpoint};
pub use normalize::{DecodeError, FetchError, ImageRef, ImageSource, InputNormalizer, Question, TextExtractor};
pub use pipeline::{ChatSurface, Outcome, Pipeline, PipelineConfig, SolveRequest};
pub use post::AnswerPost;
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
