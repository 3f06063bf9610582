//! End-to-end tests for the solve pipeline, driven through fake collaborators.
//!
//! Run with: cargo test solver

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::answer::REJECTION;
use super::normalize::SourceTag;
use super::pipeline::{GENERIC_ERROR, IMAGE_FAILED, NO_QUESTION, POSTED, WORKING};
use super::rate_limit::Quota;
use super::*;
use crate::llm::{self, CompletionRequest};

const CHAT: i64 = -100123;
const USER: u64 = 42;

// =============================================================================
// FAKES
// =============================================================================

#[derive(Default)]
struct FakeChat {
    privileged: bool,
    /// Refuse to deliver the "Working..." acknowledgment.
    drop_ack: bool,
    /// Reject every edit, as when the acknowledgment was deleted.
    fail_edit: bool,
    fail_publish: bool,
    private: Mutex<Vec<String>>,
    edits: Mutex<Vec<(usize, String)>>,
    posts: Mutex<Vec<AnswerPost>>,
}

impl FakeChat {
    fn moderator() -> Self {
        Self {
            privileged: true,
            ..Self::default()
        }
    }

    fn private(&self) -> Vec<String> {
        self.private.lock().unwrap().clone()
    }

    fn edits(&self) -> Vec<(usize, String)> {
        self.edits.lock().unwrap().clone()
    }

    fn posts(&self) -> Vec<AnswerPost> {
        self.posts.lock().unwrap().clone()
    }

    /// The message the caller ends up seeing for this request.
    fn final_message(&self) -> String {
        if let Some((_, text)) = self.edits().last() {
            return text.clone();
        }
        self.private().last().cloned().unwrap_or_default()
    }
}

impl ChatSurface for FakeChat {
    type Receipt = usize;

    async fn is_privileged(&self) -> bool {
        self.privileged
    }

    async fn reply_private(&self, text: &str) -> Result<usize, String> {
        if self.drop_ack && text == WORKING {
            return Err("bot was blocked by the user".to_string());
        }
        let mut private = self.private.lock().unwrap();
        private.push(text.to_string());
        Ok(private.len() - 1)
    }

    async fn edit_private(&self, receipt: &usize, text: &str) -> Result<(), String> {
        if self.fail_edit {
            return Err("message to edit not found".to_string());
        }
        self.edits.lock().unwrap().push((*receipt, text.to_string()));
        Ok(())
    }

    async fn publish(&self, post: &AnswerPost) -> Result<(), String> {
        if self.fail_publish {
            return Err("chat not found".to_string());
        }
        self.posts.lock().unwrap().push(post.clone());
        Ok(())
    }
}

struct FakeImages {
    fail: bool,
    calls: Arc<AtomicUsize>,
}

impl ImageSource for FakeImages {
    async fn fetch(&self, _image: &ImageRef) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(FetchError::Download("HTTP 404".to_string()))
        } else {
            Ok(vec![0x89, b'P', b'N', b'G'])
        }
    }
}

struct FakeOcr(String);

impl TextExtractor for FakeOcr {
    async fn extract(&self, _bytes: &[u8]) -> Result<String, DecodeError> {
        Ok(self.0.clone())
    }
}

struct FakeModel {
    replies: Mutex<VecDeque<Result<String, llm::Error>>>,
    seen: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ModelEndpoint for FakeModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, llm::Error> {
        self.seen.lock().unwrap().push(request.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(llm::Error::Empty))
    }
}

struct Harness {
    pipeline: Pipeline<FakeImages, FakeOcr, FakeModel>,
    fetches: Arc<AtomicUsize>,
    model_calls: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl Harness {
    fn model_calls(&self) -> usize {
        self.model_calls.lock().unwrap().len()
    }

    async fn usage(&self) -> u32 {
        self.pipeline.limiter().usage_at(USER, Instant::now()).await
    }
}

struct Setup {
    ocr_text: &'static str,
    fetch_fails: bool,
    replies: Vec<Result<String, llm::Error>>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            ocr_text: "",
            fetch_fails: false,
            replies: vec![Ok("# Answer = 4".to_string())],
        }
    }
}

fn harness(setup: Setup) -> Harness {
    let fetches = Arc::new(AtomicUsize::new(0));
    let model_calls = Arc::new(Mutex::new(Vec::new()));

    let normalizer = InputNormalizer::new(
        FakeImages {
            fail: setup.fetch_fails,
            calls: fetches.clone(),
        },
        FakeOcr(setup.ocr_text.to_string()),
        vec![".png".into(), ".jpg".into(), ".jpeg".into(), ".webp".into()],
        Duration::from_secs(30),
    );
    let answers = AnswerService::new(
        FakeModel {
            replies: Mutex::new(setup.replies.into()),
            seen: model_calls.clone(),
        },
        AnswerConfig {
            text_model: "text-model".into(),
            vision_model: "vision-model".into(),
            temperature: 0.3,
            max_tokens: 500,
            retry: RetryPolicy::new(3, Duration::from_millis(10)),
        },
    );
    let pipeline = Pipeline::new(
        PipelineConfig {
            allowed_chat_id: CHAT,
            channel_label: "#question-ai".into(),
            bot_name: "Solvebot".into(),
            preview_max_chars: 512,
        },
        Arc::new(RateLimiter::new(10, Duration::from_secs(3600))),
        normalizer,
        answers,
    );

    Harness {
        pipeline,
        fetches,
        model_calls,
    }
}

fn text_request(text: &str) -> SolveRequest {
    SolveRequest {
        chat_id: CHAT,
        user_id: USER,
        requester: "alice".into(),
        question: Question::new(Some(text.to_string()), None),
    }
}

fn image_request(text: Option<&str>, file_name: &str) -> SolveRequest {
    SolveRequest {
        chat_id: CHAT,
        user_id: USER,
        requester: "alice".into(),
        question: Question::new(
            text.map(str::to_string),
            Some(ImageRef {
                file_name: file_name.to_string(),
                file_id: "AgACAgQ".to_string(),
            }),
        ),
    }
}

// =============================================================================
// ADMISSION
// =============================================================================

mod admission {
    use super::*;

    #[tokio::test]
    async fn test_wrong_channel_does_not_touch_quota() {
        let h = harness(Setup::default());
        let chat = FakeChat::default();
        let mut request = text_request("2+2");
        request.chat_id = -999;

        let outcome = h.pipeline.handle(&chat, request).await;

        assert_eq!(outcome, Outcome::WrongChannel);
        assert_eq!(
            chat.private(),
            vec!["Please use #question-ai for automated question solving".to_string()]
        );
        assert_eq!(h.usage().await, 0);
        assert_eq!(h.model_calls(), 0);
        assert!(chat.posts().is_empty());
    }

    #[tokio::test]
    async fn test_eleventh_request_is_rate_limited() {
        let replies = (0..10).map(|i| Ok(format!("# Answer = {i}"))).collect();
        let h = harness(Setup {
            replies,
            ..Setup::default()
        });

        for expected in (0..10u32).rev() {
            let chat = FakeChat::default();
            let outcome = h.pipeline.handle(&chat, text_request("1+1")).await;
            assert_eq!(
                outcome,
                Outcome::Posted {
                    quota: Quota::Remaining(expected)
                }
            );
        }

        let chat = FakeChat::default();
        let outcome = h.pipeline.handle(&chat, text_request("1+1")).await;
        assert_eq!(outcome, Outcome::RateLimited);
        assert_eq!(
            chat.private(),
            vec![
                "You have reached your rate limit of 10 requests per hour. Please try again later."
                    .to_string()
            ]
        );
        // No acknowledgment, no model call for the rejected request.
        assert_eq!(h.model_calls(), 10);
    }

    #[tokio::test]
    async fn test_moderator_is_never_limited() {
        let replies = (0..15).map(|_| Ok("# Answer = 1".to_string())).collect();
        let h = harness(Setup {
            replies,
            ..Setup::default()
        });

        for _ in 0..15 {
            let chat = FakeChat::moderator();
            let outcome = h.pipeline.handle(&chat, text_request("0+1")).await;
            assert_eq!(
                outcome,
                Outcome::Posted {
                    quota: Quota::Unlimited
                }
            );
            // No remaining-quota line for moderators.
            assert_eq!(chat.final_message(), POSTED);
        }
        assert_eq!(h.usage().await, 0);
    }
}

// =============================================================================
// CONTENT CHECKS
// =============================================================================

mod content {
    use super::*;

    #[tokio::test]
    async fn test_acknowledges_before_answering() {
        let h = harness(Setup::default());
        let chat = FakeChat::default();

        h.pipeline.handle(&chat, text_request("2+2")).await;

        assert_eq!(chat.private()[0], WORKING);
        // The acknowledgment itself is edited with the result.
        assert_eq!(chat.edits()[0].0, 0);
    }

    #[tokio::test]
    async fn test_empty_question() {
        let h = harness(Setup::default());
        let chat = FakeChat::default();
        let request = SolveRequest {
            question: Question::Empty,
            ..text_request("")
        };

        let outcome = h.pipeline.handle(&chat, request).await;

        assert_eq!(outcome, Outcome::NoQuestion);
        assert_eq!(chat.final_message(), NO_QUESTION);
        assert_eq!(h.model_calls(), 0);
        // Admission already consumed quota.
        assert_eq!(h.usage().await, 1);
    }

    #[tokio::test]
    async fn test_non_math_text_is_rejected_locally() {
        let h = harness(Setup::default());
        let chat = FakeChat::default();

        let outcome = h.pipeline.handle(&chat, text_request("hello there friend")).await;

        assert_eq!(outcome, Outcome::NoQuestion);
        assert_eq!(chat.final_message(), "Please upload a question to solve");
        assert_eq!(h.model_calls(), 0);
        assert!(chat.posts().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_image_format() {
        let h = harness(Setup::default());
        let chat = FakeChat::default();

        let outcome = h.pipeline.handle(&chat, image_request(None, "worksheet.pdf")).await;

        assert_eq!(outcome, Outcome::UnsupportedFormat);
        assert_eq!(
            chat.final_message(),
            "Unsupported image format. Please use: .png, .jpg, .jpeg, .webp"
        );
        assert_eq!(h.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_image_failure_is_reported_privately() {
        let h = harness(Setup {
            fetch_fails: true,
            ..Setup::default()
        });
        let chat = FakeChat::default();

        let outcome = h.pipeline.handle(&chat, image_request(Some("2+2"), "q.png")).await;

        assert_eq!(outcome, Outcome::ImageFailed);
        assert_eq!(chat.final_message(), IMAGE_FAILED);
        assert_eq!(h.model_calls(), 0);
        assert!(chat.posts().is_empty());
    }

    #[tokio::test]
    async fn test_image_skips_local_classifier() {
        let h = harness(Setup {
            ocr_text: "what is the answer to this one",
            ..Setup::default()
        });
        let chat = FakeChat::default();

        let outcome = h.pipeline.handle(&chat, image_request(None, "Q.JPG")).await;

        assert!(matches!(outcome, Outcome::Posted { .. }));
        let calls = h.model_calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].model, "vision-model");
        assert!(calls[0].image_url.as_deref().unwrap().starts_with("data:image/jpeg;base64,"));
        assert_eq!(chat.posts()[0].source, SourceTag::ImageOnly);
    }

    #[tokio::test]
    async fn test_image_with_no_text_is_empty() {
        let h = harness(Setup {
            ocr_text: "  •  ",
            ..Setup::default()
        });
        let chat = FakeChat::default();

        let outcome = h.pipeline.handle(&chat, image_request(None, "q.png")).await;

        assert_eq!(outcome, Outcome::NoQuestion);
        assert_eq!(h.model_calls(), 0);
    }
}

// =============================================================================
// ANSWERING AND PUBLISHING
// =============================================================================

mod publishing {
    use super::*;

    #[tokio::test]
    async fn test_answer_is_published_with_quota() {
        let h = harness(Setup::default());
        let chat = FakeChat::default();

        let outcome = h.pipeline.handle(&chat, text_request("What is 2+2?")).await;

        assert_eq!(
            outcome,
            Outcome::Posted {
                quota: Quota::Remaining(9)
            }
        );
        let posts = chat.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].answer, "# Answer = 4");
        assert_eq!(posts[0].requester, "alice");
        assert_eq!(posts[0].prompt_preview, "What is 2+2?");
        assert_eq!(posts[0].source, SourceTag::TextOnly);
        assert_eq!(
            chat.final_message(),
            "✅ Answer posted!\n\nYou have 9 requests remaining this hour."
        );
    }

    #[tokio::test]
    async fn test_text_and_image_are_combined() {
        let h = harness(Setup {
            ocr_text: "• 3x = 12 ▪",
            ..Setup::default()
        });
        let chat = FakeChat::default();

        h.pipeline.handle(&chat, image_request(Some("Solve:"), "q.webp")).await;

        let posts = chat.posts();
        assert_eq!(posts[0].prompt_preview, "Solve:\n3x = 12");
        assert_eq!(posts[0].source, SourceTag::TextAndImage);
        let calls = h.model_calls.lock().unwrap().clone();
        assert!(calls[0].user.starts_with("Solve:\n3x = 12\n\n"));
    }

    #[tokio::test]
    async fn test_long_prompt_is_truncated_in_post() {
        let h = harness(Setup::default());
        let chat = FakeChat::default();
        let long = "7".repeat(600);

        h.pipeline.handle(&chat, text_request(&long)).await;

        let preview = &chat.posts()[0].prompt_preview;
        assert_eq!(preview.chars().count(), 512);
        assert!(preview.ends_with("..."));
        // The model still receives the full text.
        assert!(h.model_calls.lock().unwrap()[0].user.contains(&long));
    }

    #[tokio::test]
    async fn test_rejection_sentence_suppresses_post_for_text() {
        let h = harness(Setup {
            replies: vec![Ok(REJECTION.to_string())],
            ..Setup::default()
        });
        let chat = FakeChat::default();

        let outcome = h.pipeline.handle(&chat, text_request("is 7 a nice number")).await;

        assert_eq!(outcome, Outcome::Rejected);
        assert!(chat.posts().is_empty());
        assert_eq!(chat.final_message(), NO_QUESTION);
    }

    #[tokio::test]
    async fn test_rejection_sentence_suppresses_post_for_image() {
        let h = harness(Setup {
            ocr_text: "a picture of a cat",
            replies: vec![Ok(REJECTION.to_string())],
            ..Setup::default()
        });
        let chat = FakeChat::default();

        let outcome = h.pipeline.handle(&chat, image_request(None, "cat.png")).await;

        assert_eq!(outcome, Outcome::Rejected);
        assert!(chat.posts().is_empty());
        assert_eq!(chat.final_message(), NO_QUESTION);
    }

    #[tokio::test]
    async fn test_model_failure_reports_generic_error() {
        let h = harness(Setup {
            replies: vec![
                Err(llm::Error::Timeout),
                Err(llm::Error::Http("reset".into())),
                Err(llm::Error::Api {
                    status: 500,
                    body: "oops".into(),
                }),
            ],
            ..Setup::default()
        });
        let chat = FakeChat::default();

        let outcome = h.pipeline.handle(&chat, text_request("2+2")).await;

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(h.model_calls(), 3);
        assert!(chat.posts().is_empty());
        assert_eq!(chat.final_message(), GENERIC_ERROR);
    }

    #[tokio::test]
    async fn test_publish_failure_reports_generic_error() {
        let h = harness(Setup::default());
        let chat = FakeChat {
            fail_publish: true,
            ..FakeChat::default()
        };

        let outcome = h.pipeline.handle(&chat, text_request("2+2")).await;

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(chat.final_message(), GENERIC_ERROR);
    }

    #[tokio::test]
    async fn test_missing_acknowledgment_still_gets_final_reply() {
        let h = harness(Setup::default());
        let chat = FakeChat {
            drop_ack: true,
            ..FakeChat::default()
        };

        let outcome = h.pipeline.handle(&chat, text_request("2+2")).await;

        assert!(matches!(outcome, Outcome::Posted { .. }));
        assert!(chat.edits().is_empty());
        assert_eq!(
            chat.private(),
            vec!["✅ Answer posted!\n\nYou have 9 requests remaining this hour.".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failed_edit_falls_back_to_new_message() {
        let h = harness(Setup::default());
        let chat = FakeChat {
            fail_edit: true,
            ..FakeChat::default()
        };

        let outcome = h.pipeline.handle(&chat, text_request("2+2")).await;

        assert!(matches!(outcome, Outcome::Posted { .. }));
        assert!(chat.edits().is_empty());
        assert_eq!(
            chat.private(),
            vec![
                WORKING.to_string(),
                "✅ Answer posted!\n\nYou have 9 requests remaining this hour.".to_string(),
            ]
        );
        assert_eq!(chat.posts().len(), 1);
    }
}
