//! Client for an OpenAI-compatible chat completions endpoint (Groq by default).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::solver::ModelEndpoint;

/// One completion call, independent of the wire format.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    /// `data:` URL for vision models.
    pub image_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

pub struct Client {
    api_url: String,
    api_key: String,
    timeout: Duration,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: ApiContent<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ApiContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl<'a> },
}

#[derive(Serialize)]
struct ImageUrl<'a> {
    url: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl<'a> ApiRequest<'a> {
    fn from_request(request: &'a CompletionRequest) -> Self {
        let user = match request.image_url.as_deref() {
            Some(url) => ApiContent::Parts(vec![
                ContentPart::Text {
                    text: &request.user,
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url },
                },
            ]),
            None => ApiContent::Text(&request.user),
        };

        Self {
            model: &request.model,
            messages: vec![
                ApiMessage {
                    role: "system",
                    content: ApiContent::Text(&request.system),
                },
                ApiMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        }
    }
}

impl Client {
    /// `timeout` bounds each request, independent of any retry delays.
    pub fn new(api_url: String, api_key: String, timeout: Duration) -> Self {
        Self {
            api_url,
            api_key,
            timeout,
            http: reqwest::Client::new(),
        }
    }

    pub async fn chat(&self, request: &CompletionRequest) -> Result<String, Error> {
        let body = ApiRequest::from_request(request);

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(Error::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await.map_err(Error::from_reqwest)?;
        debug!("Completion response: {} bytes", text.len());
        parse_reply(&text)
    }
}

impl ModelEndpoint for Client {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, Error> {
        self.chat(request).await
    }
}

/// Pull `choices[0].message.content` out of a response body, trimmed.
pub fn parse_reply(body: &str) -> Result<String, Error> {
    let response: ApiResponse =
        serde_json::from_str(body).map_err(|e| Error::Parse(e.to_string()))?;

    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .ok_or(Error::Empty)
}

#[derive(Debug)]
pub enum Error {
    /// The request could not be constructed; retrying will not help.
    Build(String),
    Timeout,
    Http(String),
    Api { status: u16, body: String },
    Parse(String),
    /// Well-formed JSON without a reply.
    Empty,
}

impl Error {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else if e.is_builder() {
            Error::Build(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Build(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Build(e) => write!(f, "Request error: {e}"),
            Error::Timeout => write!(f, "Request timed out"),
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Api { status, body } => write!(f, "API error: {status}: {body}"),
            Error::Parse(e) => write!(f, "Parse error: {e}"),
            Error::Empty => write!(f, "Empty response"),
        }
    }
}

impl std::error::Error for Error {}
