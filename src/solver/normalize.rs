//! Turns a raw question (text, image, or both) into the text sent to the model.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info};

/// An attached image, as described by the chat platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub file_name: String,
    /// Platform handle used by the image source to download the bytes.
    pub file_id: String,
}

impl ImageRef {
    /// Lowercased extension including the dot, e.g. `.png`.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{}", ext.to_lowercase()))
    }
}

/// What the caller supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Question {
    Text(String),
    Image(ImageRef),
    TextAndImage(String, ImageRef),
    Empty,
}

impl Question {
    /// Blank text counts as absent.
    pub fn new(text: Option<String>, image: Option<ImageRef>) -> Self {
        let text = text
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        match (text, image) {
            (Some(text), Some(image)) => Question::TextAndImage(text, image),
            (Some(text), None) => Question::Text(text),
            (None, Some(image)) => Question::Image(image),
            (None, None) => Question::Empty,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Question::Text(text) | Question::TextAndImage(text, _) => Some(text),
            Question::Image(_) | Question::Empty => None,
        }
    }

    pub fn image(&self) -> Option<&ImageRef> {
        match self {
            Question::Image(image) | Question::TextAndImage(_, image) => Some(image),
            Question::Text(_) | Question::Empty => None,
        }
    }

    pub fn source(&self) -> SourceTag {
        match self {
            Question::TextAndImage(..) => SourceTag::TextAndImage,
            Question::Image(_) => SourceTag::ImageOnly,
            Question::Text(_) | Question::Empty => SourceTag::TextOnly,
        }
    }
}

/// Where the prompt came from, shown on the public post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTag {
    TextOnly,
    ImageOnly,
    TextAndImage,
}

impl SourceTag {
    pub fn label(self) -> &'static str {
        match self {
            SourceTag::TextOnly => "Text only",
            SourceTag::ImageOnly => "Image only",
            SourceTag::TextAndImage => "Text + Image",
        }
    }
}

/// Downloaded image, kept so it can be forwarded to a vision model.
#[derive(Debug, Clone)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub media_type: &'static str,
}

#[derive(Debug, Clone)]
pub struct NormalizedInput {
    pub text: String,
    pub image: Option<ImageData>,
}

impl NormalizedInput {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Debug)]
pub enum FetchError {
    /// The platform could not resolve the attachment.
    Lookup(String),
    /// Download failed or returned a non-success status.
    Download(String),
    Timeout(Duration),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lookup(e) => write!(f, "attachment lookup failed: {e}"),
            Self::Download(e) => write!(f, "download failed: {e}"),
            Self::Timeout(d) => write!(f, "download timed out after {}s", d.as_secs()),
        }
    }
}

impl std::error::Error for FetchError {}

/// The OCR engine could not read the image.
#[derive(Debug)]
pub struct DecodeError(pub String);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not read image: {}", self.0)
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug)]
pub enum NormalizeError {
    Fetch(FetchError),
    Decode(DecodeError),
}

impl fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch(e) => write!(f, "image processing failed: {e}"),
            Self::Decode(e) => write!(f, "image processing failed: {e}"),
        }
    }
}

impl std::error::Error for NormalizeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fetch(e) => Some(e),
            Self::Decode(e) => Some(e),
        }
    }
}

/// Image extension outside the configured set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedFormat {
    pub supported: Vec<String>,
}

impl fmt::Display for UnsupportedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Unsupported image format. Please use: {}",
            self.supported.join(", ")
        )
    }
}

pub trait ImageSource {
    fn fetch(&self, image: &ImageRef) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

pub trait TextExtractor {
    fn extract(&self, bytes: &[u8]) -> impl Future<Output = Result<String, DecodeError>> + Send;
}

/// Glyphs that OCR picks up from list bullets and UI chrome.
const ORNAMENTS: &str = "[▪•◦▫]";

pub struct InputNormalizer<S, X> {
    source: S,
    extractor: X,
    supported: Vec<String>,
    download_timeout: Duration,
    ornaments: Regex,
    whitespace: Regex,
}

impl<S: ImageSource, X: TextExtractor> InputNormalizer<S, X> {
    /// `supported` holds lowercase extensions with a leading dot.
    pub fn new(source: S, extractor: X, supported: Vec<String>, download_timeout: Duration) -> Self {
        Self {
            source,
            extractor,
            supported,
            download_timeout,
            ornaments: Regex::new(ORNAMENTS).unwrap(),
            whitespace: Regex::new(r"\s+").unwrap(),
        }
    }

    pub fn validate_image(&self, image: &ImageRef) -> Result<(), UnsupportedFormat> {
        match image.extension() {
            Some(ext) if self.supported.contains(&ext) => Ok(()),
            _ => Err(UnsupportedFormat {
                supported: self.supported.clone(),
            }),
        }
    }

    /// Strip ornaments, collapse whitespace, trim. Idempotent.
    pub fn sanitize(&self, text: &str) -> String {
        let text = self.ornaments.replace_all(text, "");
        let text = self.whitespace.replace_all(&text, " ");
        text.trim().to_string()
    }

    /// Resolve the combined question text, running OCR when an image is attached.
    ///
    /// Image extensions must already have been checked with [`Self::validate_image`].
    pub async fn normalize(&self, question: &Question) -> Result<NormalizedInput, NormalizeError> {
        let (extracted, image) = match question.image() {
            Some(image_ref) => {
                let bytes = self.fetch(image_ref).await?;
                debug!("Running OCR on {} ({} bytes)", image_ref.file_name, bytes.len());
                let raw = self
                    .extractor
                    .extract(&bytes)
                    .await
                    .map_err(NormalizeError::Decode)?;
                let extracted = self.sanitize(&raw);
                let preview: String = extracted.chars().take(100).collect();
                info!("Extracted text: \"{preview}\"");

                let media_type = media_type_for(image_ref);
                (extracted, Some(ImageData { bytes, media_type }))
            }
            None => (String::new(), None),
        };

        Ok(NormalizedInput {
            text: combine(question.text(), &extracted),
            image,
        })
    }

    async fn fetch(&self, image: &ImageRef) -> Result<Vec<u8>, NormalizeError> {
        info!("Downloading image: {}", image.file_name);
        match tokio::time::timeout(self.download_timeout, self.source.fetch(image)).await {
            Ok(result) => result.map_err(NormalizeError::Fetch),
            Err(_) => Err(NormalizeError::Fetch(FetchError::Timeout(self.download_timeout))),
        }
    }
}

/// Supplied text first, then OCR output.
fn combine(text: Option<&str>, extracted: &str) -> String {
    match (text, extracted.is_empty()) {
        (Some(text), false) => format!("{text}\n{extracted}").trim().to_string(),
        (Some(text), true) => text.to_string(),
        (None, false) => extracted.to_string(),
        (None, true) => String::new(),
    }
}

fn media_type_for(image: &ImageRef) -> &'static str {
    match image.extension().as_deref() {
        Some(".png") => "image/png",
        Some(".webp") => "image/webp",
        Some(".gif") => "image/gif",
        _ => "image/jpeg",
    }
}
