//! Text extraction through the `tesseract` command-line tool.
//!
//! Image bytes go in on stdin, recognized text comes back on stdout.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::solver::{DecodeError, TextExtractor};

pub struct TesseractOcr {
    binary: PathBuf,
    language: String,
}

impl TesseractOcr {
    pub fn new(binary: PathBuf, language: String) -> Self {
        Self { binary, language }
    }

    pub async fn recognize(&self, image: &[u8]) -> Result<String, DecodeError> {
        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout", "-l", self.language.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DecodeError(format!("failed to run {}: {e}", self.binary.display())))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DecodeError("tesseract stdin unavailable".to_string()))?;
        let write_result = stdin.write_all(image).await;
        // Close stdin so tesseract sees end of input.
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DecodeError(format!("tesseract did not finish: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DecodeError(format!("tesseract failed: {}", stderr.trim())));
        }
        write_result.map_err(|e| DecodeError(format!("failed to pass image to tesseract: {e}")))?;

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("OCR produced {} chars", text.chars().count());
        Ok(text)
    }
}

impl TextExtractor for TesseractOcr {
    async fn extract(&self, bytes: &[u8]) -> Result<String, DecodeError> {
        self.recognize(bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_decode_error() {
        let ocr = TesseractOcr::new(PathBuf::from("/nonexistent/tesseract"), "eng".into());
        let err = ocr.recognize(b"not an image").await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/tesseract"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_decode_error() {
        // `false` ignores its arguments and exits 1.
        let ocr = TesseractOcr::new(PathBuf::from("false"), "eng".into());
        let err = ocr.recognize(b"\x89PNG").await.unwrap_err();
        assert!(err.to_string().contains("tesseract failed"));
    }
}
