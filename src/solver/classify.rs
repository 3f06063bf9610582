//! Cheap local gate for "is this worth sending to the model".
//!
//! Deliberately permissive: any single signal (a digit, an operator, a math
//! word) is enough. Non-math text that slips through is rejected by the model.

use regex::Regex;

/// Inputs shorter than this (after trimming) are never math.
const MIN_CHARS: usize = 3;

pub struct QuestionClassifier {
    signals: Vec<Regex>,
}

impl QuestionClassifier {
    pub fn new() -> Self {
        let signals = [
            // digits
            r"\d",
            // arithmetic, comparison, assignment
            r"[+\-*/=<>]",
            r"(?i)\b(solve|find|calculate|compute|evaluate|simplify|prove)\b",
            r"(?i)\b(equation|function|derivative|integral|limit|sum|product)\b",
            // single-letter variable assignment, e.g. "x = 4" or "y=..."
            r"(?i)\b[a-z]\s*=",
            // exponent
            r"\^|\*\*",
        ];

        Self {
            signals: signals.into_iter().map(|p| Regex::new(p).unwrap()).collect(),
        }
    }

    pub fn looks_like_math(&self, text: &str) -> bool {
        if text.trim().chars().count() < MIN_CHARS {
            return false;
        }
        self.signals.iter().any(|signal| signal.is_match(text))
    }
}

impl Default for QuestionClassifier {
    fn default() -> Self {
        Self::new()
    }
}
