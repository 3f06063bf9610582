//! Public answer post, rendered as Telegram HTML.

use super::normalize::SourceTag;

/// Everything shown publicly for one solved question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerPost {
    pub bot_name: String,
    pub requester: String,
    pub answer: String,
    pub prompt_preview: String,
    pub source: SourceTag,
    /// UTC time the answer was produced, preformatted.
    pub timestamp: String,
}

/// Escape text for Telegram's HTML parse mode.
pub fn html_escape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '&' => result.push_str("&amp;"),
            _ => result.push(c),
        }
    }
    result
}

/// Keep at most `max_chars` characters; longer text ends in `...` within the budget.
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}

impl AnswerPost {
    pub fn render_html(&self) -> String {
        let prompt = if self.prompt_preview.is_empty() {
            "<i>No text extracted</i>".to_string()
        } else {
            html_escape(&self.prompt_preview)
        };

        format!(
            "<b>{}</b> • Requested by {}\n\n{}\n\n<b>Prompt</b>\n{}\n\n<b>Source:</b> {}\n<i>{}</i>",
            html_escape(&self.bot_name),
            html_escape(&self.requester),
            html_escape(&self.answer),
            prompt,
            self.source.label(),
            html_escape(&self.timestamp),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post() -> AnswerPost {
        AnswerPost {
            bot_name: "Solvebot".into(),
            requester: "alice".into(),
            answer: "# Answer = 4".into(),
            prompt_preview: "2 + 2 < 5?".into(),
            source: SourceTag::TextOnly,
            timestamp: "2026-01-01 10:00 UTC".into(),
        }
    }

    #[test]
    fn test_preview_within_budget() {
        assert_eq!(preview("short", 512), "short");
        assert_eq!(preview(&"a".repeat(512), 512).len(), 512);
    }

    #[test]
    fn test_preview_truncates_with_ellipsis() {
        let long = "x".repeat(600);
        let p = preview(&long, 512);
        assert_eq!(p.chars().count(), 512);
        assert!(p.ends_with("..."));
        assert_eq!(&p[..509], &long[..509]);
    }

    #[test]
    fn test_preview_counts_characters_not_bytes() {
        let text = "é".repeat(10);
        assert_eq!(preview(&text, 10), text);
        assert_eq!(preview(&text, 5), "éé...");
    }

    #[test]
    fn test_render_escapes_user_content() {
        let html = post().render_html();
        assert!(html.starts_with("<b>Solvebot</b> • Requested by alice"));
        assert!(html.contains("# Answer = 4"));
        assert!(html.contains("2 + 2 &lt; 5?"));
        assert!(html.contains("<b>Source:</b> Text only"));
    }

    #[test]
    fn test_render_empty_prompt() {
        let mut p = post();
        p.prompt_preview.clear();
        p.source = SourceTag::ImageOnly;
        let html = p.render_html();
        assert!(html.contains("<i>No text extracted</i>"));
        assert!(html.contains("Image only"));
    }

    #[test]
    fn test_requester_cannot_inject_markup() {
        let mut p = post();
        p.requester = "<a href=\"x\">bob</a>".into();
        assert!(p.render_html().contains("&lt;a href=\"x\"&gt;bob&lt;/a&gt;"));
    }
}
