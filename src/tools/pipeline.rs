//! Result pipeline applied to every tool output before it reaches the model.
//!
//! Order matters: text truncation first, then image normalization. The
//! pipeline guarantees no tool can inject content that violates the model
//! endpoint's size rules.

use crate::tools::media;
use crate::tools::types::{ToolBlock, ToolOutput};
use once_cell::sync::Lazy;
use regex::Regex;

/// Maximum characters per text block before truncation.
pub const MAX_RESULT_CHARS: usize = 50_000;

static TRUNCATION_NOTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\n\[truncated: showing first \d+ of \d+ chars\]$").expect("valid regex")
});

/// Run the full pipeline over a tool output.
pub fn process(output: ToolOutput) -> ToolOutput {
    let content = output
        .content
        .into_iter()
        .map(|block| match block {
            ToolBlock::Text { text } => ToolBlock::Text {
                text: truncate_text(text, MAX_RESULT_CHARS),
            },
            ToolBlock::Image { data, mime_type } => normalize_image_block(data, mime_type),
        })
        .collect();
    ToolOutput { content }
}

/// Truncate a text block to at most `max_chars`, appending a note with the
/// original length. Idempotent: a block already carrying the note passes
/// through unchanged.
pub fn truncate_text(text: String, max_chars: usize) -> String {
    if TRUNCATION_NOTE.is_match(&text) {
        return text;
    }
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!(
        "{}\n[truncated: showing first {} of {} chars]",
        kept, max_chars, total
    )
}

fn normalize_image_block(data: String, mime_type: String) -> ToolBlock {
    use base64::Engine;

    let engine = base64::engine::general_purpose::STANDARD;
    let bytes = match engine.decode(data.as_bytes()) {
        Ok(b) => b,
        Err(e) => {
            log::warn!("[PIPELINE] Dropping undecodable image block: {}", e);
            return ToolBlock::Text {
                text: format!("[image omitted: invalid base64 payload ({})]", e),
            };
        }
    };

    match media::normalize_image(&bytes) {
        Ok(normalized) => {
            if let Some(ref warning) = normalized.warning {
                log::warn!("[PIPELINE] Image normalization: {}", warning);
            }
            ToolBlock::Image {
                data: engine.encode(&normalized.bytes),
                mime_type: normalized.mime_type,
            }
        }
        Err(e) => {
            log::warn!("[PIPELINE] Image decode failed, replacing with text: {}", e);
            let _ = mime_type;
            ToolBlock::Text {
                text: format!("[image omitted: {}]", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_passes_through() {
        assert_eq!(truncate_text("hello".to_string(), 100), "hello");
    }

    #[test]
    fn long_text_is_truncated_with_note() {
        let long = "x".repeat(120);
        let out = truncate_text(long, 100);
        assert!(out.starts_with(&"x".repeat(100)));
        assert!(out.ends_with("[truncated: showing first 100 of 120 chars]"));
    }

    #[test]
    fn truncation_is_idempotent() {
        let long = "y".repeat(60_000);
        let once = truncate_text(long, MAX_RESULT_CHARS);
        let twice = truncate_text(once.clone(), MAX_RESULT_CHARS);
        assert_eq!(once, twice);
    }

    #[test]
    fn invalid_base64_becomes_text_block() {
        let out = process(ToolOutput {
            content: vec![ToolBlock::Image {
                data: "!!!not-base64!!!".to_string(),
                mime_type: "image/png".to_string(),
            }],
        });
        match &out.content[0] {
            ToolBlock::Text { text } => assert!(text.contains("image omitted")),
            other => panic!("expected text block, got {:?}", other),
        }
    }

    #[test]
    fn undecodable_image_bytes_become_text_block() {
        use base64::Engine;
        let data = base64::engine::general_purpose::STANDARD.encode(b"definitely not an image");
        let out = process(ToolOutput {
            content: vec![ToolBlock::Image {
                data,
                mime_type: "image/png".to_string(),
            }],
        });
        match &out.content[0] {
            ToolBlock::Text { text } => assert!(text.contains("image omitted")),
            other => panic!("expected text block, got {:?}", other),
        }
    }
}
