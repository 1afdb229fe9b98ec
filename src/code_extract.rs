//! Code example extraction.
//!
//! Finds triple-backtick fenced blocks whose body is longer than a
//! configured minimum, captures the prose around each block, and asks the
//! language model for a short summary. The chunker is not involved; code
//! examples are stored in their own table.

use crate::llm::{truncate_chars, LlmProvider};
use crate::models::word_count;

/// Summary used when the language model is unavailable or fails.
pub const FALLBACK_SUMMARY: &str = "Code example for demonstration purposes.";

const SYSTEM_PROMPT: &str =
    "You are a helpful assistant that provides concise code example summaries.";

/// A fenced code block and its surrounding prose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub code: String,
    /// Fence info string (`rust` in ```` ```rust ````), if any.
    pub language: Option<String>,
    pub context_before: String,
    pub context_after: String,
}

/// Fenced blocks with more than `min_chars` characters of code, in
/// document order. An unterminated fence is ignored.
pub fn extract_code_blocks(markdown: &str, min_chars: usize, context_chars: usize) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut open: Option<(usize, usize, String)> = None; // (fence start, body start, info)
    let mut offset = 0usize;

    for line in markdown.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            match open.take() {
                None => {
                    let info = trimmed.trim_start_matches('`').trim().to_string();
                    open = Some((offset, offset + line.len(), info));
                }
                Some((fence_start, body_start, info)) => {
                    let body = markdown[body_start..offset].trim_matches('\n');
                    let fence_end = offset + line.len();
                    if body.chars().count() > min_chars {
                        blocks.push(CodeBlock {
                            code: body.to_string(),
                            language: info
                                .split_whitespace()
                                .next()
                                .map(|l| l.to_string()),
                            context_before: tail_chars(markdown[..fence_start].trim_end(), context_chars)
                                .trim_start()
                                .to_string(),
                            context_after: truncate_chars(markdown[fence_end..].trim_start(), context_chars)
                                .trim_end()
                                .to_string(),
                        });
                    }
                }
            }
        }
        offset += line.len();
    }

    blocks
}

/// The last `n` characters of `text`.
fn tail_chars(text: &str, n: usize) -> &str {
    let count = text.chars().count();
    if count <= n {
        return text;
    }
    match text.char_indices().nth(count - n) {
        Some((i, _)) => &text[i..],
        None => text,
    }
}

/// Asks the language model for a summary of `block`, falling back to
/// [`FALLBACK_SUMMARY`].
pub async fn summarize(llm: &dyn LlmProvider, block: &CodeBlock) -> String {
    let prompt = format!(
        "<context_before>\n{}\n</context_before>\n\n<code_example>\n{}\n</code_example>\n\n\
         <context_after>\n{}\n</context_after>\n\n\
         Based on the code example and its surrounding context, provide a concise summary \
         (2-3 sentences) that describes what this code example demonstrates and its purpose.",
        tail_chars(&block.context_before, 500),
        truncate_chars(&block.code, 1500),
        truncate_chars(&block.context_after, 500),
    );

    match llm.complete(SYSTEM_PROMPT, &prompt, 100).await {
        Ok(summary) => summary,
        Err(e) => {
            tracing::debug!(error = %e, "code summary failed; using fallback");
            FALLBACK_SUMMARY.to_string()
        }
    }
}

/// Text that gets embedded for a code example.
pub fn embedding_text(code: &str, summary: &str) -> String {
    format!("{}\n\nSummary: {}", code, summary)
}

pub fn example_metadata(
    block: &CodeBlock,
    index: usize,
    url: &str,
    source_id: &str,
) -> serde_json::Value {
    serde_json::json!({
        "chunk_index": index,
        "url": url,
        "source": source_id,
        "char_count": block.code.chars().count(),
        "word_count": word_count(&block.code),
        "language": block.language,
    })
}
