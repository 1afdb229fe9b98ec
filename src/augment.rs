//! Contextual augmentation of chunks before embedding.
//!
//! For every chunk the language model is shown the whole page (truncated)
//! and the chunk, and asked for a short paragraph situating the chunk in
//! the page. That paragraph is prepended to the text that gets embedded.
//! Stored chunk content is never changed.

use futures::stream::{self, StreamExt};
use std::sync::Arc;

use crate::llm::{truncate_chars, LlmProvider};

const SYSTEM_PROMPT: &str =
    "You write one short paragraph that situates a chunk within its document to improve search retrieval.";

/// Page text beyond this many characters is cut from the prompt.
const MAX_DOCUMENT_CHARS: usize = 25_000;

pub struct ContextAugmenter {
    llm: Arc<dyn LlmProvider>,
    concurrency: usize,
}

impl ContextAugmenter {
    pub fn new(llm: Arc<dyn LlmProvider>, concurrency: usize) -> Self {
        Self {
            llm,
            concurrency: concurrency.max(1),
        }
    }

    /// Embedding inputs for `chunks`, in order. A chunk whose LLM call fails
    /// is returned unchanged.
    pub async fn augment(&self, url: &str, page: &str, chunks: &[String]) -> Vec<String> {
        let document = truncate_chars(page, MAX_DOCUMENT_CHARS);

        let calls: Vec<_> = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| self.situate(url, document, i, chunk))
            .collect();
        stream::iter(calls)
            .buffered(self.concurrency)
            .collect()
            .await
    }

    async fn situate(&self, url: &str, document: &str, index: usize, chunk: &str) -> String {
        let prompt = build_prompt(document, chunk);
        match self.llm.complete(SYSTEM_PROMPT, &prompt, 200).await {
            Ok(context) => format!("{}\n---\n{}", context, chunk),
            Err(e) => {
                tracing::warn!(url, chunk = index, error = %e, "contextual augmentation failed; embedding raw chunk");
                chunk.to_string()
            }
        }
    }
}

fn build_prompt(document: &str, chunk: &str) -> String {
    format!(
        "<document>\n{document}\n</document>\n\
         Here is the chunk we want to situate within the whole document:\n\
         <chunk>\n{chunk}\n</chunk>\n\
         Give a short succinct context to situate this chunk within the overall document \
         for the purposes of improving search retrieval of the chunk. \
         Answer only with the succinct context and nothing else."
    )
}
