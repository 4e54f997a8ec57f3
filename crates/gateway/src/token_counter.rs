//! Local token counting.
//!
//! Uses the `cl100k_base` tokenizer as a provider-neutral estimate. When the
//! tokenizer cannot process a piece of text, the count falls back to
//! `ceil(len / 4)`.

use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

use crate::messages::unified::{
    SystemContent, UnifiedContent, UnifiedContentContainer, UnifiedRequest,
};

fn tokenizer() -> Option<&'static CoreBPE> {
    static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();

    BPE.get_or_init(|| match tiktoken_rs::cl100k_base() {
        Ok(bpe) => Some(bpe),
        Err(e) => {
            log::warn!("Failed to load cl100k_base tokenizer, falling back to byte estimate: {e}");
            None
        }
    })
    .as_ref()
}

/// Count the tokens of one piece of text.
pub(crate) fn count_text(text: &str) -> u32 {
    match tokenizer() {
        Some(bpe) => bpe.encode_ordinary(text).len() as u32,
        None => text.len().div_ceil(4) as u32,
    }
}

/// Estimate the input tokens of a whole request: tools, system and messages.
pub(crate) fn count_input_tokens(request: &UnifiedRequest) -> u32 {
    let mut total = 0;

    for tool in request.tools.iter().flatten() {
        total += count_text(&tool.function.name);
        if let Some(description) = &tool.function.description {
            total += count_text(description);
        }
        total += count_text(&tool.function.parameters.to_string());
    }

    if let Some(system) = &request.system {
        total += match system {
            SystemContent::Text(text) => count_text(text),
            SystemContent::Blocks(blocks) => blocks.iter().map(|b| count_text(&b.text)).sum(),
        };
    }

    for message in &request.messages {
        total += match &message.content {
            UnifiedContentContainer::Text(text) => count_text(text),
            UnifiedContentContainer::Blocks(blocks) => blocks.iter().map(count_block).sum(),
        };

        for call in message.tool_calls.iter().flatten() {
            total += count_text(&call.function.name);
            total += count_text(&call.function.arguments.to_json_string());
        }
    }

    total
}

fn count_block(block: &UnifiedContent) -> u32 {
    match block {
        UnifiedContent::Text { text, .. } => count_text(text),
        UnifiedContent::Thinking { thinking, .. } => count_text(thinking),
        UnifiedContent::ToolUse { name, input, .. } => count_text(name) + count_text(&input.to_string()),
        UnifiedContent::ToolResult { content, .. } => count_text(&content.joined()),
        // Binary payloads are not text-counted.
        UnifiedContent::Image { .. } | UnifiedContent::InputAudio { .. } | UnifiedContent::File { .. } => 0,
    }
}
