//! Protocol-agnostic message types used between the translator and the
//! upstream adapters.
//!
//! Every dialect converts into and out of these types:
//!
//! ```text
//! Dialect Request → UnifiedRequest → Adapter → UnifiedResponse/UnifiedChunk → Dialect Response
//! ```
//!
//! The types deliberately keep both the OpenAI view (tool calls as a separate
//! field, arguments as JSON strings) and the Anthropic view (tool use as
//! content blocks, arguments as JSON values) representable without loss, so a
//! request can round-trip through its own dialect without re-serialisation
//! drift.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;

pub(crate) mod from_anthropic;
pub(crate) mod from_gemini;
pub(crate) mod from_openai;
pub(crate) mod to_anthropic;
pub(crate) mod to_gemini;
pub(crate) mod to_openai;

/// Unified request representation for all dialects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedRequest {
    /// Model identifier, opaque to the gateway.
    pub model: String,

    /// Conversation messages in order.
    pub messages: Vec<UnifiedMessage>,

    /// System instruction, either a plain string or a sequence of text
    /// blocks (the Anthropic shape, which may carry cache markers).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemContent>,

    /// Maximum tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling cutoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Top-k sampling cutoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    /// Sequences that halt generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    /// Whether the response should be streamed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Tools the model may call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<UnifiedTool>>,

    /// How the model should use the tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<UnifiedToolChoice>,

    /// Caller metadata. The `user_id` seeds the prefix-cache session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<UnifiedMetadata>,

    /// Provider-opaque extras preserved verbatim through translation.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// System instruction content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemContent {
    /// Plain string system prompt.
    Text(String),
    /// Sequence of text blocks, each with an optional cache marker.
    Blocks(Vec<SystemBlock>),
}

impl SystemContent {
    /// Concatenate the system text, block entries joined with newlines.
    pub fn joined(&self) -> Cow<'_, str> {
        match self {
            SystemContent::Text(text) => Cow::Borrowed(text),
            SystemContent::Blocks(blocks) => {
                Cow::Owned(blocks.iter().map(|b| b.text.as_str()).collect::<Vec<_>>().join("\n"))
            }
        }
    }
}

/// A single system text block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    /// The text content.
    pub text: String,
    /// Cache boundary marker for the prompt prefix ending at this block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

/// Cache boundary marker on a block: the prompt prefix up to and including
/// the block is a cache boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheControl {
    /// Ephemeral cache entry with an optional TTL.
    Ephemeral {
        /// TTL of the cached prefix; five minutes when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl: Option<CacheTtl>,
    },
}

impl CacheControl {
    /// TTL in seconds the accountant applies for this marker.
    pub fn ttl_seconds(&self) -> u64 {
        match self {
            CacheControl::Ephemeral { ttl: Some(CacheTtl::OneHour) } => 3600,
            CacheControl::Ephemeral { .. } => 300,
        }
    }
}

/// Supported cache TTL values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheTtl {
    /// Five minute TTL.
    #[serde(rename = "5m")]
    FiveMinutes,
    /// One hour TTL.
    #[serde(rename = "1h")]
    OneHour,
}

/// A single conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedMessage {
    /// Sender role.
    pub role: UnifiedRole,

    /// Message content, plain text or ordered blocks.
    pub content: UnifiedContentContainer,

    /// Tool name, set on tool-role messages in the OpenAI dialect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Tool calls in the OpenAI shape. Kept alongside `ToolUse` blocks so an
    /// OpenAI round-trip can reuse the original argument strings verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<UnifiedToolCall>>,

    /// ID of the tool call a tool-role message answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl UnifiedMessage {
    /// A plain text message with the given role.
    pub fn text(role: UnifiedRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: UnifiedContentContainer::Text(text.into()),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Tool calls of this message, computed from `ToolUse` blocks when the
    /// OpenAI-shaped field is absent.
    pub fn compute_tool_calls(&self) -> Option<Vec<UnifiedToolCall>> {
        if let Some(calls) = &self.tool_calls {
            return Some(calls.clone());
        }

        let UnifiedContentContainer::Blocks(blocks) = &self.content else {
            return None;
        };

        let calls: Vec<UnifiedToolCall> = blocks
            .iter()
            .filter_map(|block| match block {
                UnifiedContent::ToolUse { id, name, input, .. } => Some(UnifiedToolCall {
                    id: id.clone(),
                    function: UnifiedFunctionCall {
                        name: name.clone(),
                        arguments: UnifiedArguments::Value(input.clone()),
                    },
                }),
                _ => None,
            })
            .collect();

        if calls.is_empty() { None } else { Some(calls) }
    }
}

/// Message content container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UnifiedContentContainer {
    /// Plain text.
    Text(String),
    /// Ordered content blocks.
    Blocks(Vec<UnifiedContent>),
}

impl UnifiedContentContainer {
    /// Concatenated visible text of the content.
    pub fn visible_text(&self) -> String {
        match self {
            UnifiedContentContainer::Text(text) => text.clone(),
            UnifiedContentContainer::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    UnifiedContent::Text { text, .. } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// Message sender role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnifiedRole {
    /// System instructions.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Tool execution result.
    Tool,
}

/// A tagged content block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnifiedContent {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
        /// Cache boundary marker.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },

    /// Image input.
    Image {
        /// Inline data or URL reference.
        source: UnifiedImageSource,
        /// Cache boundary marker.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },

    /// Audio input, base64 encoded.
    InputAudio {
        /// Base64 audio payload.
        data: String,
    },

    /// Arbitrary file input, base64 encoded.
    File {
        /// Base64 file payload.
        data: String,
        /// MIME type when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },

    /// Model reasoning. Never mixed into visible text.
    Thinking {
        /// The reasoning text.
        thinking: String,
        /// Provider integrity signature over the reasoning.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },

    /// Tool invocation requested by the assistant.
    ToolUse {
        /// Correlation id for the matching result.
        id: String,
        /// Tool name.
        name: String,
        /// Arguments as parsed JSON.
        input: Value,
        /// Cache boundary marker.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },

    /// Result of a tool invocation.
    ToolResult {
        /// The `ToolUse` id this answers.
        tool_use_id: String,
        /// Result payload.
        content: UnifiedToolResultContent,
        /// Whether the tool failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
        /// Cache boundary marker.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

impl UnifiedContent {
    /// The cache marker of this block, if any.
    pub fn cache_control(&self) -> Option<&CacheControl> {
        match self {
            UnifiedContent::Text { cache_control, .. }
            | UnifiedContent::Image { cache_control, .. }
            | UnifiedContent::ToolUse { cache_control, .. }
            | UnifiedContent::ToolResult { cache_control, .. } => cache_control.as_ref(),
            _ => None,
        }
    }

    /// Text content of a text block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            UnifiedContent::Text { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// Tool result payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UnifiedToolResultContent {
    /// A single text result.
    Text(String),
    /// Multiple text parts.
    Multiple(Vec<String>),
}

impl UnifiedToolResultContent {
    /// The result joined into one string.
    pub fn joined(&self) -> Cow<'_, str> {
        match self {
            UnifiedToolResultContent::Text(text) => Cow::Borrowed(text),
            UnifiedToolResultContent::Multiple(parts) => Cow::Owned(parts.join("\n")),
        }
    }
}

/// Image source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnifiedImageSource {
    /// Inline base64 data.
    Base64 {
        /// MIME type, e.g. `image/png`.
        media_type: String,
        /// Base64 payload without a data-URL prefix.
        data: String,
    },
    /// External URL the provider fetches.
    Url {
        /// HTTP(S) URL.
        url: String,
    },
}

/// A tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedTool {
    /// The function specification.
    pub function: UnifiedFunction,
}

/// A callable function specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedFunction {
    /// Unique function name.
    pub name: String,
    /// What the function does.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema of the arguments.
    pub parameters: Value,
}

/// How the model should use tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UnifiedToolChoice {
    /// A general mode.
    Mode(UnifiedToolChoiceMode),
    /// Force one specific tool.
    Specific {
        /// The forced function.
        function: UnifiedFunctionChoice,
    },
}

/// General tool-choice modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnifiedToolChoiceMode {
    /// Never call tools.
    None,
    /// Model decides.
    Auto,
    /// At least one tool call is required. `any` in the Anthropic dialect.
    #[serde(alias = "required", alias = "any")]
    Required,
}

/// The function forced by a specific tool choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedFunctionChoice {
    /// Name of the forced function.
    pub name: String,
}

/// A completed tool call in the OpenAI shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedToolCall {
    /// Correlation id.
    pub id: String,
    /// The called function.
    pub function: UnifiedFunctionCall,
}

/// The function and arguments of a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedFunctionCall {
    /// Function name.
    pub name: String,
    /// Arguments, string or parsed JSON depending on origin dialect.
    pub arguments: UnifiedArguments,
}

/// Function arguments in their original representation.
///
/// The OpenAI dialect carries a JSON string, the Anthropic and Gemini
/// dialects a JSON object. Keeping the original avoids re-serialisation
/// drift when a request round-trips through its own dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UnifiedArguments {
    /// JSON-encoded string.
    String(String),
    /// Parsed JSON value.
    Value(Value),
}

impl UnifiedArguments {
    /// The arguments as a JSON string, serialising values on demand.
    pub fn to_json_string(&self) -> String {
        match self {
            UnifiedArguments::String(raw) => raw.clone(),
            UnifiedArguments::Value(value) => serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()),
        }
    }

    /// The arguments as a JSON value, parsing strings on demand.
    pub fn to_json_value(&self) -> Value {
        match self {
            UnifiedArguments::String(raw) => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
            }
            UnifiedArguments::Value(value) => value.clone(),
        }
    }
}

/// Caller metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedMetadata {
    /// Caller-supplied user identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Terminal response of a completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedResponse {
    /// Completion identifier.
    pub id: String,
    /// Model that generated the response.
    pub model: String,
    /// Response choices; index 0 is the primary one.
    pub choices: Vec<UnifiedChoice>,
    /// Token usage.
    pub usage: UnifiedUsage,
    /// Unix timestamp of creation.
    pub created: u64,
    /// Detailed Anthropic-style stop reason when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<UnifiedStopReason>,
    /// Matched stop sequence, if one halted the generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
}

/// One response choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedChoice {
    /// Choice index.
    pub index: u32,
    /// The generated message.
    pub message: UnifiedMessage,
    /// Why generation stopped.
    pub finish_reason: Option<UnifiedFinishReason>,
}

/// Token usage statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnifiedUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u32,
    /// Tokens generated.
    pub completion_tokens: u32,
    /// Prompt plus completion tokens.
    pub total_tokens: u32,
    /// Prompt tokens served from a cached prefix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
    /// Prompt tokens spent creating cache entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u32>,
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnifiedFinishReason {
    /// Natural stop.
    Stop,
    /// Token limit hit.
    #[serde(alias = "max_tokens")]
    Length,
    /// Output filtered.
    ContentFilter,
    /// Tool calls were produced.
    ToolCalls,
    /// The upstream failed mid-generation.
    Error,
}

impl std::fmt::Display for UnifiedFinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnifiedFinishReason::Stop => "stop",
            UnifiedFinishReason::Length => "length",
            UnifiedFinishReason::ContentFilter => "content_filter",
            UnifiedFinishReason::ToolCalls => "tool_calls",
            UnifiedFinishReason::Error => "error",
        };
        f.write_str(s)
    }
}

/// Detailed stop reason in the Anthropic vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnifiedStopReason {
    /// End of the assistant turn.
    EndTurn,
    /// Token limit hit.
    MaxTokens,
    /// A stop sequence matched.
    StopSequence,
    /// A tool was invoked.
    ToolUse,
}

impl From<UnifiedStopReason> for UnifiedFinishReason {
    fn from(reason: UnifiedStopReason) -> Self {
        match reason {
            UnifiedStopReason::EndTurn | UnifiedStopReason::StopSequence => UnifiedFinishReason::Stop,
            UnifiedStopReason::MaxTokens => UnifiedFinishReason::Length,
            UnifiedStopReason::ToolUse => UnifiedFinishReason::ToolCalls,
        }
    }
}

impl From<UnifiedFinishReason> for UnifiedStopReason {
    fn from(reason: UnifiedFinishReason) -> Self {
        match reason {
            UnifiedFinishReason::Length => UnifiedStopReason::MaxTokens,
            UnifiedFinishReason::ToolCalls => UnifiedStopReason::ToolUse,
            _ => UnifiedStopReason::EndTurn,
        }
    }
}

/// Streaming chunk with incremental updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedChunk {
    /// Completion identifier, stable across the stream.
    pub id: Cow<'static, str>,
    /// Model generating the stream.
    pub model: Cow<'static, str>,
    /// Incremental choice updates.
    pub choices: Vec<UnifiedChoiceDelta>,
    /// Usage, present on the terminal chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UnifiedUsage>,
    /// Unix timestamp of the chunk.
    pub created: u64,
}

impl UnifiedChunk {
    /// Whether any choice of this chunk carries a finish reason.
    pub fn is_terminal(&self) -> bool {
        self.choices.iter().any(|c| c.finish_reason.is_some())
    }
}

/// Incremental update for one choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedChoiceDelta {
    /// Choice index.
    pub index: u32,
    /// Content to append.
    pub delta: UnifiedMessageDelta,
    /// Set on the final chunk for this choice.
    pub finish_reason: Option<UnifiedFinishReason>,
}

/// Partial message content in a streaming chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnifiedMessageDelta {
    /// Role, present on the first chunk only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<UnifiedRole>,
    /// Visible text to append.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Reasoning text to append. Kept apart from visible content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Tool-call updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<UnifiedStreamingToolCall>>,
}

/// Incremental tool-call updates.
///
/// The first fragment for an index carries the id and function name; later
/// fragments append to the argument string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UnifiedStreamingToolCall {
    /// First fragment of a tool call.
    Start {
        /// Position in the tool_calls array.
        index: usize,
        /// Correlation id.
        id: String,
        /// Function name and initial arguments.
        function: UnifiedFunctionStart,
    },
    /// Argument continuation for an already started call.
    Delta {
        /// Position matching the started call.
        index: usize,
        /// Argument fragment.
        function: UnifiedFunctionDelta,
    },
}

/// Function data on the first tool-call fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedFunctionStart {
    /// Function name.
    pub name: String,
    /// Initial argument fragment, often empty.
    pub arguments: String,
}

/// Argument continuation fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedFunctionDelta {
    /// Fragment to append to the accumulated argument string.
    pub arguments: String,
}

/// A model in the unified catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedModel {
    /// Identifier used in requests.
    pub id: String,
    /// Human-readable name.
    pub display_name: String,
    /// Unix timestamp of model creation, zero when unknown.
    pub created: u64,
    /// Organisation providing the model.
    pub owned_by: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cache_control_ttl_mapping() {
        let five = CacheControl::Ephemeral { ttl: None };
        let five_explicit = CacheControl::Ephemeral {
            ttl: Some(CacheTtl::FiveMinutes),
        };
        let hour = CacheControl::Ephemeral {
            ttl: Some(CacheTtl::OneHour),
        };

        assert_eq!(five.ttl_seconds(), 300);
        assert_eq!(five_explicit.ttl_seconds(), 300);
        assert_eq!(hour.ttl_seconds(), 3600);
    }

    #[test]
    fn cache_control_wire_shape() {
        let parsed: CacheControl = serde_json::from_value(json!({
            "type": "ephemeral",
            "ttl": "1h"
        }))
        .unwrap();

        assert_eq!(
            parsed,
            CacheControl::Ephemeral {
                ttl: Some(CacheTtl::OneHour)
            }
        );
    }

    #[test]
    fn compute_tool_calls_prefers_openai_shape() {
        let message = UnifiedMessage {
            role: UnifiedRole::Assistant,
            content: UnifiedContentContainer::Blocks(vec![UnifiedContent::ToolUse {
                id: "toolu_1".to_string(),
                name: "search".to_string(),
                input: json!({"q": "x"}),
                cache_control: None,
            }]),
            name: None,
            tool_calls: Some(vec![UnifiedToolCall {
                id: "call_1".to_string(),
                function: UnifiedFunctionCall {
                    name: "search".to_string(),
                    arguments: UnifiedArguments::String(r#"{"q":"x"}"#.to_string()),
                },
            }]),
            tool_call_id: None,
        };

        let calls = message.compute_tool_calls().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        // The original argument string survives untouched.
        assert_eq!(calls[0].function.arguments.to_json_string(), r#"{"q":"x"}"#);
    }

    #[test]
    fn compute_tool_calls_falls_back_to_blocks() {
        let message = UnifiedMessage {
            role: UnifiedRole::Assistant,
            content: UnifiedContentContainer::Blocks(vec![UnifiedContent::ToolUse {
                id: "toolu_1".to_string(),
                name: "search".to_string(),
                input: json!({"q": "x"}),
                cache_control: None,
            }]),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        };

        let calls = message.compute_tool_calls().unwrap();
        assert_eq!(calls[0].id, "toolu_1");
        assert_eq!(calls[0].function.arguments.to_json_value(), json!({"q": "x"}));
    }

    #[test]
    fn extras_round_trip_through_serde() {
        let request: UnifiedRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [],
            "logit_bias": {"50256": -100}
        }))
        .unwrap();

        assert_eq!(request.extra.get("logit_bias"), Some(&json!({"50256": -100})));

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["logit_bias"], json!({"50256": -100}));
    }

    #[test]
    fn thinking_blocks_are_not_visible_text() {
        let container = UnifiedContentContainer::Blocks(vec![
            UnifiedContent::Thinking {
                thinking: "pondering".to_string(),
                signature: None,
            },
            UnifiedContent::Text {
                text: "Hello".to_string(),
                cache_control: None,
            },
        ]);

        assert_eq!(container.visible_text(), "Hello");
    }
}
