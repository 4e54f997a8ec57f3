//! Anthropic Messages wire types.
//!
//! Messages are sequences of typed blocks; `tool_use` and `tool_result` are
//! block kinds, `system` is a top-level field and `cache_control` markers
//! live on individual blocks. Streaming uses typed SSE events
//! (`message_start`, `content_block_delta`, …) ended by `message_stop`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use crate::messages::unified::{CacheControl, CacheTtl};

/// Request body for the messages endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    /// Model identifier.
    pub model: String,

    /// Conversation messages, alternating user and assistant.
    pub messages: Vec<Message>,

    /// Maximum tokens to generate. Required by the dialect.
    pub max_tokens: u32,

    /// System prompt, a string or text blocks with cache markers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<System>,

    /// Sampling temperature, 0.0 to 1.0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling cutoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Top-k sampling cutoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    /// Stop sequences.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    /// Whether to stream the response as typed SSE events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Caller metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,

    /// Available tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    /// Tool usage policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    /// Fields this gateway does not interpret, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// System prompt content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum System {
    /// Plain string.
    Text(String),
    /// Text blocks, each with an optional cache marker.
    Blocks(Vec<SystemBlock>),
}

/// A system text block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemBlock {
    /// The only supported system block kind.
    Text {
        /// The text.
        text: String,
        /// Cache boundary marker.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

/// A conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Sender role.
    pub role: Role,
    /// Content, a plain string or typed blocks.
    pub content: MessageContent,
}

/// Message sender role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End-user input.
    User,
    /// Model output.
    Assistant,
}

/// String or block message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Flat string.
    Text(String),
    /// Typed blocks.
    Blocks(Vec<ContentBlock>),
}

/// A typed content block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text.
        text: String,
        /// Cache boundary marker.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },

    /// Image input.
    Image {
        /// Base64 or URL source.
        source: ImageSource,
        /// Cache boundary marker.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },

    /// Extended thinking emitted by the model.
    Thinking {
        /// The reasoning text.
        thinking: String,
        /// Integrity signature over the reasoning.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },

    /// Tool invocation requested by the assistant.
    ToolUse {
        /// Correlation id, `toolu_…`.
        id: String,
        /// Tool name.
        name: String,
        /// Arguments as parsed JSON.
        input: Value,
        /// Cache boundary marker.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },

    /// Result of a tool invocation, inside a user message.
    ToolResult {
        /// The `tool_use` id this answers.
        tool_use_id: String,
        /// Result payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<ToolResultContent>,
        /// Whether the tool failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
        /// Cache boundary marker.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

/// Tool result payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    /// Flat string.
    Text(String),
    /// Typed blocks, only text blocks are interpreted.
    Blocks(Vec<ToolResultBlock>),
}

/// A block inside a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultBlock {
    /// Text block.
    Text {
        /// The text.
        text: String,
    },
}

/// Image source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    /// Inline base64 data.
    Base64 {
        /// MIME type.
        media_type: String,
        /// Base64 payload.
        data: String,
    },
    /// External URL.
    Url {
        /// HTTP(S) URL.
        url: String,
    },
}

/// Caller metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Caller-supplied user identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// A tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name.
    pub name: String,
    /// What the tool does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema of the input.
    pub input_schema: Value,
}

/// Tool usage policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    /// Model decides.
    Auto,
    /// Never call tools.
    None,
    /// At least one tool call required.
    Any,
    /// Force a specific tool.
    Tool {
        /// The forced tool name.
        name: String,
    },
}

/// Terminal messages response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    /// Message identifier, `msg_…`.
    pub id: String,
    /// Always `message`.
    pub r#type: String,
    /// Always `assistant`.
    pub role: Role,
    /// Response content blocks.
    pub content: Vec<ContentBlock>,
    /// Model that generated the response.
    pub model: String,
    /// Why generation stopped.
    pub stop_reason: Option<StopReason>,
    /// Matched stop sequence, if any.
    pub stop_sequence: Option<String>,
    /// Token usage.
    pub usage: Usage,
}

/// Why the model stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of turn.
    EndTurn,
    /// Token limit hit.
    MaxTokens,
    /// A stop sequence matched.
    StopSequence,
    /// A tool was invoked.
    ToolUse,
    /// The model declined to answer.
    Refusal,
    /// Forward-compatible catch-all.
    #[serde(untagged)]
    Other(String),
}

/// Token usage statistics, including the prompt-cache breakdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Uncached input tokens.
    #[serde(default)]
    pub input_tokens: u32,
    /// Output tokens.
    #[serde(default)]
    pub output_tokens: u32,
    /// Input tokens served from a cached prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
    /// Input tokens spent creating cache entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u32>,
}

/// Request body for the count-tokens endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountTokensRequest {
    /// Model identifier.
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<Message>,
    /// System prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<System>,
    /// Available tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
}

/// Response of the count-tokens endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountTokensResponse {
    /// Tokens the request would consume.
    pub input_tokens: u32,
}

/// Error envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always `error`.
    pub r#type: String,
    /// Error details.
    pub error: ErrorDetails,
}

/// Error details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Machine-readable error type.
    pub r#type: String,
    /// Human-readable message.
    pub message: String,
}

/// Typed streaming events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Announces the streamed message with its id and model.
    MessageStart {
        /// Initial message metadata.
        message: StreamMessageStart,
    },

    /// A content block begins; the index keys later deltas.
    ContentBlockStart {
        /// Block index.
        index: u32,
        /// The starting block.
        content_block: ContentBlock,
    },

    /// Incremental update for the indexed block.
    ContentBlockDelta {
        /// Block index.
        index: u32,
        /// The update.
        delta: ContentDelta,
    },

    /// No more deltas for the indexed block.
    ContentBlockStop {
        /// Block index.
        index: u32,
    },

    /// Top-level changes: stop reason and cumulative usage.
    MessageDelta {
        /// The changes.
        delta: MessageDeltaData,
        /// Cumulative usage.
        usage: Usage,
    },

    /// End of the stream.
    MessageStop,

    /// Keep-alive.
    Ping,

    /// Error surfaced without closing the connection.
    Error {
        /// The error.
        error: ErrorDetails,
    },
}

/// Initial metadata on `message_start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessageStart {
    /// Message identifier.
    pub id: String,
    /// Always `message`.
    pub r#type: String,
    /// Always `assistant`.
    pub role: Role,
    /// Empty at stream start.
    pub content: Vec<ContentBlock>,
    /// Model emitting the stream.
    pub model: String,
    /// Usage snapshot at stream start.
    pub usage: Usage,
}

/// Block-level delta payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    /// Text to append.
    TextDelta {
        /// The fragment.
        text: String,
    },
    /// Partial JSON for tool input.
    InputJsonDelta {
        /// The fragment.
        partial_json: String,
    },
    /// Reasoning text to append.
    ThinkingDelta {
        /// The fragment.
        thinking: String,
    },
    /// Signature over the finished reasoning block.
    SignatureDelta {
        /// The signature fragment.
        signature: String,
    },
}

/// Top-level changes on `message_delta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDeltaData {
    /// Stop reason once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    /// Matched stop sequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
}
