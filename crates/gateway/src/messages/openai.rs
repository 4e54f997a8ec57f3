//! OpenAI chat-completions wire types.
//!
//! Messages are a flat sequence with string or array-of-parts content; tool
//! use travels as `tool_calls` on assistant messages with arguments encoded
//! as JSON *strings*, and tool results arrive as separate `role = "tool"`
//! messages carrying a `tool_call_id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body for the chat completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Model identifier.
    pub model: String,

    /// Conversation so far.
    pub messages: Vec<ChatMessage>,

    /// Maximum tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature, 0.0 to 2.0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling cutoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Stop sequences.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    /// Whether to stream the response as SSE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Available tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    /// Tool usage policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    /// End-user identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Fields this gateway does not interpret, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender role.
    pub role: ChatRole,

    /// Message content; absent on assistant messages that only call tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,

    /// Participant name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Tool calls issued by the assistant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// Tool call answered by this `tool` message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// Message sender role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System instructions.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Tool result.
    Tool,
}

/// String or multi-part message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Flat string content.
    Text(String),
    /// Array of typed parts.
    Parts(Vec<ContentPart>),
}

/// A typed content part.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text part.
    Text {
        /// The text.
        text: String,
    },
    /// Image reference or data URL.
    ImageUrl {
        /// The image location.
        image_url: ImageUrl,
    },
    /// Base64 audio input.
    InputAudio {
        /// The audio payload.
        input_audio: InputAudio,
    },
    /// Base64 file input.
    File {
        /// The file payload.
        file: FilePart,
    },
}

/// Image location for an `image_url` part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    /// HTTP(S) URL or `data:` URL.
    pub url: String,
}

/// Audio payload for an `input_audio` part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputAudio {
    /// Base64 audio data.
    pub data: String,
    /// Audio container format, e.g. `wav`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// File payload for a `file` part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePart {
    /// Base64 file data.
    pub file_data: String,
    /// Original filename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// A tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Always `function`.
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    /// The function specification.
    pub function: FunctionDefinition,
}

/// The only supported tool type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    /// A callable function.
    Function,
}

/// Function specification inside a tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    /// Function name.
    pub name: String,
    /// What the function does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema of the parameters.
    #[serde(default)]
    pub parameters: Value,
}

/// Tool usage policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// `auto`, `none` or `required`.
    Mode(ToolChoiceMode),
    /// Force a specific function.
    Function {
        /// Always `function`.
        #[serde(rename = "type")]
        choice_type: ToolType,
        /// The forced function.
        function: FunctionChoice,
    },
}

/// General tool-choice modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoiceMode {
    /// Never call tools.
    None,
    /// Model decides.
    Auto,
    /// At least one call required.
    Required,
}

/// The function named by a forced tool choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionChoice {
    /// Function name.
    pub name: String,
}

/// A completed tool call on an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation id, `call_…`.
    pub id: String,
    /// Always `function`.
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    /// The called function.
    pub function: FunctionCall,
}

/// Function name and JSON-string arguments of a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Function name.
    pub name: String,
    /// Arguments as a JSON string, passed through verbatim.
    pub arguments: String,
}

/// Terminal chat completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    /// Completion identifier.
    pub id: String,
    /// Always `chat.completion`.
    pub object: ObjectType,
    /// Unix timestamp of creation.
    pub created: u64,
    /// Model that generated the response.
    pub model: String,
    /// Response choices.
    pub choices: Vec<ChatChoice>,
    /// Token usage.
    pub usage: Usage,
}

/// One response choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    /// Choice index.
    pub index: u32,
    /// The generated message.
    pub message: ChatMessage,
    /// Why generation stopped.
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

/// Token usage statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens.
    pub prompt_tokens: u32,
    /// Completion tokens.
    pub completion_tokens: u32,
    /// Prompt plus completion.
    pub total_tokens: u32,
}

/// Why generation stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop.
    Stop,
    /// Token limit hit.
    Length,
    /// Output filtered.
    ContentFilter,
    /// Tool calls produced.
    ToolCalls,
    /// Forward-compatible catch-all.
    #[serde(untagged)]
    Other(String),
}

/// Streaming chat completion chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    /// Completion identifier, stable across the stream.
    pub id: String,
    /// Always `chat.completion.chunk`.
    pub object: ObjectType,
    /// Unix timestamp of the chunk.
    pub created: u64,
    /// Model generating the stream.
    pub model: String,
    /// Incremental choice updates.
    pub choices: Vec<ChatChoiceDelta>,
    /// Usage, present on the last chunk when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Incremental update for one choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoiceDelta {
    /// Choice index.
    pub index: u32,
    /// Content to append.
    pub delta: ChatMessageDelta,
    /// Set on the final chunk for this choice.
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

/// Partial message content in a streaming chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessageDelta {
    /// Role, present on the first chunk only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ChatRole>,
    /// Visible text to append.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Reasoning text to append, surfaced by reasoning-capable providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Tool-call updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<StreamingToolCall>>,
}

/// Incremental tool-call updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamingToolCall {
    /// First fragment, carrying id and function name.
    Start {
        /// Position in the tool_calls array.
        index: usize,
        /// Correlation id.
        id: String,
        /// Always `function`.
        #[serde(rename = "type")]
        tool_type: ToolType,
        /// Name and initial arguments.
        function: FunctionStart,
    },
    /// Argument continuation.
    Delta {
        /// Position matching the started call.
        index: usize,
        /// Argument fragment.
        function: FunctionDelta,
    },
}

/// Function data on the first tool-call fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionStart {
    /// Function name.
    pub name: String,
    /// Initial argument fragment, often empty.
    #[serde(default)]
    pub arguments: String,
}

/// Argument continuation fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDelta {
    /// Fragment to append.
    pub arguments: String,
}

/// Object type discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    /// A single model.
    Model,
    /// A list container.
    List,
    /// A terminal completion.
    #[serde(rename = "chat.completion")]
    ChatCompletion,
    /// A streaming chunk.
    #[serde(rename = "chat.completion.chunk")]
    ChatCompletionChunk,
}

/// A model in the catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    /// Identifier used in requests.
    pub id: String,
    /// Always `model`.
    pub object: ObjectType,
    /// Unix timestamp of creation.
    pub created: u64,
    /// Owning organisation.
    pub owned_by: String,
}

/// Model catalogue response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    /// Always `list`.
    pub object: ObjectType,
    /// The models.
    pub data: Vec<Model>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserialize_request_with_tool_round_trip() {
        let json = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": "What's the weather?"},
                {
                    "role": "assistant",
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}
                    }]
                },
                {"role": "tool", "tool_call_id": "call_abc", "content": "18C"}
            ],
            "tools": [{
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "description": "Get the weather",
                    "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
                }
            }],
            "tool_choice": "auto"
        });

        let request: ChatCompletionRequest = serde_json::from_value(json).unwrap();

        assert_eq!(request.messages.len(), 3);

        let assistant = &request.messages[1];
        let calls = assistant.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments, "{\"city\":\"Paris\"}");

        let tool = &request.messages[2];
        assert_eq!(tool.role, ChatRole::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_abc"));

        assert!(matches!(
            request.tool_choice,
            Some(ToolChoice::Mode(ToolChoiceMode::Auto))
        ));
    }

    #[test]
    fn deserialize_multipart_content() {
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "Describe this"},
                {"type": "image_url", "image_url": {"url": "https://example.com/cat.png"}}
            ]
        }))
        .unwrap();

        let Some(MessageContent::Parts(parts)) = message.content else {
            unreachable!("expected parts");
        };
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn unknown_finish_reason_is_preserved() {
        let reason: FinishReason = serde_json::from_value(json!("pause")).unwrap();
        assert_eq!(reason, FinishReason::Other("pause".to_string()));
    }

    #[test]
    fn streaming_tool_call_shapes() {
        let start: StreamingToolCall = serde_json::from_value(json!({
            "index": 0,
            "id": "call_1",
            "type": "function",
            "function": {"name": "search", "arguments": ""}
        }))
        .unwrap();

        assert!(matches!(start, StreamingToolCall::Start { .. }));

        let delta: StreamingToolCall = serde_json::from_value(json!({
            "index": 0,
            "function": {"arguments": "{\"q\":"}
        }))
        .unwrap();

        assert!(matches!(delta, StreamingToolCall::Delta { .. }));
    }

    #[test]
    fn chunk_serializes_without_empty_fields() {
        let chunk = ChatCompletionChunk {
            id: "chatcmpl-1".to_string(),
            object: ObjectType::ChatCompletionChunk,
            created: 0,
            model: "gpt-4o".to_string(),
            choices: vec![ChatChoiceDelta {
                index: 0,
                delta: ChatMessageDelta {
                    content: Some("Hi".to_string()),
                    ..Default::default()
                },
                finish_reason: None,
            }],
            usage: None,
        };

        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["object"], "chat.completion.chunk");
        assert!(value["choices"][0]["delta"].get("role").is_none());
        assert!(value.get("usage").is_none());
    }
}
