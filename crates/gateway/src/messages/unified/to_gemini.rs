//! Conversions from unified types to Gemini wire types, including the chunk
//! encoder that buffers streamed tool-call fragments into whole
//! `functionCall` parts.

use std::collections::HashMap;

use serde_json::Value;

use crate::messages::{gemini, unified};

impl From<unified::UnifiedRequest> for gemini::GenerateContentRequest {
    fn from(req: unified::UnifiedRequest) -> Self {
        let system_instruction = req.system.map(|system| gemini::Content {
            role: None,
            parts: vec![gemini::Part::text(system.joined().into_owned())],
        });

        // functionResponse parts carry the function name, not the call id;
        // remember the name of every tool call seen so far.
        let mut call_names: HashMap<String, String> = HashMap::new();
        let mut contents = Vec::with_capacity(req.messages.len());

        for msg in req.messages {
            if let Some(calls) = msg.compute_tool_calls() {
                for call in &calls {
                    call_names.insert(call.id.clone(), call.function.name.clone());
                }
            }

            contents.push(convert_message(msg, &call_names));
        }

        let generation_config = gemini::GenerationConfig {
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            max_output_tokens: req.max_tokens,
            stop_sequences: req.stop_sequences,
        };

        let tools = req.tools.map(|tools| {
            vec![gemini::Tool {
                function_declarations: Some(
                    tools
                        .into_iter()
                        .map(|tool| gemini::FunctionDeclaration {
                            name: tool.function.name,
                            description: tool.function.description,
                            parameters: Some(sanitize_schema(tool.function.parameters)),
                        })
                        .collect(),
                ),
            }]
        });

        Self {
            contents,
            system_instruction,
            generation_config: Some(generation_config),
            tools,
            tool_config: req.tool_choice.map(gemini::ToolConfig::from),
        }
    }
}

fn convert_message(msg: unified::UnifiedMessage, call_names: &HashMap<String, String>) -> gemini::Content {
    // Tool-role messages inline into the following user turn as a
    // functionResponse part.
    if msg.role == unified::UnifiedRole::Tool {
        let name = msg
            .name
            .clone()
            .or_else(|| {
                msg.tool_call_id
                    .as_ref()
                    .and_then(|id| call_names.get(id).cloned())
            })
            .unwrap_or_default();

        let text = msg.content.visible_text();
        let response = serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text));

        return gemini::Content {
            role: Some(gemini::Role::User),
            parts: vec![gemini::Part::function_response(
                name,
                serde_json::json!({ "result": response }),
            )],
        };
    }

    let role = match msg.role {
        unified::UnifiedRole::Assistant => gemini::Role::Model,
        _ => gemini::Role::User,
    };

    let mut parts = Vec::new();

    match msg.content {
        unified::UnifiedContentContainer::Text(text) => parts.push(gemini::Part::text(text)),
        unified::UnifiedContentContainer::Blocks(blocks) => {
            for block in blocks {
                match block {
                    unified::UnifiedContent::Text { text, .. } => parts.push(gemini::Part::text(text)),
                    unified::UnifiedContent::Image { source, .. } => match source {
                        unified::UnifiedImageSource::Base64 { media_type, data } => parts.push(gemini::Part {
                            text: None,
                            thought: None,
                            inline_data: Some(gemini::Blob {
                                mime_type: media_type,
                                data,
                            }),
                            function_call: None,
                            function_response: None,
                        }),
                        unified::UnifiedImageSource::Url { .. } => {
                            log::warn!("Dropping URL image part unsupported by the Gemini dialect");
                        }
                    },
                    unified::UnifiedContent::ToolUse { name, input, .. } => {
                        parts.push(gemini::Part::function_call(name, input));
                    }
                    unified::UnifiedContent::ToolResult {
                        tool_use_id, content, ..
                    } => {
                        let name = call_names.get(&tool_use_id).cloned().unwrap_or_default();
                        let text = content.joined().into_owned();
                        let response = serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text));

                        parts.push(gemini::Part::function_response(
                            name,
                            serde_json::json!({ "result": response }),
                        ));
                    }
                    unified::UnifiedContent::Thinking { .. } => {
                        // No request-side reasoning channel in this dialect.
                    }
                    unified::UnifiedContent::InputAudio { .. } | unified::UnifiedContent::File { .. } => {
                        log::warn!("Dropping content block unsupported by the Gemini dialect");
                    }
                }
            }
        }
    }

    // A tool-calling assistant turn whose calls came in the OpenAI shape.
    if !parts.iter().any(|p| p.function_call.is_some())
        && let Some(calls) = msg.tool_calls
    {
        for call in calls {
            parts.push(gemini::Part::function_call(
                call.function.name,
                call.function.arguments.to_json_value(),
            ));
        }
    }

    if parts.is_empty() {
        parts.push(gemini::Part::text(String::new()));
    }

    gemini::Content { role: Some(role), parts }
}

/// Strip JSON Schema fields the Gemini API rejects, recursively.
fn sanitize_schema(mut value: Value) -> Value {
    if let Some(obj) = value.as_object_mut() {
        obj.remove("additionalProperties");
        obj.remove("$schema");
        obj.remove("default");

        if let Some(properties) = obj.get_mut("properties")
            && let Some(props) = properties.as_object_mut()
        {
            for (_, prop) in props.iter_mut() {
                *prop = sanitize_schema(prop.take());
            }
        }

        if let Some(items) = obj.get_mut("items") {
            *items = sanitize_schema(items.take());
        }
    }

    value
}

impl From<unified::UnifiedToolChoice> for gemini::ToolConfig {
    fn from(choice: unified::UnifiedToolChoice) -> Self {
        let config = match choice {
            unified::UnifiedToolChoice::Mode(mode) => gemini::FunctionCallingConfig {
                mode: match mode {
                    unified::UnifiedToolChoiceMode::None => gemini::FunctionCallingMode::None,
                    unified::UnifiedToolChoiceMode::Auto => gemini::FunctionCallingMode::Auto,
                    unified::UnifiedToolChoiceMode::Required => gemini::FunctionCallingMode::Any,
                },
                allowed_function_names: None,
            },
            unified::UnifiedToolChoice::Specific { function } => gemini::FunctionCallingConfig {
                mode: gemini::FunctionCallingMode::Any,
                allowed_function_names: Some(vec![function.name]),
            },
        };

        Self {
            function_calling_config: Some(config),
        }
    }
}

impl From<unified::UnifiedFinishReason> for gemini::FinishReason {
    fn from(reason: unified::UnifiedFinishReason) -> Self {
        match reason {
            // The dialect has no tool-call finish reason; calls end with STOP.
            unified::UnifiedFinishReason::Stop | unified::UnifiedFinishReason::ToolCalls => gemini::FinishReason::Stop,
            unified::UnifiedFinishReason::Length => gemini::FinishReason::MaxTokens,
            unified::UnifiedFinishReason::ContentFilter => gemini::FinishReason::Safety,
            unified::UnifiedFinishReason::Error => gemini::FinishReason::Other("ERROR".to_string()),
        }
    }
}

impl From<unified::UnifiedUsage> for gemini::UsageMetadata {
    fn from(usage: unified::UnifiedUsage) -> Self {
        Self {
            prompt_token_count: usage.prompt_tokens,
            candidates_token_count: usage.completion_tokens,
            thoughts_token_count: None,
            total_token_count: usage.total_tokens,
        }
    }
}

impl From<unified::UnifiedResponse> for gemini::GenerateContentResponse {
    fn from(resp: unified::UnifiedResponse) -> Self {
        let candidates = resp
            .choices
            .into_iter()
            .map(|choice| {
                let mut parts = Vec::new();

                match choice.message.content {
                    unified::UnifiedContentContainer::Text(text) if !text.is_empty() => {
                        parts.push(gemini::Part::text(text));
                    }
                    unified::UnifiedContentContainer::Blocks(blocks) => {
                        for block in blocks {
                            match block {
                                unified::UnifiedContent::Text { text, .. } => {
                                    parts.push(gemini::Part::text(text));
                                }
                                unified::UnifiedContent::Thinking { thinking, .. } => parts.push(gemini::Part {
                                    text: Some(thinking),
                                    thought: Some(true),
                                    inline_data: None,
                                    function_call: None,
                                    function_response: None,
                                }),
                                unified::UnifiedContent::ToolUse { name, input, .. } => {
                                    parts.push(gemini::Part::function_call(name, input));
                                }
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }

                if !parts.iter().any(|p| p.function_call.is_some())
                    && let Some(calls) = choice.message.tool_calls
                {
                    for call in calls {
                        parts.push(gemini::Part::function_call(
                            call.function.name,
                            call.function.arguments.to_json_value(),
                        ));
                    }
                }

                gemini::Candidate {
                    content: Some(gemini::Content {
                        role: Some(gemini::Role::Model),
                        parts,
                    }),
                    finish_reason: choice.finish_reason.map(gemini::FinishReason::from),
                    index: choice.index,
                }
            })
            .collect();

        Self {
            candidates,
            usage_metadata: Some(resp.usage.into()),
            model_version: Some(resp.model),
            response_id: Some(resp.id),
        }
    }
}

/// Encoder from unified chunks to streamed Gemini response chunks.
///
/// Text and reasoning pass straight through; tool-call argument fragments are
/// buffered per index and emitted as whole `functionCall` parts on the
/// terminal chunk, since the dialect has no partial-arguments shape.
pub struct ChunkEncoder {
    pending_calls: HashMap<usize, PendingCall>,
    usage: Option<gemini::UsageMetadata>,
}

struct PendingCall {
    name: String,
    arguments: String,
}

impl ChunkEncoder {
    /// A fresh encoder for one stream.
    pub fn new() -> Self {
        Self {
            pending_calls: HashMap::new(),
            usage: None,
        }
    }

    /// Encode one unified chunk; returns nothing while buffering tool calls.
    pub fn encode(&mut self, chunk: unified::UnifiedChunk) -> Option<gemini::GenerateContentResponse> {
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into());
        }

        let choice = chunk.choices.into_iter().next()?;
        let mut parts = Vec::new();

        if let Some(reasoning) = choice.delta.reasoning
            && !reasoning.is_empty()
        {
            parts.push(gemini::Part {
                text: Some(reasoning),
                thought: Some(true),
                inline_data: None,
                function_call: None,
                function_response: None,
            });
        }

        if let Some(content) = choice.delta.content
            && !content.is_empty()
        {
            parts.push(gemini::Part::text(content));
        }

        for call in choice.delta.tool_calls.unwrap_or_default() {
            match call {
                unified::UnifiedStreamingToolCall::Start { index, function, .. } => {
                    self.pending_calls.insert(
                        index,
                        PendingCall {
                            name: function.name,
                            arguments: function.arguments,
                        },
                    );
                }
                unified::UnifiedStreamingToolCall::Delta { index, function } => {
                    if let Some(pending) = self.pending_calls.get_mut(&index) {
                        pending.arguments.push_str(&function.arguments);
                    }
                }
            }
        }

        let finish_reason = choice.finish_reason;

        if finish_reason.is_some() {
            let mut indexes: Vec<usize> = self.pending_calls.keys().copied().collect();
            indexes.sort_unstable();

            for index in indexes {
                let pending = self.pending_calls.remove(&index).expect("index just listed");
                let args: Value = serde_json::from_str(&pending.arguments)
                    .unwrap_or_else(|_| Value::Object(serde_json::Map::new()));

                parts.push(gemini::Part::function_call(pending.name, args));
            }
        }

        if parts.is_empty() && finish_reason.is_none() {
            return None;
        }

        Some(gemini::GenerateContentResponse {
            candidates: vec![gemini::Candidate {
                content: Some(gemini::Content {
                    role: Some(gemini::Role::Model),
                    parts,
                }),
                finish_reason: finish_reason.map(gemini::FinishReason::from),
                index: choice.index,
            }],
            usage_metadata: if finish_reason.is_some() { self.usage.take() } else { None },
            model_version: Some(chunk.model.into_owned()),
            response_id: Some(chunk.id.into_owned()),
        })
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    #[test]
    fn sanitizes_unsupported_schema_fields() {
        let schema = serde_json::json!({
            "type": "object",
            "$schema": "http://json-schema.org/draft-07/schema#",
            "additionalProperties": false,
            "properties": {
                "nested": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {"x": {"type": "string", "default": "y"}}
                }
            }
        });

        let clean = sanitize_schema(schema);

        assert!(clean.get("$schema").is_none());
        assert!(clean.get("additionalProperties").is_none());
        assert!(clean["properties"]["nested"].get("additionalProperties").is_none());
        assert!(clean["properties"]["nested"]["properties"]["x"].get("default").is_none());
    }

    #[test]
    fn tool_messages_become_function_responses() {
        let request = unified::UnifiedRequest {
            model: "gemini-2.0-flash".to_string(),
            messages: vec![
                unified::UnifiedMessage {
                    role: unified::UnifiedRole::Assistant,
                    content: unified::UnifiedContentContainer::Blocks(vec![]),
                    name: None,
                    tool_calls: Some(vec![unified::UnifiedToolCall {
                        id: "call_1".to_string(),
                        function: unified::UnifiedFunctionCall {
                            name: "get_weather".to_string(),
                            arguments: unified::UnifiedArguments::String("{\"city\":\"Paris\"}".to_string()),
                        },
                    }]),
                    tool_call_id: None,
                },
                unified::UnifiedMessage {
                    role: unified::UnifiedRole::Tool,
                    content: unified::UnifiedContentContainer::Text("18C".to_string()),
                    name: None,
                    tool_calls: None,
                    tool_call_id: Some("call_1".to_string()),
                },
            ],
            system: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: None,
            tools: None,
            tool_choice: None,
            metadata: None,
            extra: serde_json::Map::new(),
        };

        let wire = gemini::GenerateContentRequest::from(request);

        let call_part = &wire.contents[0].parts[0];
        assert_eq!(call_part.function_call.as_ref().unwrap().name, "get_weather");

        let response_part = &wire.contents[1].parts[0];
        let function_response = response_part.function_response.as_ref().unwrap();
        // The name is recovered from the correlated tool call.
        assert_eq!(function_response.name, "get_weather");
        assert_eq!(function_response.response["result"], "18C");
    }

    #[test]
    fn chunk_encoder_buffers_tool_fragments() {
        let mut encoder = ChunkEncoder::new();

        let start = encoder.encode(unified::UnifiedChunk {
            id: Cow::Borrowed("r1"),
            model: Cow::Borrowed("gemini-2.0-flash"),
            choices: vec![unified::UnifiedChoiceDelta {
                index: 0,
                delta: unified::UnifiedMessageDelta {
                    tool_calls: Some(vec![unified::UnifiedStreamingToolCall::Start {
                        index: 0,
                        id: "call_1".to_string(),
                        function: unified::UnifiedFunctionStart {
                            name: "search".to_string(),
                            arguments: "{\"q\":".to_string(),
                        },
                    }]),
                    ..Default::default()
                },
                finish_reason: None,
            }],
            usage: None,
            created: 0,
        });
        assert!(start.is_none());

        let terminal = encoder
            .encode(unified::UnifiedChunk {
                id: Cow::Borrowed("r1"),
                model: Cow::Borrowed("gemini-2.0-flash"),
                choices: vec![unified::UnifiedChoiceDelta {
                    index: 0,
                    delta: unified::UnifiedMessageDelta {
                        tool_calls: Some(vec![unified::UnifiedStreamingToolCall::Delta {
                            index: 0,
                            function: unified::UnifiedFunctionDelta {
                                arguments: "\"x\"}".to_string(),
                            },
                        }]),
                        ..Default::default()
                    },
                    finish_reason: Some(unified::UnifiedFinishReason::ToolCalls),
                }],
                usage: None,
                created: 0,
            })
            .unwrap();

        let parts = &terminal.candidates[0].content.as_ref().unwrap().parts;
        let call = parts[0].function_call.as_ref().unwrap();

        assert_eq!(call.name, "search");
        assert_eq!(call.args["q"], "x");
    }
}
