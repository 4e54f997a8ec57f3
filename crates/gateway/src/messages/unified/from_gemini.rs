//! Conversions from Gemini wire types to unified types.
//!
//! The dialect carries no tool-call ids, so ids are synthesized when
//! converting calls and matched back to results by function name.

use std::borrow::Cow;
use std::collections::HashMap;

use crate::messages::{gemini, unified};

impl From<gemini::GenerateContentRequest> for unified::UnifiedRequest {
    fn from(req: gemini::GenerateContentRequest) -> Self {
        let system = req.system_instruction.map(|content| {
            unified::SystemContent::Text(
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        });

        // functionResponse parts refer to calls by name only; remember the
        // synthesized id of the most recent call per function name.
        let mut call_ids: HashMap<String, String> = HashMap::new();
        let mut call_counter = 0usize;

        let messages = req
            .contents
            .into_iter()
            .map(|content| convert_content(content, &mut call_ids, &mut call_counter))
            .collect();

        let config = req.generation_config.unwrap_or_default();

        Self {
            model: String::new(),
            messages,
            system,
            max_tokens: config.max_output_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            stop_sequences: config.stop_sequences,
            stream: None,
            tools: convert_tools(req.tools),
            tool_choice: req.tool_config.and_then(convert_tool_config),
            metadata: None,
            extra: serde_json::Map::new(),
        }
    }
}

fn convert_content(
    content: gemini::Content,
    call_ids: &mut HashMap<String, String>,
    call_counter: &mut usize,
) -> unified::UnifiedMessage {
    let role = match content.role {
        Some(gemini::Role::Model) => unified::UnifiedRole::Assistant,
        _ => unified::UnifiedRole::User,
    };

    let mut blocks = Vec::with_capacity(content.parts.len());

    for part in content.parts {
        if let Some(call) = part.function_call {
            *call_counter += 1;
            let id = format!("call_{call_counter}");
            call_ids.insert(call.name.clone(), id.clone());

            blocks.push(unified::UnifiedContent::ToolUse {
                id,
                name: call.name,
                input: call.args,
                cache_control: None,
            });
        } else if let Some(response) = part.function_response {
            let tool_use_id = call_ids
                .get(&response.name)
                .cloned()
                .unwrap_or_else(|| format!("call_{name}", name = response.name));

            blocks.push(unified::UnifiedContent::ToolResult {
                tool_use_id,
                content: unified::UnifiedToolResultContent::Text(
                    serde_json::to_string(&response.response).unwrap_or_default(),
                ),
                is_error: None,
                cache_control: None,
            });
        } else if let Some(blob) = part.inline_data {
            blocks.push(unified::UnifiedContent::Image {
                source: unified::UnifiedImageSource::Base64 {
                    media_type: blob.mime_type,
                    data: blob.data,
                },
                cache_control: None,
            });
        } else if let Some(text) = part.text {
            if part.thought == Some(true) {
                blocks.push(unified::UnifiedContent::Thinking {
                    thinking: text,
                    signature: None,
                });
            } else {
                blocks.push(unified::UnifiedContent::Text {
                    text,
                    cache_control: None,
                });
            }
        }
    }

    unified::UnifiedMessage {
        role,
        content: unified::UnifiedContentContainer::Blocks(blocks),
        name: None,
        tool_calls: None,
        tool_call_id: None,
    }
}

fn convert_tools(tools: Option<Vec<gemini::Tool>>) -> Option<Vec<unified::UnifiedTool>> {
    let tools: Vec<unified::UnifiedTool> = tools?
        .into_iter()
        .flat_map(|tool| tool.function_declarations.unwrap_or_default())
        .map(|decl| unified::UnifiedTool {
            function: unified::UnifiedFunction {
                name: decl.name,
                description: decl.description,
                parameters: decl.parameters.unwrap_or_else(|| serde_json::json!({"type": "object"})),
            },
        })
        .collect();

    if tools.is_empty() { None } else { Some(tools) }
}

fn convert_tool_config(config: gemini::ToolConfig) -> Option<unified::UnifiedToolChoice> {
    let calling = config.function_calling_config?;

    if calling.mode == gemini::FunctionCallingMode::Any
        && let Some(mut names) = calling.allowed_function_names
        && names.len() == 1
    {
        return Some(unified::UnifiedToolChoice::Specific {
            function: unified::UnifiedFunctionChoice { name: names.remove(0) },
        });
    }

    let mode = match calling.mode {
        gemini::FunctionCallingMode::None => unified::UnifiedToolChoiceMode::None,
        gemini::FunctionCallingMode::Auto => unified::UnifiedToolChoiceMode::Auto,
        gemini::FunctionCallingMode::Any => unified::UnifiedToolChoiceMode::Required,
    };

    Some(unified::UnifiedToolChoice::Mode(mode))
}

impl From<gemini::FinishReason> for unified::UnifiedFinishReason {
    fn from(reason: gemini::FinishReason) -> Self {
        match reason {
            gemini::FinishReason::Stop => unified::UnifiedFinishReason::Stop,
            gemini::FinishReason::MaxTokens => unified::UnifiedFinishReason::Length,
            gemini::FinishReason::Safety | gemini::FinishReason::Recitation => {
                unified::UnifiedFinishReason::ContentFilter
            }
            gemini::FinishReason::Other(other) => {
                log::warn!("Unknown Gemini finish reason: {other}");
                unified::UnifiedFinishReason::Stop
            }
        }
    }
}

impl From<gemini::UsageMetadata> for unified::UnifiedUsage {
    fn from(usage: gemini::UsageMetadata) -> Self {
        Self {
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count + usage.thoughts_token_count.unwrap_or(0),
            total_tokens: usage.total_token_count,
            cache_read_input_tokens: None,
            cache_creation_input_tokens: None,
        }
    }
}

impl From<gemini::GenerateContentResponse> for unified::UnifiedResponse {
    fn from(resp: gemini::GenerateContentResponse) -> Self {
        let mut call_ids = HashMap::new();
        let mut call_counter = 0usize;

        let choices = resp
            .candidates
            .into_iter()
            .map(|candidate| {
                let mut message = candidate
                    .content
                    .map(|content| convert_content(content, &mut call_ids, &mut call_counter))
                    .unwrap_or_else(|| unified::UnifiedMessage::text(unified::UnifiedRole::Assistant, ""));
                message.role = unified::UnifiedRole::Assistant;

                // The dialect reports STOP even when the model called a tool.
                let has_tool_calls = message.compute_tool_calls().is_some();
                let finish_reason = match candidate.finish_reason.map(unified::UnifiedFinishReason::from) {
                    Some(unified::UnifiedFinishReason::Stop) if has_tool_calls => {
                        Some(unified::UnifiedFinishReason::ToolCalls)
                    }
                    other => other,
                };

                unified::UnifiedChoice {
                    index: candidate.index,
                    message,
                    finish_reason,
                }
            })
            .collect();

        Self {
            id: resp
                .response_id
                .unwrap_or_else(|| format!("gen-{}", uuid::Uuid::new_v4())),
            model: resp.model_version.unwrap_or_default(),
            choices,
            usage: resp.usage_metadata.map(unified::UnifiedUsage::from).unwrap_or_default(),
            created: 0,
            stop_reason: None,
            stop_sequence: None,
        }
    }
}

/// One streamed Gemini chunk as a unified chunk.
///
/// Tool calls arrive as whole `functionCall` parts, so each one becomes a
/// complete `Start` fragment with the full argument string.
impl From<gemini::GenerateContentResponse> for unified::UnifiedChunk {
    fn from(resp: gemini::GenerateContentResponse) -> Self {
        let id = resp.response_id.unwrap_or_default();
        let model = resp.model_version.unwrap_or_default();

        let choices = resp
            .candidates
            .into_iter()
            .map(|candidate| {
                let mut delta = unified::UnifiedMessageDelta::default();
                let mut tool_calls = Vec::new();
                let mut call_counter = 0usize;

                if let Some(content) = candidate.content {
                    for part in content.parts {
                        if let Some(call) = part.function_call {
                            let index = call_counter;
                            call_counter += 1;

                            tool_calls.push(unified::UnifiedStreamingToolCall::Start {
                                index,
                                id: format!("call_{}", uuid::Uuid::new_v4()),
                                function: unified::UnifiedFunctionStart {
                                    name: call.name,
                                    arguments: serde_json::to_string(&call.args)
                                        .unwrap_or_else(|_| "{}".to_string()),
                                },
                            });
                        } else if let Some(text) = part.text {
                            if part.thought == Some(true) {
                                delta.reasoning = Some(match delta.reasoning.take() {
                                    Some(mut existing) => {
                                        existing.push_str(&text);
                                        existing
                                    }
                                    None => text,
                                });
                            } else {
                                delta.content = Some(match delta.content.take() {
                                    Some(mut existing) => {
                                        existing.push_str(&text);
                                        existing
                                    }
                                    None => text,
                                });
                            }
                        }
                    }
                }

                if !tool_calls.is_empty() {
                    delta.tool_calls = Some(tool_calls);
                }

                let has_tool_calls = delta.tool_calls.is_some();
                let finish_reason = match candidate.finish_reason.map(unified::UnifiedFinishReason::from) {
                    Some(unified::UnifiedFinishReason::Stop) if has_tool_calls => {
                        Some(unified::UnifiedFinishReason::ToolCalls)
                    }
                    other => other,
                };

                unified::UnifiedChoiceDelta {
                    index: candidate.index,
                    delta,
                    finish_reason,
                }
            })
            .collect();

        Self {
            id: Cow::Owned(id),
            model: Cow::Owned(model),
            choices,
            usage: resp.usage_metadata.map(unified::UnifiedUsage::from),
            created: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn function_responses_correlate_by_name() {
        let request: gemini::GenerateContentRequest = serde_json::from_value(json!({
            "contents": [
                {"role": "user", "parts": [{"text": "weather?"}]},
                {"role": "model", "parts": [{"functionCall": {"name": "get_weather", "args": {"city": "Paris"}}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "get_weather", "response": {"result": "18C"}}}]}
            ]
        }))
        .unwrap();

        let unified = unified::UnifiedRequest::from(request);

        let unified::UnifiedContentContainer::Blocks(call_blocks) = &unified.messages[1].content else {
            unreachable!("expected blocks");
        };
        let unified::UnifiedContent::ToolUse { id: call_id, .. } = &call_blocks[0] else {
            unreachable!("expected tool use");
        };

        let unified::UnifiedContentContainer::Blocks(result_blocks) = &unified.messages[2].content else {
            unreachable!("expected blocks");
        };
        let unified::UnifiedContent::ToolResult { tool_use_id, .. } = &result_blocks[0] else {
            unreachable!("expected tool result");
        };

        assert_eq!(call_id, tool_use_id);
    }

    #[test]
    fn stop_with_tool_calls_becomes_tool_calls() {
        let response: gemini::GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"functionCall": {"name": "f", "args": {}}}]},
                "finishReason": "STOP",
                "index": 0
            }]
        }))
        .unwrap();

        let unified = unified::UnifiedResponse::from(response);
        assert_eq!(
            unified.choices[0].finish_reason,
            Some(unified::UnifiedFinishReason::ToolCalls)
        );
    }

    #[test]
    fn thought_parts_become_reasoning_in_chunks() {
        let chunk: gemini::GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "pondering", "thought": true},
                    {"text": "Hello"}
                ]},
                "index": 0
            }]
        }))
        .unwrap();

        let unified = unified::UnifiedChunk::from(chunk);
        let delta = &unified.choices[0].delta;

        assert_eq!(delta.reasoning.as_deref(), Some("pondering"));
        assert_eq!(delta.content.as_deref(), Some("Hello"));
    }

    #[test]
    fn usage_counts_thoughts_as_completion() {
        let usage: gemini::UsageMetadata = serde_json::from_value(json!({
            "promptTokenCount": 10,
            "candidatesTokenCount": 5,
            "thoughtsTokenCount": 7,
            "totalTokenCount": 22
        }))
        .unwrap();

        let unified = unified::UnifiedUsage::from(usage);
        assert_eq!(unified.completion_tokens, 12);
    }
}
