//! Conversions from unified types to Anthropic wire types, including the
//! stateful encoder that turns a unified chunk stream into the typed SSE
//! event sequence of the messages dialect.

use std::collections::HashMap;

use serde_json::Value;

use crate::messages::{anthropic, unified};

impl From<unified::UnifiedRequest> for anthropic::MessagesRequest {
    fn from(req: unified::UnifiedRequest) -> Self {
        Self {
            model: req.model,
            messages: req.messages.into_iter().map(anthropic::Message::from).collect(),
            max_tokens: req.max_tokens.unwrap_or(4096),
            system: req.system.map(anthropic::System::from),
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            stop_sequences: req.stop_sequences,
            stream: req.stream,
            metadata: req.metadata.map(|m| anthropic::Metadata { user_id: m.user_id }),
            tools: req
                .tools
                .map(|t| t.into_iter().map(anthropic::Tool::from).collect()),
            tool_choice: req.tool_choice.map(anthropic::ToolChoice::from),
            extra: req.extra,
        }
    }
}

impl From<unified::SystemContent> for anthropic::System {
    fn from(system: unified::SystemContent) -> Self {
        match system {
            unified::SystemContent::Text(text) => anthropic::System::Text(text),
            unified::SystemContent::Blocks(blocks) => anthropic::System::Blocks(
                blocks
                    .into_iter()
                    .map(|block| anthropic::SystemBlock::Text {
                        text: block.text,
                        cache_control: block.cache_control,
                    })
                    .collect(),
            ),
        }
    }
}

impl From<unified::UnifiedMessage> for anthropic::Message {
    fn from(msg: unified::UnifiedMessage) -> Self {
        // Tool-role messages fold into a user turn as a tool_result block.
        if msg.role == unified::UnifiedRole::Tool {
            let tool_use_id = msg.tool_call_id.unwrap_or_default();
            let text = msg.content.visible_text();

            return Self {
                role: anthropic::Role::User,
                content: anthropic::MessageContent::Blocks(vec![anthropic::ContentBlock::ToolResult {
                    tool_use_id,
                    content: Some(anthropic::ToolResultContent::Text(text)),
                    is_error: None,
                    cache_control: None,
                }]),
            };
        }

        let role = match msg.role {
            unified::UnifiedRole::Assistant => anthropic::Role::Assistant,
            _ => anthropic::Role::User,
        };

        let mut blocks = match msg.content {
            unified::UnifiedContentContainer::Text(text) => {
                vec![anthropic::ContentBlock::Text {
                    text,
                    cache_control: None,
                }]
            }
            unified::UnifiedContentContainer::Blocks(content) => content
                .into_iter()
                .filter_map(anthropic_block)
                .collect(),
        };

        // OpenAI-shaped tool calls become tool_use blocks unless the content
        // already carries them.
        if !blocks.iter().any(|b| matches!(b, anthropic::ContentBlock::ToolUse { .. }))
            && let Some(calls) = msg.tool_calls
        {
            for call in calls {
                blocks.push(anthropic::ContentBlock::ToolUse {
                    id: call.id,
                    name: call.function.name,
                    input: normalize_tool_input(call.function.arguments.to_json_value()),
                    cache_control: None,
                });
            }
        }

        Self {
            role,
            content: anthropic::MessageContent::Blocks(blocks),
        }
    }
}

fn anthropic_block(block: unified::UnifiedContent) -> Option<anthropic::ContentBlock> {
    match block {
        unified::UnifiedContent::Text { text, cache_control } => {
            Some(anthropic::ContentBlock::Text { text, cache_control })
        }
        unified::UnifiedContent::Image { source, cache_control } => Some(anthropic::ContentBlock::Image {
            source: source.into(),
            cache_control,
        }),
        unified::UnifiedContent::Thinking { thinking, signature } => {
            Some(anthropic::ContentBlock::Thinking { thinking, signature })
        }
        unified::UnifiedContent::ToolUse {
            id,
            name,
            input,
            cache_control,
        } => Some(anthropic::ContentBlock::ToolUse {
            id,
            name,
            input,
            cache_control,
        }),
        unified::UnifiedContent::ToolResult {
            tool_use_id,
            content,
            is_error,
            cache_control,
        } => Some(anthropic::ContentBlock::ToolResult {
            tool_use_id,
            content: Some(content.into()),
            is_error,
            cache_control,
        }),
        unified::UnifiedContent::InputAudio { .. } | unified::UnifiedContent::File { .. } => {
            log::warn!("Dropping content block unsupported by the Anthropic dialect");
            None
        }
    }
}

fn normalize_tool_input(input: Value) -> Value {
    if input.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        input
    }
}

impl From<unified::UnifiedToolResultContent> for anthropic::ToolResultContent {
    fn from(content: unified::UnifiedToolResultContent) -> Self {
        match content {
            unified::UnifiedToolResultContent::Text(text) => anthropic::ToolResultContent::Text(text),
            unified::UnifiedToolResultContent::Multiple(parts) => anthropic::ToolResultContent::Blocks(
                parts
                    .into_iter()
                    .map(|text| anthropic::ToolResultBlock::Text { text })
                    .collect(),
            ),
        }
    }
}

impl From<unified::UnifiedImageSource> for anthropic::ImageSource {
    fn from(source: unified::UnifiedImageSource) -> Self {
        match source {
            unified::UnifiedImageSource::Base64 { media_type, data } => {
                anthropic::ImageSource::Base64 { media_type, data }
            }
            unified::UnifiedImageSource::Url { url } => anthropic::ImageSource::Url { url },
        }
    }
}

impl From<unified::UnifiedTool> for anthropic::Tool {
    fn from(tool: unified::UnifiedTool) -> Self {
        Self {
            name: tool.function.name,
            description: tool.function.description,
            input_schema: tool.function.parameters,
        }
    }
}

impl From<unified::UnifiedToolChoice> for anthropic::ToolChoice {
    fn from(choice: unified::UnifiedToolChoice) -> Self {
        match choice {
            unified::UnifiedToolChoice::Mode(unified::UnifiedToolChoiceMode::Auto) => anthropic::ToolChoice::Auto,
            unified::UnifiedToolChoice::Mode(unified::UnifiedToolChoiceMode::None) => anthropic::ToolChoice::None,
            unified::UnifiedToolChoice::Mode(unified::UnifiedToolChoiceMode::Required) => anthropic::ToolChoice::Any,
            unified::UnifiedToolChoice::Specific { function } => anthropic::ToolChoice::Tool { name: function.name },
        }
    }
}

impl From<unified::UnifiedFinishReason> for anthropic::StopReason {
    fn from(reason: unified::UnifiedFinishReason) -> Self {
        match reason {
            unified::UnifiedFinishReason::Stop => anthropic::StopReason::EndTurn,
            unified::UnifiedFinishReason::Length => anthropic::StopReason::MaxTokens,
            unified::UnifiedFinishReason::ContentFilter => anthropic::StopReason::Refusal,
            unified::UnifiedFinishReason::ToolCalls => anthropic::StopReason::ToolUse,
            unified::UnifiedFinishReason::Error => anthropic::StopReason::EndTurn,
        }
    }
}

impl From<unified::UnifiedUsage> for anthropic::Usage {
    fn from(usage: unified::UnifiedUsage) -> Self {
        Self {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cache_read_input_tokens: usage.cache_read_input_tokens,
            cache_creation_input_tokens: usage.cache_creation_input_tokens,
        }
    }
}

impl From<unified::UnifiedResponse> for anthropic::MessagesResponse {
    fn from(resp: unified::UnifiedResponse) -> Self {
        let stop_reason = resp
            .stop_reason
            .map(|reason| match reason {
                unified::UnifiedStopReason::EndTurn => anthropic::StopReason::EndTurn,
                unified::UnifiedStopReason::MaxTokens => anthropic::StopReason::MaxTokens,
                unified::UnifiedStopReason::StopSequence => anthropic::StopReason::StopSequence,
                unified::UnifiedStopReason::ToolUse => anthropic::StopReason::ToolUse,
            })
            .or_else(|| {
                resp.choices
                    .first()
                    .and_then(|c| c.finish_reason)
                    .map(anthropic::StopReason::from)
            });

        let content = resp
            .choices
            .into_iter()
            .next()
            .map(|choice| response_blocks(choice.message))
            .unwrap_or_default();

        Self {
            id: resp.id,
            r#type: "message".to_string(),
            role: anthropic::Role::Assistant,
            content,
            model: resp.model,
            stop_reason,
            stop_sequence: resp.stop_sequence,
            usage: resp.usage.into(),
        }
    }
}

fn response_blocks(message: unified::UnifiedMessage) -> Vec<anthropic::ContentBlock> {
    let mut blocks = Vec::new();

    match message.content {
        unified::UnifiedContentContainer::Text(text) if !text.is_empty() => {
            blocks.push(anthropic::ContentBlock::Text {
                text,
                cache_control: None,
            });
        }
        unified::UnifiedContentContainer::Blocks(content) => {
            blocks.extend(
                content
                    .into_iter()
                    .filter(|b| !matches!(b, unified::UnifiedContent::ToolResult { .. }))
                    .filter_map(anthropic_block),
            );
        }
        _ => {}
    }

    if !blocks.iter().any(|b| matches!(b, anthropic::ContentBlock::ToolUse { .. }))
        && let Some(calls) = message.tool_calls
    {
        for call in calls {
            blocks.push(anthropic::ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input: normalize_tool_input(call.function.arguments.to_json_value()),
                cache_control: None,
            });
        }
    }

    blocks
}

/// Kinds of content block an encoder can have open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    None,
    Text,
    Thinking,
    /// A tool_use block keyed by the unified stream tool-call index.
    Tool(usize),
}

/// Stateful encoder from unified chunks to the typed Anthropic SSE events.
///
/// Tracks the open content block so text, thinking and tool_use segments each
/// get their own `content_block_start`/`content_block_stop` lifecycle with
/// increasing indexes, and emits the terminal `message_delta`/`message_stop`
/// pair exactly once.
pub struct EventEncoder {
    started: bool,
    finished: bool,
    next_block_index: u32,
    open: OpenBlock,
    /// Unified stream tool-call index to Anthropic block index.
    tool_blocks: HashMap<usize, u32>,
    usage: anthropic::Usage,
}

impl EventEncoder {
    /// A fresh encoder for one stream.
    pub fn new() -> Self {
        Self {
            started: false,
            finished: false,
            next_block_index: 0,
            open: OpenBlock::None,
            tool_blocks: HashMap::new(),
            usage: anthropic::Usage::default(),
        }
    }

    /// Encode one unified chunk into zero or more events, in order.
    pub fn encode(&mut self, chunk: unified::UnifiedChunk) -> Vec<anthropic::StreamEvent> {
        if self.finished {
            return Vec::new();
        }

        let mut events = Vec::new();

        if !self.started {
            self.started = true;

            if let Some(usage) = &chunk.usage {
                self.usage = usage.clone().into();
            }

            events.push(anthropic::StreamEvent::MessageStart {
                message: anthropic::StreamMessageStart {
                    id: chunk.id.clone().into_owned(),
                    r#type: "message".to_string(),
                    role: anthropic::Role::Assistant,
                    content: Vec::new(),
                    model: chunk.model.clone().into_owned(),
                    usage: self.usage.clone(),
                },
            });
        }

        if let Some(usage) = chunk.usage {
            self.usage = usage.into();
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        if let Some(reasoning) = choice.delta.reasoning
            && !reasoning.is_empty()
        {
            self.ensure_open(OpenBlock::Thinking, &mut events);
            events.push(anthropic::StreamEvent::ContentBlockDelta {
                index: self.current_index(),
                delta: anthropic::ContentDelta::ThinkingDelta { thinking: reasoning },
            });
        }

        if let Some(content) = choice.delta.content
            && !content.is_empty()
        {
            self.ensure_open(OpenBlock::Text, &mut events);
            events.push(anthropic::StreamEvent::ContentBlockDelta {
                index: self.current_index(),
                delta: anthropic::ContentDelta::TextDelta { text: content },
            });
        }

        for call in choice.delta.tool_calls.unwrap_or_default() {
            match call {
                unified::UnifiedStreamingToolCall::Start { index, id, function } => {
                    self.close_open(&mut events);

                    let block_index = self.next_block_index;
                    self.next_block_index += 1;
                    self.tool_blocks.insert(index, block_index);
                    self.open = OpenBlock::Tool(index);

                    events.push(anthropic::StreamEvent::ContentBlockStart {
                        index: block_index,
                        content_block: anthropic::ContentBlock::ToolUse {
                            id,
                            name: function.name,
                            input: Value::Object(serde_json::Map::new()),
                            cache_control: None,
                        },
                    });

                    if !function.arguments.is_empty() {
                        events.push(anthropic::StreamEvent::ContentBlockDelta {
                            index: block_index,
                            delta: anthropic::ContentDelta::InputJsonDelta {
                                partial_json: function.arguments,
                            },
                        });
                    }
                }
                unified::UnifiedStreamingToolCall::Delta { index, function } => {
                    if let Some(&block_index) = self.tool_blocks.get(&index) {
                        events.push(anthropic::StreamEvent::ContentBlockDelta {
                            index: block_index,
                            delta: anthropic::ContentDelta::InputJsonDelta {
                                partial_json: function.arguments,
                            },
                        });
                    }
                }
            }
        }

        if let Some(finish_reason) = choice.finish_reason {
            self.close_open(&mut events);
            self.finished = true;

            events.push(anthropic::StreamEvent::MessageDelta {
                delta: anthropic::MessageDeltaData {
                    stop_reason: Some(finish_reason.into()),
                    stop_sequence: None,
                },
                usage: self.usage.clone(),
            });
            events.push(anthropic::StreamEvent::MessageStop);
        }

        events
    }

    /// Close the stream if the upstream ended without a terminal chunk.
    pub fn finish(&mut self) -> Vec<anthropic::StreamEvent> {
        if self.finished || !self.started {
            return Vec::new();
        }

        let mut events = Vec::new();
        self.close_open(&mut events);
        self.finished = true;

        events.push(anthropic::StreamEvent::MessageDelta {
            delta: anthropic::MessageDeltaData {
                stop_reason: Some(anthropic::StopReason::EndTurn),
                stop_sequence: None,
            },
            usage: self.usage.clone(),
        });
        events.push(anthropic::StreamEvent::MessageStop);

        events
    }

    fn current_index(&self) -> u32 {
        self.next_block_index - 1
    }

    fn ensure_open(&mut self, kind: OpenBlock, events: &mut Vec<anthropic::StreamEvent>) {
        if self.open == kind {
            return;
        }

        self.close_open(events);

        let block_index = self.next_block_index;
        self.next_block_index += 1;
        self.open = kind;

        let content_block = match kind {
            OpenBlock::Thinking => anthropic::ContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
            _ => anthropic::ContentBlock::Text {
                text: String::new(),
                cache_control: None,
            },
        };

        events.push(anthropic::StreamEvent::ContentBlockStart {
            index: block_index,
            content_block,
        });
    }

    fn close_open(&mut self, events: &mut Vec<anthropic::StreamEvent>) {
        if self.open != OpenBlock::None {
            events.push(anthropic::StreamEvent::ContentBlockStop {
                index: self.current_index(),
            });
            self.open = OpenBlock::None;
        }
    }
}

impl Default for EventEncoder {
    fn default() -> Self {
        Self::new()
    }
}
