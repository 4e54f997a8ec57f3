//! Conversions from Anthropic wire types to unified types.

use crate::messages::{anthropic, unified};

impl From<anthropic::MessagesRequest> for unified::UnifiedRequest {
    fn from(req: anthropic::MessagesRequest) -> Self {
        Self {
            model: req.model,
            messages: req.messages.into_iter().map(unified::UnifiedMessage::from).collect(),
            system: req.system.map(unified::SystemContent::from),
            max_tokens: Some(req.max_tokens),
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            stop_sequences: req.stop_sequences,
            stream: req.stream,
            tools: req
                .tools
                .map(|t| t.into_iter().map(unified::UnifiedTool::from).collect()),
            tool_choice: req.tool_choice.map(unified::UnifiedToolChoice::from),
            metadata: req.metadata.map(|m| unified::UnifiedMetadata { user_id: m.user_id }),
            extra: req.extra,
        }
    }
}

impl From<anthropic::CountTokensRequest> for unified::UnifiedRequest {
    fn from(req: anthropic::CountTokensRequest) -> Self {
        Self {
            model: req.model,
            messages: req.messages.into_iter().map(unified::UnifiedMessage::from).collect(),
            system: req.system.map(unified::SystemContent::from),
            max_tokens: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: Some(false),
            tools: req
                .tools
                .map(|t| t.into_iter().map(unified::UnifiedTool::from).collect()),
            tool_choice: None,
            metadata: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl From<anthropic::System> for unified::SystemContent {
    fn from(system: anthropic::System) -> Self {
        match system {
            anthropic::System::Text(text) => unified::SystemContent::Text(text),
            anthropic::System::Blocks(blocks) => unified::SystemContent::Blocks(
                blocks
                    .into_iter()
                    .map(|anthropic::SystemBlock::Text { text, cache_control }| unified::SystemBlock {
                        text,
                        cache_control,
                    })
                    .collect(),
            ),
        }
    }
}

impl From<anthropic::Role> for unified::UnifiedRole {
    fn from(role: anthropic::Role) -> Self {
        match role {
            anthropic::Role::User => unified::UnifiedRole::User,
            anthropic::Role::Assistant => unified::UnifiedRole::Assistant,
        }
    }
}

impl From<anthropic::Message> for unified::UnifiedMessage {
    fn from(msg: anthropic::Message) -> Self {
        let content = match msg.content {
            anthropic::MessageContent::Text(text) => unified::UnifiedContentContainer::Text(text),
            anthropic::MessageContent::Blocks(blocks) => unified::UnifiedContentContainer::Blocks(
                blocks.into_iter().map(unified::UnifiedContent::from).collect(),
            ),
        };

        Self {
            role: msg.role.into(),
            content,
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

impl From<anthropic::ContentBlock> for unified::UnifiedContent {
    fn from(block: anthropic::ContentBlock) -> Self {
        match block {
            anthropic::ContentBlock::Text { text, cache_control } => {
                unified::UnifiedContent::Text { text, cache_control }
            }
            anthropic::ContentBlock::Image { source, cache_control } => unified::UnifiedContent::Image {
                source: source.into(),
                cache_control,
            },
            anthropic::ContentBlock::Thinking { thinking, signature } => {
                unified::UnifiedContent::Thinking { thinking, signature }
            }
            anthropic::ContentBlock::ToolUse {
                id,
                name,
                input,
                cache_control,
            } => unified::UnifiedContent::ToolUse {
                id,
                name,
                input,
                cache_control,
            },
            anthropic::ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
                cache_control,
            } => unified::UnifiedContent::ToolResult {
                tool_use_id,
                content: content
                    .map(unified::UnifiedToolResultContent::from)
                    .unwrap_or_else(|| unified::UnifiedToolResultContent::Text(String::new())),
                is_error,
                cache_control,
            },
        }
    }
}

impl From<anthropic::ToolResultContent> for unified::UnifiedToolResultContent {
    fn from(content: anthropic::ToolResultContent) -> Self {
        match content {
            anthropic::ToolResultContent::Text(text) => unified::UnifiedToolResultContent::Text(text),
            anthropic::ToolResultContent::Blocks(blocks) => {
                let mut texts: Vec<String> = blocks
                    .into_iter()
                    .map(|anthropic::ToolResultBlock::Text { text }| text)
                    .collect();

                if texts.len() == 1 {
                    unified::UnifiedToolResultContent::Text(texts.remove(0))
                } else {
                    unified::UnifiedToolResultContent::Multiple(texts)
                }
            }
        }
    }
}

impl From<anthropic::ImageSource> for unified::UnifiedImageSource {
    fn from(source: anthropic::ImageSource) -> Self {
        match source {
            anthropic::ImageSource::Base64 { media_type, data } => {
                unified::UnifiedImageSource::Base64 { media_type, data }
            }
            anthropic::ImageSource::Url { url } => unified::UnifiedImageSource::Url { url },
        }
    }
}

impl From<anthropic::Tool> for unified::UnifiedTool {
    fn from(tool: anthropic::Tool) -> Self {
        Self {
            function: unified::UnifiedFunction {
                name: tool.name,
                description: tool.description,
                parameters: tool.input_schema,
            },
        }
    }
}

impl From<anthropic::ToolChoice> for unified::UnifiedToolChoice {
    fn from(choice: anthropic::ToolChoice) -> Self {
        match choice {
            anthropic::ToolChoice::Auto => unified::UnifiedToolChoice::Mode(unified::UnifiedToolChoiceMode::Auto),
            anthropic::ToolChoice::None => unified::UnifiedToolChoice::Mode(unified::UnifiedToolChoiceMode::None),
            anthropic::ToolChoice::Any => unified::UnifiedToolChoice::Mode(unified::UnifiedToolChoiceMode::Required),
            anthropic::ToolChoice::Tool { name } => unified::UnifiedToolChoice::Specific {
                function: unified::UnifiedFunctionChoice { name },
            },
        }
    }
}

impl From<anthropic::StopReason> for unified::UnifiedFinishReason {
    fn from(reason: anthropic::StopReason) -> Self {
        match reason {
            anthropic::StopReason::EndTurn | anthropic::StopReason::StopSequence => unified::UnifiedFinishReason::Stop,
            anthropic::StopReason::MaxTokens => unified::UnifiedFinishReason::Length,
            anthropic::StopReason::ToolUse => unified::UnifiedFinishReason::ToolCalls,
            anthropic::StopReason::Refusal => unified::UnifiedFinishReason::ContentFilter,
            anthropic::StopReason::Other(other) => {
                log::warn!("Unknown Anthropic stop reason: {other}");
                unified::UnifiedFinishReason::Stop
            }
        }
    }
}

impl From<anthropic::StopReason> for unified::UnifiedStopReason {
    fn from(reason: anthropic::StopReason) -> Self {
        match reason {
            anthropic::StopReason::EndTurn | anthropic::StopReason::Refusal | anthropic::StopReason::Other(_) => {
                unified::UnifiedStopReason::EndTurn
            }
            anthropic::StopReason::MaxTokens => unified::UnifiedStopReason::MaxTokens,
            anthropic::StopReason::StopSequence => unified::UnifiedStopReason::StopSequence,
            anthropic::StopReason::ToolUse => unified::UnifiedStopReason::ToolUse,
        }
    }
}

impl From<anthropic::Usage> for unified::UnifiedUsage {
    fn from(usage: anthropic::Usage) -> Self {
        Self {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            total_tokens: usage.input_tokens + usage.output_tokens,
            cache_read_input_tokens: usage.cache_read_input_tokens,
            cache_creation_input_tokens: usage.cache_creation_input_tokens,
        }
    }
}

impl From<anthropic::MessagesResponse> for unified::UnifiedResponse {
    fn from(resp: anthropic::MessagesResponse) -> Self {
        let content: Vec<unified::UnifiedContent> = resp
            .content
            .into_iter()
            .filter(|block| !matches!(block, anthropic::ContentBlock::ToolResult { .. }))
            .map(unified::UnifiedContent::from)
            .collect();

        let (finish_reason, stop_reason) = match resp.stop_reason {
            Some(reason) => (
                Some(unified::UnifiedFinishReason::from(reason.clone())),
                Some(unified::UnifiedStopReason::from(reason)),
            ),
            None => (None, None),
        };

        Self {
            id: resp.id,
            model: resp.model,
            choices: vec![unified::UnifiedChoice {
                index: 0,
                message: unified::UnifiedMessage {
                    role: unified::UnifiedRole::Assistant,
                    content: unified::UnifiedContentContainer::Blocks(content),
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                },
                finish_reason,
            }],
            usage: resp.usage.into(),
            created: 0,
            stop_reason,
            stop_sequence: resp.stop_sequence,
        }
    }
}
