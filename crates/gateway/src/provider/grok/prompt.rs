//! Collapsing a unified conversation into the single prompt string the
//! web-chat backend accepts.
//!
//! The backend takes one user message per turn, so the whole history is
//! rendered as `role: text` lines with a generated system block up front;
//! only the final user message is passed through verbatim. Binary parts are
//! extracted for separate upload.

use crate::messages::unified::{
    SystemContent, UnifiedContent, UnifiedContentContainer, UnifiedMessage, UnifiedRequest, UnifiedRole,
    UnifiedToolChoice, UnifiedToolChoiceMode,
};

/// A binary part extracted from the conversation for upload.
pub(super) struct Attachment {
    /// Base64 payload.
    pub data: String,
    /// MIME type when known.
    pub mime_type: String,
    /// Upload filename.
    pub file_name: String,
}

/// The collapsed prompt plus the parts to upload.
pub(super) struct CollapsedPrompt {
    pub message: String,
    pub attachments: Vec<Attachment>,
}

/// Collapse the request into one prompt string.
pub(super) fn collapse(request: &UnifiedRequest) -> CollapsedPrompt {
    let mut attachments = Vec::new();
    let mut sections: Vec<String> = Vec::new();

    if let Some(system) = system_block(request) {
        sections.push(system);
    }

    let last_user_index = request
        .messages
        .iter()
        .rposition(|msg| matches!(msg.role, UnifiedRole::User));

    for (index, message) in request.messages.iter().enumerate() {
        let text = render_message(message, &mut attachments);

        if text.is_empty() {
            continue;
        }

        // The final user message goes out verbatim, without a role prefix.
        if Some(index) == last_user_index && index == request.messages.len() - 1 {
            sections.push(text);
            continue;
        }

        let role = match message.role {
            UnifiedRole::Assistant => "assistant",
            UnifiedRole::System => "system",
            _ => "user",
        };

        sections.push(format!("{role}: {text}"));
    }

    CollapsedPrompt {
        message: sections.join("\n\n"),
        attachments,
    }
}

fn render_message(message: &UnifiedMessage, attachments: &mut Vec<Attachment>) -> String {
    // Tool results render as user-visible text prefixed with their origin.
    if message.role == UnifiedRole::Tool {
        let name = message.name.as_deref().unwrap_or("unknown");
        let id = message.tool_call_id.as_deref().unwrap_or("-");
        let text = message.content.visible_text();

        return format!("tool ({name}, {id}): {text}");
    }

    let mut parts: Vec<String> = Vec::new();

    match &message.content {
        UnifiedContentContainer::Text(text) => {
            if !text.is_empty() {
                parts.push(text.clone());
            }
        }
        UnifiedContentContainer::Blocks(blocks) => {
            for block in blocks {
                match block {
                    UnifiedContent::Text { text, .. } => {
                        if !text.is_empty() {
                            parts.push(text.clone());
                        }
                    }
                    UnifiedContent::Image { source, .. } => {
                        use crate::messages::unified::UnifiedImageSource;

                        match source {
                            UnifiedImageSource::Base64 { media_type, data } => attachments.push(Attachment {
                                data: data.clone(),
                                mime_type: media_type.clone(),
                                file_name: format!("image-{}.bin", attachments.len()),
                            }),
                            UnifiedImageSource::Url { url } => parts.push(format!("![image]({url})")),
                        }
                    }
                    UnifiedContent::File { data, media_type } => attachments.push(Attachment {
                        data: data.clone(),
                        mime_type: media_type.clone().unwrap_or_else(|| "application/octet-stream".to_string()),
                        file_name: format!("file-{}.bin", attachments.len()),
                    }),
                    UnifiedContent::ToolResult {
                        tool_use_id, content, ..
                    } => {
                        parts.push(format!("tool (unknown, {tool_use_id}): {}", content.joined()));
                    }
                    UnifiedContent::Thinking { .. } | UnifiedContent::InputAudio { .. } => {}
                    UnifiedContent::ToolUse { name, input, .. } => {
                        parts.push(render_tool_call(name, input));
                    }
                }
            }
        }
    }

    // Tool calls carried in the OpenAI shape.
    if !parts.iter().any(|p| p.starts_with("<tool_call>"))
        && let Some(calls) = &message.tool_calls
    {
        for call in calls {
            parts.push(render_tool_call(&call.function.name, &call.function.arguments.to_json_value()));
        }
    }

    parts.join("\n")
}

fn render_tool_call(name: &str, arguments: &serde_json::Value) -> String {
    let payload = serde_json::json!({ "name": name, "arguments": arguments });
    format!("<tool_call>{payload}</tool_call>")
}

/// Generated system block: caller system prompt, the tool schema in Markdown
/// and the tool-choice contract.
fn system_block(request: &UnifiedRequest) -> Option<String> {
    let mut lines: Vec<String> = Vec::new();

    if let Some(system) = &request.system {
        let text = match system {
            SystemContent::Text(text) => text.clone(),
            SystemContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        };

        if !text.is_empty() {
            lines.push(format!("system: {text}"));
        }
    }

    if let Some(tools) = &request.tools
        && !tools.is_empty()
    {
        lines.push("system: You have access to the following tools:".to_string());

        for tool in tools {
            let description = tool.function.description.as_deref().unwrap_or("");
            lines.push(format!(
                "### {name}\n{description}\nInput schema:\n```json\n{schema}\n```",
                name = tool.function.name,
                schema = tool.function.parameters,
            ));
        }

        lines.push(
            "To call a tool, reply with a `<tool_call>{\"name\": ..., \"arguments\": ...}</tool_call>` \
             block and nothing after it."
                .to_string(),
        );

        match &request.tool_choice {
            Some(UnifiedToolChoice::Mode(UnifiedToolChoiceMode::None)) => {
                lines.push("Do not call any tool for this request.".to_string());
            }
            Some(UnifiedToolChoice::Mode(UnifiedToolChoiceMode::Required)) => {
                lines.push("You must call at least one tool before answering.".to_string());
            }
            Some(UnifiedToolChoice::Specific { function }) => {
                lines.push(format!("You must call the tool `{}`.", function.name));
            }
            _ => {}
        }
    }

    if lines.is_empty() { None } else { Some(lines.join("\n\n")) }
}
