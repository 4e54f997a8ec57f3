//! Stateful reconstruction of the web-chat event stream into unified chunks.
//!
//! The backend interleaves visible tokens, thinking tokens, media-generation
//! progress and housekeeping records on one noisy stream. The reconstructor
//! owns all per-response state; it is created per stream task and dropped on
//! the terminal delta or on stream error, so nothing outlives the stream.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::messages::unified::{
    UnifiedChoiceDelta, UnifiedChunk, UnifiedFinishReason, UnifiedFunctionStart, UnifiedMessageDelta, UnifiedRole,
    UnifiedStreamingToolCall,
};

const OPEN_TAG: &str = "<tool_call>";
const CLOSE_TAG: &str = "</tool_call>";

/// One parsed line of the backend's response stream.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct GrokEvent {
    /// Generated text fragment.
    #[serde(default)]
    pub token: Option<String>,

    /// Whether the fragment is model reasoning.
    #[serde(default)]
    pub is_thinking: Option<bool>,

    /// Response identity; stable across the stream.
    #[serde(default)]
    pub response_id: Option<String>,

    /// Progressive image generation status.
    #[serde(default)]
    pub streaming_image_generation_response: Option<MediaProgress>,

    /// Progressive video generation status.
    #[serde(default)]
    pub streaming_video_generation_response: Option<MediaProgress>,

    /// Final model metadata record.
    #[serde(default)]
    pub model_response: Option<ModelResponse>,

    /// A card attachment rendered into the content.
    #[serde(default)]
    pub card_attachment: Option<CardAttachment>,

    /// Finalisation marker.
    #[serde(default)]
    pub is_done: Option<bool>,
}

/// Media generation progress.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct MediaProgress {
    #[serde(default)]
    pub progress: Option<u32>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
}

/// Final model metadata.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ModelResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub generated_image_urls: Option<Vec<String>>,
}

/// A card attachment.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CardAttachment {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
}

/// Per-response reconstruction state, owned by the stream task.
pub(super) struct Reconstructor {
    model: String,
    response_id: String,
    asset_base: Option<Url>,
    /// Raw content including tool_call tags, parsed at finalisation.
    content: String,
    /// Unemitted text held back by the tag scanner.
    carry: String,
    tool_capture: bool,
    role_sent: bool,
    image_active: bool,
    video_active: bool,
    finished: bool,
}

impl Reconstructor {
    pub fn new(model: String, asset_base: Option<Url>) -> Self {
        Self {
            model,
            response_id: String::new(),
            asset_base,
            content: String::new(),
            carry: String::new(),
            tool_capture: false,
            role_sent: false,
            image_active: false,
            video_active: false,
            finished: false,
        }
    }

    /// Process one backend event into zero or more unified chunks.
    pub fn process(&mut self, event: GrokEvent) -> Vec<UnifiedChunk> {
        if self.finished {
            return Vec::new();
        }

        let mut chunks = Vec::new();

        if let Some(id) = &event.response_id
            && self.response_id.is_empty()
        {
            self.response_id = id.clone();
        }

        if !self.role_sent {
            self.role_sent = true;
            chunks.push(self.chunk(
                UnifiedMessageDelta {
                    role: Some(UnifiedRole::Assistant),
                    ..Default::default()
                },
                None,
            ));
        }

        if let Some(image) = &event.streaming_image_generation_response {
            let progress = image.progress.unwrap_or(0);
            self.image_active = progress < 100 && image.image_url.is_none();

            chunks.push(self.reasoning_chunk(format!("Generating image… {progress}%")));
        }

        if let Some(video) = &event.streaming_video_generation_response {
            let progress = video.progress.unwrap_or(0);

            if let Some(video_url) = &video.video_url {
                self.video_active = false;
                let url = self.absolutize(video_url);
                chunks.push(self.content_chunk(format!("\n[video]({url})\n")));
            } else {
                self.video_active = true;
                chunks.push(self.reasoning_chunk(format!("Generating video… {progress}%")));
            }
        }

        if let Some(token) = &event.token
            && !token.is_empty()
        {
            let cleaned = strip_internal_tags(token);

            if event.is_thinking == Some(true) || self.image_active || self.video_active {
                if !cleaned.is_empty() {
                    chunks.push(self.reasoning_chunk(cleaned.into_owned()));
                }
            } else {
                self.content.push_str(&cleaned);
                let visible = self.scan_visible(&cleaned);

                if !visible.is_empty() {
                    chunks.push(self.content_chunk(visible));
                }
            }
        }

        if let Some(card) = &event.card_attachment {
            let rendered = render_card(card);
            if !rendered.is_empty() {
                chunks.push(self.content_chunk(rendered));
            }
        }

        if let Some(model_response) = &event.model_response
            && let Some(urls) = &model_response.generated_image_urls
            && !urls.is_empty()
        {
            let links = urls
                .iter()
                .map(|url| format!("![image]({})", self.absolutize(url)))
                .collect::<Vec<_>>()
                .join("\n");

            chunks.push(self.content_chunk(format!("\n{links}\n")));
        }

        if event.is_done == Some(true) || event.model_response.is_some() {
            chunks.push(self.finalize());
        }

        chunks
    }

    /// Terminal chunk for a stream the backend ended without a marker.
    pub fn finish(&mut self) -> Option<UnifiedChunk> {
        if self.finished {
            return None;
        }

        Some(self.finalize())
    }

    /// Parse accumulated content for tool_call blocks and emit the terminal
    /// delta.
    fn finalize(&mut self) -> UnifiedChunk {
        self.finished = true;

        let tool_calls = parse_tool_calls(&self.content);

        if tool_calls.is_empty() {
            return self.chunk(UnifiedMessageDelta::default(), Some(UnifiedFinishReason::Stop));
        }

        let calls = tool_calls
            .into_iter()
            .enumerate()
            .map(|(index, (name, arguments))| UnifiedStreamingToolCall::Start {
                index,
                id: format!("call_{}", uuid::Uuid::new_v4()),
                function: UnifiedFunctionStart { name, arguments },
            })
            .collect();

        self.chunk(
            UnifiedMessageDelta {
                tool_calls: Some(calls),
                ..Default::default()
            },
            Some(UnifiedFinishReason::ToolCalls),
        )
    }

    /// Visible text of a token, holding back anything inside tool_call tags
    /// and any trailing fragment that may be the start of one.
    fn scan_visible(&mut self, token: &str) -> String {
        self.carry.push_str(token);
        let mut out = String::new();

        loop {
            if self.tool_capture {
                if let Some(pos) = self.carry.find(CLOSE_TAG) {
                    self.carry.drain(..pos + CLOSE_TAG.len());
                    self.tool_capture = false;
                } else {
                    let hold = partial_suffix_len(&self.carry, CLOSE_TAG);
                    let consumed = self.carry.len() - hold;
                    self.carry.drain(..consumed);
                    break;
                }
            } else if let Some(pos) = self.carry.find(OPEN_TAG) {
                out.push_str(&self.carry[..pos]);
                self.carry.drain(..pos + OPEN_TAG.len());
                self.tool_capture = true;
            } else {
                let hold = partial_suffix_len(&self.carry, OPEN_TAG);
                let emit = self.carry.len() - hold;
                out.push_str(&self.carry[..emit]);
                self.carry.drain(..emit);
                break;
            }
        }

        out
    }

    fn absolutize(&self, url: &str) -> String {
        if url.contains("://") {
            return url.to_string();
        }

        match &self.asset_base {
            Some(base) => base
                .join(url.trim_start_matches('/'))
                .map(|joined| joined.to_string())
                .unwrap_or_else(|_| url.to_string()),
            None => url.to_string(),
        }
    }

    fn chunk(&self, delta: UnifiedMessageDelta, finish_reason: Option<UnifiedFinishReason>) -> UnifiedChunk {
        UnifiedChunk {
            id: Cow::Owned(self.response_id.clone()),
            model: Cow::Owned(self.model.clone()),
            choices: vec![UnifiedChoiceDelta {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
            created: 0,
        }
    }

    fn content_chunk(&self, content: String) -> UnifiedChunk {
        self.chunk(
            UnifiedMessageDelta {
                content: Some(content),
                ..Default::default()
            },
            None,
        )
    }

    fn reasoning_chunk(&self, reasoning: String) -> UnifiedChunk {
        self.chunk(
            UnifiedMessageDelta {
                reasoning: Some(reasoning),
                ..Default::default()
            },
            None,
        )
    }
}

/// Longest proper suffix of `haystack` that is a prefix of `tag`.
fn partial_suffix_len(haystack: &str, tag: &str) -> usize {
    let max = haystack.len().min(tag.len() - 1);

    for len in (1..=max).rev() {
        let start = haystack.len() - len;
        if haystack.is_char_boundary(start) && tag.starts_with(&haystack[start..]) {
            return len;
        }
    }

    0
}

/// Strip backend housekeeping tags from emitted text.
fn strip_internal_tags(text: &str) -> Cow<'_, str> {
    static TAGS: OnceLock<Regex> = OnceLock::new();

    let regex = TAGS.get_or_init(|| {
        Regex::new(r"</?(?:xai:tool_usage_card|rolloutId|responseId|isThinking)[^>]*>")
            .expect("internal tag pattern is valid")
    });

    regex.replace_all(text, "")
}

fn render_card(card: &CardAttachment) -> String {
    match (&card.title, &card.url) {
        (Some(title), Some(url)) => match &card.snippet {
            Some(snippet) => format!("\n[{title}]({url})\n{snippet}\n"),
            None => format!("\n[{title}]({url})\n"),
        },
        (Some(title), None) => format!("\n{title}\n"),
        _ => card.snippet.clone().unwrap_or_default(),
    }
}

/// All `<tool_call>{…}</tool_call>` blocks of the accumulated content as
/// `(name, arguments_json)` pairs. Malformed blocks are skipped.
fn parse_tool_calls(content: &str) -> Vec<(String, String)> {
    #[derive(Deserialize)]
    struct ToolCallPayload {
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
    }

    let mut calls = Vec::new();
    let mut rest = content;

    while let Some(start) = rest.find(OPEN_TAG) {
        let after_open = &rest[start + OPEN_TAG.len()..];

        let Some(end) = after_open.find(CLOSE_TAG) else {
            break;
        };

        let payload = after_open[..end].trim();

        match serde_json::from_str::<ToolCallPayload>(payload) {
            Ok(parsed) => {
                let arguments = match &parsed.arguments {
                    serde_json::Value::String(raw) => raw.clone(),
                    other => other.to_string(),
                };
                calls.push((parsed.name, arguments));
            }
            Err(e) => log::warn!("Skipping malformed tool_call block: {e}"),
        }

        rest = &after_open[end + CLOSE_TAG.len()..];
    }

    calls
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(text: &str) -> GrokEvent {
        GrokEvent {
            token: Some(text.to_string()),
            ..Default::default()
        }
    }

    fn thinking_token(text: &str) -> GrokEvent {
        GrokEvent {
            token: Some(text.to_string()),
            is_thinking: Some(true),
            ..Default::default()
        }
    }

    fn done() -> GrokEvent {
        GrokEvent {
            is_done: Some(true),
            ..Default::default()
        }
    }

    fn contents(chunks: &[UnifiedChunk]) -> Vec<String> {
        chunks
            .iter()
            .filter_map(|c| c.choices[0].delta.content.clone())
            .collect()
    }

    #[test]
    fn reconstructs_tool_call_stream() {
        let mut state = Reconstructor::new("grok-4".to_string(), None);
        let mut all = Vec::new();

        for event in [
            token("Hello "),
            token("<tool_call>"),
            token(r#"{"name":"search","arguments":{"q":"x"}}"#),
            token("</tool_call>"),
            token(" done"),
            done(),
        ] {
            all.extend(state.process(event));
        }

        // Role first, then the visible fragments, then the terminal delta.
        assert_eq!(all[0].choices[0].delta.role, Some(UnifiedRole::Assistant));
        assert_eq!(contents(&all), vec!["Hello ".to_string(), " done".to_string()]);

        let terminal = all.last().unwrap();
        assert_eq!(terminal.choices[0].finish_reason, Some(UnifiedFinishReason::ToolCalls));

        let calls = terminal.choices[0].delta.tool_calls.as_ref().unwrap();
        let UnifiedStreamingToolCall::Start { id, function, .. } = &calls[0] else {
            unreachable!("expected start");
        };
        assert!(id.starts_with("call_"));
        assert_eq!(function.name, "search");
        assert_eq!(function.arguments, r#"{"q":"x"}"#);
    }

    #[test]
    fn detects_tags_split_across_fragments() {
        let mut state = Reconstructor::new("grok-4".to_string(), None);
        let mut all = Vec::new();

        for event in [
            token("Hi <tool_"),
            token("call>{\"name\":\"f\",\"arguments\":{}}</tool_"),
            token("call> bye"),
            done(),
        ] {
            all.extend(state.process(event));
        }

        assert_eq!(contents(&all).join(""), "Hi  bye");

        let terminal = all.last().unwrap();
        assert_eq!(terminal.choices[0].finish_reason, Some(UnifiedFinishReason::ToolCalls));
    }

    #[test]
    fn plain_stream_finishes_with_stop() {
        let mut state = Reconstructor::new("grok-4".to_string(), None);
        let mut all = Vec::new();

        for event in [token("Hello"), token(" world"), done()] {
            all.extend(state.process(event));
        }

        assert_eq!(contents(&all).join(""), "Hello world");
        assert_eq!(
            all.last().unwrap().choices[0].finish_reason,
            Some(UnifiedFinishReason::Stop)
        );
    }

    #[test]
    fn thinking_tokens_stay_on_the_reasoning_channel() {
        let mut state = Reconstructor::new("grok-4".to_string(), None);

        let chunks = state.process(thinking_token("pondering"));
        let reasoning: Vec<_> = chunks
            .iter()
            .filter_map(|c| c.choices[0].delta.reasoning.clone())
            .collect();

        assert_eq!(reasoning, vec!["pondering".to_string()]);
        assert!(contents(&chunks).is_empty());
    }

    #[test]
    fn tokens_during_image_generation_are_reasoning() {
        let mut state = Reconstructor::new("grok-4".to_string(), None);

        state.process(GrokEvent {
            streaming_image_generation_response: Some(MediaProgress {
                progress: Some(40),
                image_url: None,
                video_url: None,
            }),
            ..Default::default()
        });

        let chunks = state.process(token("rendering"));
        assert!(contents(&chunks).is_empty());
        assert!(chunks[0].choices[0].delta.reasoning.is_some());
    }

    #[test]
    fn internal_tags_are_stripped() {
        let cleaned = strip_internal_tags("a<rolloutId value=\"1\">b<isThinking true>c</xai:tool_usage_card>d");
        assert_eq!(cleaned, "abcd");
    }

    #[test]
    fn schemeless_asset_urls_are_rewritten() {
        let base: Url = "https://assets.grok.com".parse().unwrap();
        let state = Reconstructor::new("grok-4".to_string(), Some(base));

        assert_eq!(
            state.absolutize("users/123/generated/1.jpg"),
            "https://assets.grok.com/users/123/generated/1.jpg"
        );
        assert_eq!(state.absolutize("https://elsewhere.example/x.png"), "https://elsewhere.example/x.png");
    }

    #[test]
    fn generated_image_urls_become_markdown_links() {
        let base: Url = "https://assets.grok.com".parse().unwrap();
        let mut state = Reconstructor::new("grok-4".to_string(), Some(base));

        let chunks = state.process(GrokEvent {
            model_response: Some(ModelResponse {
                message: None,
                generated_image_urls: Some(vec!["users/1/img.jpg".to_string()]),
            }),
            ..Default::default()
        });

        let content = contents(&chunks).join("");
        assert!(content.contains("![image](https://assets.grok.com/users/1/img.jpg)"));

        // The model_response record is also the finalisation.
        assert_eq!(
            chunks.last().unwrap().choices[0].finish_reason,
            Some(UnifiedFinishReason::Stop)
        );
    }

    #[test]
    fn events_after_finalisation_are_ignored() {
        let mut state = Reconstructor::new("grok-4".to_string(), None);

        state.process(token("hi"));
        state.process(done());

        assert!(state.process(token("late")).is_empty());
        assert!(state.finish().is_none());
    }
}
