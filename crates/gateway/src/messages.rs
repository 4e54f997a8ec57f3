//! Wire types for every supported dialect plus the unified internal form.
//!
//! Conversion is a capability set per dialect: request-to-unified,
//! unified-to-request, response-to-unified, unified-to-response and the two
//! streaming directions, implemented as `From` impls and stream encoders in
//! the `unified` submodules and selected by [`Dialect`].

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod unified;

use serde::{Deserialize, Serialize};

/// A public request/response wire format the gateway accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// OpenAI chat-completions shape.
    OpenAi,
    /// Anthropic messages shape.
    Anthropic,
    /// Google Gemini generateContent shape.
    Gemini,
}

impl Dialect {
    /// The name used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "openai",
            Dialect::Anthropic => "anthropic",
            Dialect::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
