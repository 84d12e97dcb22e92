//! `cleanup` stage: asks a chat-completion model to tidy OCR Markdown.
//!
//! Sends `POST <api_url>` with an OpenAI-style body and takes
//! `choices[0].message.content` as the cleaned document. A code-fence
//! wrapper echoed back by the model is removed with [`strip_code_fence`].

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;

use crate::config::CleanupConfig;
use crate::models::{read_stream, stream_from_bytes, ByteStream, SourceDocument};
use crate::stage::Stage;

const SYSTEM_PROMPT: &str = "You are an AI that processes Markdown text. Your task is to clean up \
the input by fixing Markdown syntax, correcting spelling and grammar, and ensuring proper \
formatting. Do NOT include any extra explanations, comments, or surrounding text. Only return \
the valid Markdown output.";

const USER_PROMPT: &str = "Here is a Markdown file that was generated via OCR. Fix the Markdown \
formatting, correct any spelling and grammar errors, and ensure the syntax is valid. Do not add \
any explanations or comments, and do not surround the document text in a markdown code block. \
ONLY RETURN THE CLEANED MARKDOWN CONTENT AND NOTHING ELSE:\n\n";

const FENCE_OPEN: &str = "```markdown";
const FENCE_CLOSE: &str = "```";

pub struct CleanupStage {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl CleanupStage {
    pub fn new(config: &CleanupConfig, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key: api_key.to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    async fn complete(&self, text: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": format!("{}{}", USER_PROMPT, text) },
            ],
        });

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Chat completion API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        parse_completion(&json)
    }
}

/// Extracts `choices[0].message.content`.
fn parse_completion(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid chat completion response: missing choices[0].message.content"))
}

/// Removes a ```` ```markdown ```` … ```` ``` ```` wrapper around `text`.
///
/// Text that does not start with the opening marker (after leading
/// whitespace) is returned byte-for-byte unchanged, so applying this twice
/// equals applying it once.
pub fn strip_code_fence(text: &str) -> String {
    let Some(rest) = text.trim_start().strip_prefix(FENCE_OPEN) else {
        return text.to_string();
    };

    // Drop the remainder of the marker line.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => "",
    };
    let body = body.trim_end();
    let body = body.strip_suffix(FENCE_CLOSE).unwrap_or(body);
    body.trim().to_string()
}

#[async_trait]
impl Stage for CleanupStage {
    fn name(&self) -> &str {
        "cleanup"
    }

    async fn process(&self, _doc: &SourceDocument, input: ByteStream) -> Result<ByteStream> {
        let data = read_stream(input)
            .await
            .context("Failed to read document for cleanup")?;
        let text = String::from_utf8_lossy(&data);

        let cleaned = self.complete(&text).await?;
        Ok(stream_from_bytes(strip_code_fence(&cleaned)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_wrapped() {
        let wrapped = "```markdown\n# Title\n\nBody text.\n```\n";
        assert_eq!(strip_code_fence(wrapped), "# Title\n\nBody text.");
    }

    #[test]
    fn test_strip_is_idempotent() {
        let wrapped = "  ```markdown\n# Title\n```";
        let once = strip_code_fence(wrapped);
        assert_eq!(once, "# Title");
        assert_eq!(strip_code_fence(&once), once);
    }

    #[test]
    fn test_unwrapped_text_unchanged() {
        let plain = "# Title\n\n```rust\nfn main() {}\n```";
        assert_eq!(strip_code_fence(plain), plain);
        assert_eq!(strip_code_fence(&strip_code_fence(plain)), plain);
    }

    #[test]
    fn test_unwrapped_text_keeps_surrounding_whitespace() {
        for plain in ["  indented
", "
# Title

", "line
    code block
"] {
            assert_eq!(strip_code_fence(plain), plain);
        }
    }

    #[test]
    fn test_missing_closing_fence() {
        assert_eq!(strip_code_fence("```markdown\n# Title"), "# Title");
    }

    #[test]
    fn test_parse_completion() {
        let json = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "clean" } }]
        });
        assert_eq!(parse_completion(&json).unwrap(), "clean");

        let empty = serde_json::json!({ "choices": [] });
        assert!(parse_completion(&empty).is_err());
    }
}
