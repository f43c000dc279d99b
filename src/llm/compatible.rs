//! Chat backend speaking the OpenAI-compatible `/chat/completions` API.

use anyhow::Context;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::sse::{SseBuffer, parse_data_lines};
use super::traits::{BoxFuture, ChatBackend, ChatStream};

pub struct OpenAiCompatibleChat {
    name: String,
    /// Pre-computed chat completions URL.
    cached_chat_url: String,
    /// Pre-computed `Authorization` header value.
    cached_auth_header: String,
    client: Client,
}

impl OpenAiCompatibleChat {
    /// `base_url` is the API root including its version segment,
    /// e.g. `https://api.openai.com/v1`.
    pub fn new(name: &str, base_url: &str, api_key: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let cached_chat_url = if base.ends_with("chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        };
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            name: name.to_string(),
            cached_chat_url,
            cached_auth_header: format!("Bearer {api_key}"),
            client,
        }
    }

    pub fn chat_url(&self) -> &str {
        &self.cached_chat_url
    }

    fn request_body<'a>(
        system_prompt: Option<&'a str>,
        prompt: &'a str,
        model: &'a str,
        temperature: f64,
        stream: bool,
    ) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt {
            messages.push(Message {
                role: "system",
                content: system,
            });
        }
        messages.push(Message {
            role: "user",
            content: prompt,
        });
        ChatRequest {
            model,
            messages,
            temperature,
            stream: stream.then_some(true),
        }
    }

    async fn post(&self, body: &ChatRequest<'_>) -> anyhow::Result<reqwest::Response> {
        let resp = self
            .client
            .post(&self.cached_chat_url)
            .header("Authorization", &self.cached_auth_header)
            .json(body)
            .send()
            .await
            .with_context(|| format!("{} request failed", self.name))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("{} API error {status}: {}", self.name, truncate(&text, 200));
        }
        Ok(resp)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

impl ChatBackend for OpenAiCompatibleChat {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn generate_text<'a>(
        &'a self,
        system_prompt: Option<&'a str>,
        prompt: &'a str,
        model: &'a str,
        temperature: f64,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            let body = Self::request_body(system_prompt, prompt, model, temperature, false);
            let resp = self.post(&body).await?;
            let parsed: ChatResponse = resp
                .json()
                .await
                .with_context(|| format!("{} returned an unreadable body", self.name))?;
            parsed
                .choices
                .into_iter()
                .find_map(|c| c.message.content)
                .filter(|text| !text.trim().is_empty())
                .ok_or_else(|| anyhow::anyhow!("{} returned no completion text", self.name))
        })
    }

    fn generate_stream<'a>(
        &'a self,
        system_prompt: Option<&'a str>,
        prompt: &'a str,
        model: &'a str,
        temperature: f64,
    ) -> BoxFuture<'a, anyhow::Result<ChatStream>> {
        Box::pin(async move {
            let body = Self::request_body(system_prompt, prompt, model, temperature, true);
            let resp = self.post(&body).await?;
            let mut byte_stream = resp.bytes_stream();

            let stream = async_stream::try_stream! {
                let mut sse_buffer = SseBuffer::new();
                while let Some(chunk) = byte_stream.next().await {
                    sse_buffer.push_chunk(&chunk?);
                    while let Some(event_block) = sse_buffer.next_event_block() {
                        for data in parse_data_lines(&event_block) {
                            let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(data) else {
                                continue;
                            };
                            for choice in chunk.choices {
                                if let Some(text) = choice.delta.content
                                    && !text.is_empty()
                                {
                                    yield text;
                                }
                            }
                        }
                    }
                }
            };
            Ok(Box::pin(stream) as ChatStream)
        })
    }
}
