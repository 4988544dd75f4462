//! OpenAI-compatible chat completion responder.
//!
//! Posts the sender's conversation to `{endpoint}` and returns
//! `choices[0].message.content`. Works against llama.cpp, vLLM, Ollama's
//! OpenAI shim and the hosted APIs alike.
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::conversation::{ConversationStore, Turn};
use super::{is_ignorable, Responder, APOLOGY};
use crate::bridge::message::Message;
use crate::config::ResponderConfig;
use crate::logutil::truncate_for_log;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct HttpResponder {
    config: ResponderConfig,
    client: reqwest::Client,
    conversations: ConversationStore,
}

impl HttpResponder {
    pub fn new(config: ResponderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;
        let conversations = ConversationStore::new(config.max_history, config.system_prompt.clone());
        Ok(Self {
            config,
            client,
            conversations,
        })
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    async fn complete(&self, turns: &[Turn]) -> Result<String> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: turns,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
        };
        let mut request = self.client.post(&self.config.endpoint).json(&body);
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| anyhow!("HTTP request failed: {}", e))?;
        if !response.status().is_success() {
            return Err(anyhow!("API returned status: {}", response.status()));
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse JSON response: {}", e))?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

#[async_trait]
impl Responder for HttpResponder {
    async fn respond(&self, message: &Message) -> Result<Option<String>> {
        if is_ignorable(message.text()) {
            debug!("Not answering {}", truncate_for_log(message.text(), 40));
            return Ok(None);
        }
        let user = message.from_id();
        let turns = self.conversations.push_user(user, message.text().trim());
        let reply = self.complete(&turns).await?;
        let reply = reply.trim();
        if reply.is_empty() {
            warn!("Model returned an empty reply for {}", user);
            return Ok(Some(APOLOGY.to_string()));
        }
        self.conversations.record_assistant(user, reply);
        info!("Generated reply for {}: {}", user, truncate_for_log(reply, 80));
        Ok(Some(reply.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::message::Origin;
    use crate::responder::Role;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn msg(text: &str) -> Message {
        Message::new(
            text.to_string(),
            "!0000beef".to_string(),
            "broadcast".to_string(),
            true,
            Origin::DedicatedChannel,
        )
    }

    /// Serves one canned JSON response and hands back the raw request.
    async fn one_shot_server(body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });
        (format!("http://{}/v1/chat/completions", addr), task)
    }

    fn responder(endpoint: String) -> HttpResponder {
        HttpResponder::new(ResponderConfig {
            endpoint,
            system_prompt: "be brief".to_string(),
            timeout_secs: 5,
            ..ResponderConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn posts_history_and_records_reply() {
        let (endpoint, server) =
            one_shot_server(r#"{"choices":[{"message":{"role":"assistant","content":" Sunny. "}}]}"#)
                .await;
        let responder = responder(endpoint);
        let reply = responder.respond(&msg("weather?")).await.unwrap();
        assert_eq!(reply.as_deref(), Some("Sunny."));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/chat/completions"));
        assert!(request.contains(r#""role":"system","content":"be brief""#));
        assert!(request.contains(r#""content":"weather?""#));

        let history = responder.conversations().history("!0000beef");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn empty_model_output_becomes_apology() {
        let (endpoint, _server) = one_shot_server(r#"{"choices":[]}"#).await;
        let reply = responder(endpoint).respond(&msg("hello")).await.unwrap();
        assert_eq!(reply.as_deref(), Some(APOLOGY));
    }

    #[tokio::test]
    async fn status_broadcasts_are_not_sent_upstream() {
        // Nothing listens here; answering would fail the test.
        let responder = responder("http://127.0.0.1:9/unused".to_string());
        assert_eq!(responder.respond(&msg("📢 node online")).await.unwrap(), None);
        assert_eq!(responder.respond(&msg("k")).await.unwrap(), None);
    }
}
