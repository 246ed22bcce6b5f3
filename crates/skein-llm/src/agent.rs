use futures::future::BoxFuture;
use tracing::debug;

use skein_core::config::{ModelConfig, RetryConfig};
use skein_core::error::Result;
use skein_core::toolcall::tool_call_instructions;
use skein_core::traits::Agent;

use crate::client::{ChatClient, ChatTurn};
use crate::retry::with_retry;

/// An `Agent` backed by a chat completion endpoint.
///
/// Each `chat` call is a single stateless completion: the system prompt
/// (with tool-call instructions when tools are available) plus the prompt.
pub struct ChatAgent {
    id: String,
    model: ModelConfig,
    system_prompt: String,
    retry: RetryConfig,
    client: ChatClient,
}

impl ChatAgent {
    pub fn new(id: impl Into<String>, model: ModelConfig) -> Self {
        let retry = model.retry.clone().unwrap_or_default();
        Self {
            id: id.into(),
            model,
            system_prompt: String::new(),
            retry,
            client: ChatClient::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Advertise tools in the system prompt.
    pub fn with_tools(mut self, tool_names: &[String]) -> Self {
        let instructions = tool_call_instructions(tool_names);
        if !instructions.is_empty() {
            if !self.system_prompt.is_empty() {
                self.system_prompt.push_str("\n\n");
            }
            self.system_prompt.push_str(&instructions);
        }
        self
    }

    pub fn with_client(mut self, client: ChatClient) -> Self {
        self.client = client;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    fn messages(&self, prompt: &str) -> Vec<ChatTurn> {
        let mut messages = Vec::with_capacity(2);
        if !self.system_prompt.is_empty() {
            messages.push(ChatTurn::system(&self.system_prompt));
        }
        messages.push(ChatTurn::user(prompt));
        messages
    }
}

impl Agent for ChatAgent {
    fn chat(&self, prompt: &str) -> BoxFuture<'_, Result<String>> {
        let messages = self.messages(prompt);
        Box::pin(async move {
            debug!(agent_id = %self.id, model = %self.model.model_id, "Agent chat");
            with_retry(&self.retry, || self.client.complete(&self.model, &messages)).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn model(base_url: Option<String>) -> ModelConfig {
        ModelConfig {
            provider: "openai".into(),
            model_id: "test-model".into(),
            api_key: Some("sk-test".into()),
            base_url,
            max_tokens: 64,
            temperature: 0.0,
            retry: Some(RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
            }),
        }
    }

    /// Serve `responses` in order, one per connection, and return the URL.
    async fn serve(responses: Vec<(u16, String)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut sock, _) = listener.accept().await.unwrap();
                read_request(&mut sock).await;
                counter.fetch_add(1, Ordering::SeqCst);
                let reply = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                sock.write_all(reply.as_bytes()).await.unwrap();
                sock.shutdown().await.ok();
            }
        });

        (format!("http://{}/v1/chat/completions", addr), hits)
    }

    async fn read_request(sock: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = sock.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(head_end) = text.find("\r\n\r\n") {
                let content_length = text[..head_end]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if buf.len() >= head_end + 4 + content_length {
                    return;
                }
            }
        }
    }

    fn completion(content: &str) -> String {
        serde_json::json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}]
        })
        .to_string()
    }

    #[test]
    fn test_system_prompt_includes_tools() {
        let agent = ChatAgent::new("mail", model(None))
            .with_system_prompt("You handle email.")
            .with_tools(&["send_email".to_string()]);
        assert!(agent.system_prompt().starts_with("You handle email."));
        assert!(agent.system_prompt().contains("send_email"));

        let messages = agent.messages("hi");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");

        let bare = ChatAgent::new("chat", model(None)).with_tools(&[]);
        assert_eq!(bare.messages("hi").len(), 1);
    }

    #[tokio::test]
    async fn test_chat_returns_completion() {
        let (url, hits) = serve(vec![(200, completion("Hello from the model"))]).await;
        let agent = ChatAgent::new("chat", model(Some(url)));

        let reply = agent.chat("hi").await.unwrap();
        assert_eq!(reply, "Hello from the model");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_chat_retries_server_errors() {
        let (url, hits) = serve(vec![
            (503, r#"{"error":"overloaded"}"#.to_string()),
            (200, completion("second time lucky")),
        ])
        .await;
        let agent = ChatAgent::new("chat", model(Some(url)));

        let reply = agent.chat("hi").await.unwrap();
        assert_eq!(reply, "second time lucky");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_chat_surfaces_client_errors() {
        let (url, _) = serve(vec![(401, r#"{"error":"bad key"}"#.to_string())]).await;
        let agent = ChatAgent::new("chat", model(Some(url)));

        let err = agent.chat("hi").await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
