//! OpenAI-compatible chat completion and embedding providers.
//!
//! Works with any endpoint that speaks the OpenAI chat completions and
//! embeddings APIs: OpenAI, Azure, Ollama, vLLM, LM Studio.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::{RetryConfig, resolve_api_key, with_retry};
use crate::config::{EmbeddingConfig, EmbeddingModelConfig, LlmConfig};
use crate::error::ProviderError;
use crate::provider::{CompletionProvider, EmbeddingProvider};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

fn build_client(timeout_secs: u64) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|e| ProviderError::InvalidConfig {
            message: format!("Failed to build HTTP client: {}", e),
        })
}

fn map_request_error(e: reqwest::Error, timeout_secs: u64) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout { timeout_secs }
    } else if e.is_connect() {
        ProviderError::Connection {
            message: e.to_string(),
        }
    } else {
        ProviderError::ApiRequest {
            message: format!("Request failed: {}", e),
        }
    }
}

/// Map an HTTP error status to a provider error.
fn map_http_error(status: reqwest::StatusCode, body: &str) -> ProviderError {
    match status.as_u16() {
        401 | 403 => {
            debug!(body = %body, %status, "Authentication failed");
            ProviderError::AuthFailed {
                provider: "OpenAI-compatible".to_string(),
            }
        }
        429 => {
            // "Rate limit reached ... Please try again in 20s."
            let retry_secs = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v.get("error")?.get("message")?.as_str().map(str::to_string))
                .and_then(|msg| {
                    msg.split("in ")
                        .last()
                        .and_then(|s| s.trim().trim_end_matches('.').trim_end_matches('s').parse::<u64>().ok())
                })
                .unwrap_or(5);
            ProviderError::RateLimited {
                retry_after_secs: retry_secs,
            }
        }
        code if code >= 500 => ProviderError::ApiRequest {
            message: format!("Server error ({}): {}", status, body),
        },
        _ => ProviderError::ApiRequest {
            message: format!("HTTP {}: {}", status, body),
        },
    }
}

/// Parse a single SSE data line. `None` for non-data lines and `[DONE]`.
fn parse_sse_line(line: &str) -> Option<Value> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return None;
    }
    serde_json::from_str(data).ok()
}

/// Accumulates raw stream bytes and yields complete lines. Decoding waits for
/// the newline so a multi-byte character split across chunks stays intact.
#[derive(Debug, Default)]
struct SseLineBuffer {
    bytes: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let newline = self.bytes.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.bytes.drain(..=newline).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }
}

fn parse_completion_body(body: &Value) -> Result<String, ProviderError> {
    body.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::ResponseParse {
            message: "No message content in response".to_string(),
        })
}

fn parse_embedding_body(body: &Value, expected: usize) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = body
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ProviderError::ResponseParse {
            message: "No data array in embedding response".to_string(),
        })?;
    if data.len() != expected {
        return Err(ProviderError::ResponseParse {
            message: format!("Expected {} embeddings, got {}", expected, data.len()),
        });
    }

    let mut items: Vec<(u64, Vec<f32>)> = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(position as u64);
        let vector = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ProviderError::ResponseParse {
                message: "Embedding item without vector".to_string(),
            })?
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Option<Vec<f32>>>()
            .ok_or_else(|| ProviderError::ResponseParse {
                message: "Non-numeric embedding value".to_string(),
            })?;
        items.push((index, vector));
    }
    items.sort_by_key(|(index, _)| *index);
    Ok(items.into_iter().map(|(_, v)| v).collect())
}

/// Chat completion provider over an OpenAI-compatible API.
pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: usize,
    timeout_secs: u64,
    retry: RetryConfig,
}

impl OpenAiCompatibleProvider {
    /// Create a provider for `model`, reading the API key from
    /// `config.api_key_env`. Local base URLs need no key.
    pub fn new(config: &LlmConfig, model: &str) -> Result<Self, ProviderError> {
        let api_key = resolve_api_key(&config.api_key_env, config.base_url.as_deref())?;
        Self::new_with_key(config, model, api_key)
    }

    pub fn new_with_key(
        config: &LlmConfig,
        model: &str,
        api_key: String,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.to_string(),
            max_tokens: config.max_tokens,
            timeout_secs: config.timeout_secs,
            retry: RetryConfig::from_llm(config),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_body(&self, prompt: &str, temperature: f32, stream: bool) -> Value {
        json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": temperature,
            "max_tokens": self.max_tokens,
            "stream": stream,
        })
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, model = %self.model, "Sending completion request");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| map_request_error(e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &body_text));
        }
        Ok(response)
    }

    async fn complete_once(&self, prompt: &str, temperature: f32) -> Result<String, ProviderError> {
        let response = self.send(&self.request_body(prompt, temperature, false)).await?;
        let json: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::ResponseParse {
                message: format!("Invalid JSON: {}", e),
            })?;
        parse_completion_body(&json)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatibleProvider {
    async fn complete(&self, prompt: &str, temperature: f32) -> Result<String, ProviderError> {
        with_retry(&self.retry, || self.complete_once(prompt, temperature)).await
    }

    async fn complete_streaming(
        &self,
        prompt: &str,
        temperature: f32,
        tx: mpsc::Sender<String>,
    ) -> Result<(), ProviderError> {
        // Only connecting is retried; a stream that already produced tokens is not.
        let body = self.request_body(prompt, temperature, true);
        let response = with_retry(&self.retry, || self.send(&body)).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = SseLineBuffer::default();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ProviderError::Streaming {
                message: format!("Failed to read stream: {}", e),
            })?;
            buffer.push(&chunk);

            while let Some(line) = buffer.next_line() {
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                if line == "data: [DONE]" {
                    return Ok(());
                }
                let Some(data) = parse_sse_line(&line) else {
                    continue;
                };
                if let Some(content) = data
                    .get("choices")
                    .and_then(|c| c.get(0))
                    .and_then(|c| c.get("delta"))
                    .and_then(|d| d.get("content"))
                    .and_then(|c| c.as_str())
                    && !content.is_empty()
                    && tx.send(content.to_string()).await.is_err()
                {
                    debug!("Token receiver dropped, stopping stream");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Embedding provider over an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbeddingProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
    timeout_secs: u64,
    retry: RetryConfig,
}

impl OpenAiEmbeddingProvider {
    pub fn new(model: &EmbeddingModelConfig, config: &EmbeddingConfig) -> Result<Self, ProviderError> {
        let api_key = resolve_api_key(&config.api_key_env, config.base_url.as_deref())?;
        let timeout_secs = 30;
        Ok(Self {
            client: build_client(timeout_secs)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.model.clone(),
            dimension: model.dimension,
            timeout_secs,
            retry: RetryConfig::default(),
        })
    }

    async fn embed_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await
            .map_err(|e| map_request_error(e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &body_text));
        }
        let json: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::ResponseParse {
                message: format!("Invalid JSON: {}", e),
            })?;
        parse_embedding_body(&json, texts.len())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| ProviderError::ResponseParse {
            message: "Empty embedding response".to_string(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        with_retry(&self.retry, || self.embed_once(texts)).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_http_error_mapping() {
        assert!(matches!(
            map_http_error(StatusCode::UNAUTHORIZED, "bad key"),
            ProviderError::AuthFailed { .. }
        ));
        assert!(matches!(
            map_http_error(StatusCode::FORBIDDEN, ""),
            ProviderError::AuthFailed { .. }
        ));
        assert!(matches!(
            map_http_error(StatusCode::INTERNAL_SERVER_ERROR, "oops"),
            ProviderError::ApiRequest { .. }
        ));
        assert!(matches!(
            map_http_error(StatusCode::BAD_REQUEST, "bad"),
            ProviderError::ApiRequest { .. }
        ));
    }

    #[test]
    fn test_http_error_mapping_429_reads_retry_after() {
        let body = r#"{"error": {"message": "Rate limit reached. Please try again in 20s."}}"#;
        match map_http_error(StatusCode::TOO_MANY_REQUESTS, body) {
            ProviderError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 20),
            other => panic!("unexpected {other:?}"),
        }
        match map_http_error(StatusCode::TOO_MANY_REQUESTS, "slow down") {
            ProviderError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 5),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_sse_line() {
        let data = parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#).unwrap();
        assert_eq!(data["choices"][0]["delta"]["content"], "Hi");
        assert!(parse_sse_line("data: [DONE]").is_none());
        assert!(parse_sse_line("event: ping").is_none());
    }

    #[test]
    fn test_line_buffer_keeps_split_glyph() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"检索\"}}]}\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xE6).unwrap() + 1;
        let mut buffer = SseLineBuffer::default();
        buffer.push(&line[..split]);
        assert!(buffer.next_line().is_none());
        buffer.push(&line[split..]);
        let data = parse_sse_line(&buffer.next_line().unwrap()).unwrap();
        assert_eq!(data["choices"][0]["delta"]["content"], "检索");
        assert!(buffer.next_line().is_none());
    }

    /// Serve one streaming completion, writing the body in `pieces`.
    fn serve_chunked_sse(pieces: Vec<Vec<u8>>) -> String {
        use std::io::{BufRead, BufReader, Read, Write};
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut content_length = 0;
            loop {
                let mut header = String::new();
                reader.read_line(&mut header).unwrap();
                let header = header.trim();
                if header.is_empty() {
                    break;
                }
                if let Some((name, value)) = header.split_once(':')
                    && name.eq_ignore_ascii_case("content-length")
                {
                    content_length = value.trim().parse().unwrap();
                }
            }
            let mut body = vec![0; content_length];
            reader.read_exact(&mut body).unwrap();

            let mut stream = stream;
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n",
                )
                .unwrap();
            for piece in pieces {
                stream.write_all(&piece).unwrap();
                stream.flush().unwrap();
                std::thread::sleep(Duration::from_millis(30));
            }
        });
        format!("http://{addr}/v1")
    }

    #[tokio::test]
    async fn test_streaming_reassembles_glyph_split_across_chunks() {
        let event = "data: {\"choices\":[{\"delta\":{\"content\":\"检索\"}}]}\n\ndata: [DONE]\n\n";
        let bytes = event.as_bytes();
        let split = bytes.iter().position(|&b| b == 0xE6).unwrap() + 1;
        let base_url = serve_chunked_sse(vec![bytes[..split].to_vec(), bytes[split..].to_vec()]);

        let config = LlmConfig {
            base_url: Some(base_url),
            retry_attempts: 1,
            ..Default::default()
        };
        let provider =
            OpenAiCompatibleProvider::new_with_key(&config, "local-model", "k".into()).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        provider.complete_streaming("hi", 0.0, tx).await.unwrap();

        let mut answer = String::new();
        while let Some(token) = rx.recv().await {
            answer.push_str(&token);
        }
        assert_eq!(answer, "检索");
    }

    #[test]
    fn test_parse_completion_body() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "Paris"}}]});
        assert_eq!(parse_completion_body(&body).unwrap(), "Paris");
        assert!(matches!(
            parse_completion_body(&json!({"choices": []})),
            Err(ProviderError::ResponseParse { .. })
        ));
    }

    #[test]
    fn test_parse_embedding_body_orders_by_index() {
        let body = json!({"data": [
            {"index": 1, "embedding": [0.0, 1.0]},
            {"index": 0, "embedding": [1.0, 0.0]},
        ]});
        let vectors = parse_embedding_body(&body, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!(parse_embedding_body(&body, 3).is_err());
        assert!(parse_embedding_body(&json!({"data": [{"embedding": ["x"]}]}), 1).is_err());
    }

    #[test]
    fn test_custom_base_url_trimmed() {
        let config = LlmConfig {
            base_url: Some("http://localhost:8000/v1/".into()),
            ..Default::default()
        };
        let provider =
            OpenAiCompatibleProvider::new_with_key(&config, "local-model", "k".into()).unwrap();
        assert_eq!(provider.base_url(), "http://localhost:8000/v1");
        assert_eq!(provider.model_name(), "local-model");
    }

    #[test]
    fn test_new_missing_key() {
        let config = LlmConfig {
            api_key_env: "ADAPTRAG_TEST_KEY_THAT_IS_NEVER_SET".into(),
            base_url: None,
            ..Default::default()
        };
        assert!(matches!(
            OpenAiCompatibleProvider::new(&config, "gpt-4o"),
            Err(ProviderError::AuthFailed { .. })
        ));
    }
}
