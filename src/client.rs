use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use reqwest::Client;
use reqwest_eventsource::{retry, Event, EventSource};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{ClientConfig, PromptSource};
use crate::progress::ProgressSink;

#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: PromptSource,
    pub max_tokens: u32,
}

/// Timing and token accounting for one completed generation.
#[derive(Clone, Debug, PartialEq)]
pub struct Generation {
    /// Time from sending the request to the first content chunk.
    pub ttft: Duration,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[async_trait]
pub trait TextGenerationClient: Send + Sync {
    /// Runs one streamed generation. Any transport, status or stream error is
    /// returned as `Err` and no partial data is reported.
    async fn generate(
        &self,
        request: &GenerationRequest,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<Generation>;
}

/// Streaming client for OpenAI-compatible `/chat/completions` endpoints.
#[derive(Clone, Debug)]
pub struct OpenAiClient {
    http: Client,
    config: ClientConfig,
}

impl OpenAiClient {
    pub fn try_new(config: ClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify)
            .tcp_nodelay(true)
            .build()
            .context("failed to construct HTTP client")?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the id of the first model listed by `GET /models`.
    pub async fn first_available_model(&self) -> Result<String> {
        let url = self.config.endpoint("models")?;
        let response = self
            .http
            .get(url)
            .headers(self.config.headers.clone())
            .send()
            .await
            .context("failed to list models")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("listing models failed ({}) {}", status, body));
        }

        let models: ModelList = response
            .json()
            .await
            .context("model list is not valid JSON")?;
        models
            .data
            .into_iter()
            .next()
            .map(|model| model.id)
            .ok_or_else(|| anyhow!("no models available from {}", self.config.base_url))
    }

    fn request_body(&self, request: &GenerationRequest) -> Value {
        let content = match &request.prompt {
            PromptSource::Text(text) => text.clone(),
            PromptSource::RandomWords { num_words } => {
                random_prompt(*num_words, &mut rand::thread_rng())
            }
        };
        let limit_field = if self.config.use_max_completion_tokens {
            "max_completion_tokens"
        } else {
            "max_tokens"
        };

        let mut body = json!({
            "model": request.model,
            "messages": [
                {
                    "role": "user",
                    "content": content,
                }
            ],
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(map) = body.as_object_mut() {
            map.insert(limit_field.to_string(), json!(request.max_tokens));
        }
        body
    }
}

#[async_trait]
impl TextGenerationClient for OpenAiClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<Generation> {
        let url = self.config.endpoint("chat/completions")?;
        let body = self.request_body(request);

        let start = Instant::now();
        let builder = self
            .http
            .post(url)
            .headers(self.config.headers.clone())
            .json(&body);
        let mut source = EventSource::new(builder).context("failed to open event stream")?;
        source.set_retry_policy(Box::new(retry::Never));

        let mut tally = StreamTally::default();
        while let Some(event) = source.next().await {
            match event {
                Ok(Event::Open) => debug!("event stream opened"),
                Ok(Event::Message(message)) => {
                    if message.data.trim() == "[DONE]" {
                        break;
                    }
                    match tally.observe(&message.data, Instant::now()) {
                        Ok(0) => {}
                        Ok(tokens) => {
                            if let Some(sink) = progress {
                                sink.record_tokens(tokens);
                            }
                        }
                        Err(err) => {
                            source.close();
                            return Err(err);
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                    source.close();
                    let snippet = response.text().await.unwrap_or_default();
                    return Err(anyhow!("request failed ({}) {}", status, snippet));
                }
                Err(err) => {
                    source.close();
                    return Err(anyhow!("event stream error: {}", err));
                }
            }
        }
        source.close();

        if tally.usage.is_none() {
            debug!(
                model = %request.model,
                chunks = tally.content_chunks,
                "no usage reported in stream; completion tokens counted from content chunks"
            );
        }

        let completion_tokens = tally.completion_tokens();
        if let Some(sink) = progress {
            if completion_tokens > tally.content_chunks {
                sink.record_tokens(completion_tokens - tally.content_chunks);
            }
        }

        let ttft = tally
            .first_content
            .map(|at| at.duration_since(start))
            .unwrap_or_else(|| start.elapsed());

        Ok(Generation {
            ttft,
            prompt_tokens: tally.prompt_tokens(),
            completion_tokens,
        })
    }
}

#[derive(Debug, Default)]
struct StreamTally {
    first_content: Option<Instant>,
    content_chunks: u64,
    usage: Option<Usage>,
}

impl StreamTally {
    /// Folds one SSE data payload into the tally and returns how many new
    /// tokens it contributes to progress.
    fn observe(&mut self, data: &str, now: Instant) -> Result<u64> {
        let chunk: ChatCompletionChunk = serde_json::from_str(data)
            .with_context(|| format!("malformed stream chunk: {}", data))?;
        if let Some(error) = chunk.error {
            return Err(anyhow!("server reported an error mid-stream: {}", error));
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        let has_content = chunk
            .choices
            .iter()
            .filter_map(|choice| choice.delta.as_ref())
            .any(Delta::has_content);
        if !has_content {
            return Ok(0);
        }

        if self.first_content.is_none() {
            self.first_content = Some(now);
        }
        self.content_chunks += 1;
        Ok(1)
    }

    fn completion_tokens(&self) -> u64 {
        self.usage
            .as_ref()
            .map(|usage| usage.completion_tokens)
            .unwrap_or(self.content_chunks)
    }

    fn prompt_tokens(&self) -> u64 {
        self.usage
            .as_ref()
            .map(|usage| usage.prompt_tokens)
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    // Reasoning models stream their thinking before any answer text.
    #[serde(default)]
    reasoning_content: Option<String>,
}

impl Delta {
    fn has_content(&self) -> bool {
        [&self.content, &self.reasoning_content]
            .into_iter()
            .flatten()
            .any(|text| !text.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Builds a prompt of `num_words` random lowercase words.
pub fn random_prompt<R: Rng + ?Sized>(num_words: usize, rng: &mut R) -> String {
    let mut words = Vec::with_capacity(num_words);
    for _ in 0..num_words {
        let len = rng.gen_range(3..=8);
        let word: String = (0..len)
            .map(|_| rng.gen_range(b'a'..=b'z') as char)
            .collect();
        words.push(word);
    }
    words.join(" ")
}
