use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;

use crate::client::GenerationRequest;

pub const DEFAULT_PROMPT: &str =
    "Write a long story, no less than 10,000 words, starting from a long, long time ago.";

/// Placeholder substituted with the API key inside custom header values.
pub const API_KEY_PLACEHOLDER: &str = "{api_key}";

#[derive(Clone, Debug, PartialEq)]
pub enum PromptSource {
    /// Send the same literal prompt with every request.
    Text(String),
    /// Generate a fresh prompt of `num_words` random words for every request.
    RandomWords { num_words: usize },
}

impl PromptSource {
    /// Random input only applies while the prompt is left at its default.
    pub fn from_cli(prompt: &str, num_words: usize) -> Self {
        if prompt == DEFAULT_PROMPT && num_words > 0 {
            PromptSource::RandomWords { num_words }
        } else {
            PromptSource::Text(prompt.to_string())
        }
    }
}

/// Inputs for a single measurement run at one concurrency level.
#[derive(Clone, Debug)]
pub struct MeasurementConfig {
    pub model: String,
    pub prompt: PromptSource,
    pub max_tokens: u32,
    pub baseline_latency_ms: f64,
    pub concurrency: usize,
}

impl MeasurementConfig {
    pub fn try_new(
        model: impl Into<String>,
        prompt: PromptSource,
        max_tokens: u32,
        concurrency: usize,
    ) -> Result<Self> {
        let config = Self {
            model: model.into(),
            prompt,
            max_tokens,
            baseline_latency_ms: 0.0,
            concurrency,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_baseline_latency_ms(mut self, baseline_latency_ms: f64) -> Self {
        self.baseline_latency_ms = baseline_latency_ms;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(anyhow!("concurrency must be greater than zero"));
        }
        if self.max_tokens == 0 {
            return Err(anyhow!("max_tokens must be greater than zero"));
        }
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must not be empty"));
        }
        if !self.baseline_latency_ms.is_finite() || self.baseline_latency_ms < 0.0 {
            return Err(anyhow!(
                "baseline latency must be a non-negative number of milliseconds, got {}",
                self.baseline_latency_ms
            ));
        }
        if let PromptSource::RandomWords { num_words: 0 } = self.prompt {
            return Err(anyhow!("random prompts need at least one word"));
        }
        Ok(())
    }

    pub fn generation_request(&self) -> GenerationRequest {
        GenerationRequest {
            model: self.model.clone(),
            prompt: self.prompt.clone(),
            max_tokens: self.max_tokens,
        }
    }
}

/// A benchmark session: one model and prompt measured at several levels.
#[derive(Clone, Debug)]
pub struct BenchmarkPlan {
    pub model: String,
    pub prompt: PromptSource,
    pub max_tokens: u32,
    pub concurrency_levels: Vec<usize>,
}

impl BenchmarkPlan {
    pub fn try_new(
        model: impl Into<String>,
        prompt: PromptSource,
        max_tokens: u32,
        concurrency_levels: Vec<usize>,
    ) -> Result<Self> {
        if concurrency_levels.is_empty() {
            return Err(anyhow!("at least one concurrency level is required"));
        }
        let plan = Self {
            model: model.into(),
            prompt,
            max_tokens,
            concurrency_levels,
        };
        for &level in &plan.concurrency_levels {
            plan.measurement(level, 0.0)?;
        }
        Ok(plan)
    }

    /// Measurement inputs for one level of this plan.
    pub fn measurement(
        &self,
        concurrency: usize,
        baseline_latency_ms: f64,
    ) -> Result<MeasurementConfig> {
        let config = MeasurementConfig::try_new(
            self.model.clone(),
            self.prompt.clone(),
            self.max_tokens,
            concurrency,
        )
        .map(|config| config.with_baseline_latency_ms(baseline_latency_ms))
        .and_then(|config| config.validate().map(|()| config))
        .with_context(|| format!("invalid measurement at concurrency {}", concurrency))?;
        Ok(config)
    }

    pub fn generation_request(&self) -> GenerationRequest {
        GenerationRequest {
            model: self.model.clone(),
            prompt: self.prompt.clone(),
            max_tokens: self.max_tokens,
        }
    }
}

/// Connection settings for the chat completion endpoint.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub base_url: Url,
    pub api_key: Option<String>,
    pub api_version: Option<String>,
    pub headers: HeaderMap,
    pub request_timeout: Duration,
    pub insecure_skip_tls_verify: bool,
    pub use_max_completion_tokens: bool,
}

impl ClientConfig {
    pub fn try_new(base_url: impl AsRef<str>, api_key: Option<String>) -> Result<Self> {
        if base_url.as_ref().trim().is_empty() {
            return Err(anyhow!("base URL is required"));
        }
        let base_url = Url::parse(base_url.as_ref())
            .with_context(|| format!("invalid base URL: {}", base_url.as_ref()))?;

        let api_key = api_key.filter(|key| !key.is_empty());
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &api_key {
            let auth_value = format!("Bearer {}", api_key);
            let header_value = HeaderValue::from_str(&auth_value)
                .context("failed to build Authorization header from api_key")?;
            headers.insert(AUTHORIZATION, header_value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self {
            base_url,
            api_key,
            api_version: None,
            headers,
            request_timeout: Duration::from_secs(600),
            insecure_skip_tls_verify: false,
            use_max_completion_tokens: false,
        })
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        if !request_timeout.is_zero() {
            self.request_timeout = request_timeout;
        }
        self
    }

    pub fn with_api_version(mut self, api_version: Option<String>) -> Self {
        self.api_version = api_version.filter(|version| !version.is_empty());
        self
    }

    pub fn with_insecure_skip_tls_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_tls_verify = skip;
        self
    }

    pub fn with_max_completion_tokens(mut self, enabled: bool) -> Self {
        self.use_max_completion_tokens = enabled;
        self
    }

    pub fn add_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Parses and inserts a `Key:Value` header, expanding the API key placeholder.
    pub fn add_raw_header(self, raw: &str) -> Result<Self> {
        let (name, value) = parse_header(raw, self.api_key.as_deref().unwrap_or_default())?;
        Ok(self.add_header(name, value))
    }

    /// Resolves `path` below the base URL, carrying the `api-version` query if set.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        let joined = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut url =
            Url::parse(&joined).with_context(|| format!("invalid endpoint URL: {}", joined))?;
        if let Some(version) = &self.api_version {
            url.query_pairs_mut().append_pair("api-version", version);
        }
        Ok(url)
    }
}

pub fn parse_header(raw: &str, api_key: &str) -> Result<(HeaderName, HeaderValue)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("invalid header format '{}', expected 'Key:Value'", raw))?;
    let name = name.trim();
    let value = value.trim().replace(API_KEY_PLACEHOLDER, api_key);

    let name = HeaderName::from_bytes(name.as_bytes())
        .with_context(|| format!("invalid header name in '{}'", raw))?;
    let value = HeaderValue::from_str(&value)
        .with_context(|| format!("invalid header value in '{}'", raw))?;
    Ok((name, value))
}

pub fn parse_concurrency_levels(raw: &str) -> Result<Vec<usize>> {
    let mut levels = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        let level: usize = part
            .parse()
            .with_context(|| format!("'{}' is not a valid concurrency level", part))?;
        if level == 0 {
            return Err(anyhow!("concurrency levels must be greater than zero"));
        }
        levels.push(level);
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = MeasurementConfig::try_new("m", PromptSource::Text("hi".into()), 16, 0)
            .unwrap_err();
        assert!(err.to_string().contains("concurrency"));

        let plan =
            BenchmarkPlan::try_new("m", PromptSource::Text("hi".into()), 16, vec![1, 4]).unwrap();
        assert!(plan.measurement(0, 0.0).is_err());
        let config = plan.measurement(8, 12.5).unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.baseline_latency_ms, 12.5);

        assert!(plan.measurement(2, -5.0).is_err());
        assert!(plan.measurement(2, f64::NAN).is_err());

        assert!(BenchmarkPlan::try_new("m", PromptSource::Text("hi".into()), 16, vec![2, 0])
            .is_err());
        assert!(BenchmarkPlan::try_new("m", PromptSource::Text("hi".into()), 16, vec![]).is_err());
    }

    #[test]
    fn negative_baseline_latency_is_rejected() {
        let config = MeasurementConfig::try_new("m", PromptSource::Text("hi".into()), 16, 1)
            .unwrap()
            .with_baseline_latency_ms(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn random_words_only_replace_the_default_prompt() {
        assert_eq!(
            PromptSource::from_cli(DEFAULT_PROMPT, 100),
            PromptSource::RandomWords { num_words: 100 }
        );
        assert_eq!(
            PromptSource::from_cli("custom", 100),
            PromptSource::Text("custom".into())
        );
        assert_eq!(
            PromptSource::from_cli(DEFAULT_PROMPT, 0),
            PromptSource::Text(DEFAULT_PROMPT.into())
        );
    }

    #[test]
    fn concurrency_levels_parse_in_order() {
        assert_eq!(
            parse_concurrency_levels("1, 2,4,8").unwrap(),
            vec![1, 2, 4, 8]
        );
        assert!(parse_concurrency_levels("1,0,2").is_err());
        assert!(parse_concurrency_levels("1,,2").is_err());
        assert!(parse_concurrency_levels("four").is_err());
    }

    #[test]
    fn header_placeholder_is_expanded() {
        let (name, value) = parse_header("Authorization: Bearer {api_key}", "sk-test").unwrap();
        assert_eq!(name, AUTHORIZATION);
        assert_eq!(value, "Bearer sk-test");
        assert!(parse_header("no-separator", "k").is_err());
    }

    #[test]
    fn custom_headers_override_defaults() {
        let config = ClientConfig::try_new("http://localhost:8000/v1", Some("abc".into()))
            .unwrap()
            .add_raw_header("Authorization: Token {api_key}")
            .unwrap();
        assert_eq!(config.headers[AUTHORIZATION], "Token abc");
    }

    #[test]
    fn endpoint_joins_paths_and_api_version() {
        let config = ClientConfig::try_new("https://example.com/v1/", None)
            .unwrap()
            .with_api_version(Some("2024-02-01".into()));
        let url = config.endpoint("/chat/completions").unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.com/v1/chat/completions?api-version=2024-02-01"
        );
        assert!(!config.headers.contains_key(AUTHORIZATION));
    }

    #[test]
    fn missing_base_url_is_rejected() {
        assert!(ClientConfig::try_new("", None).is_err());
        assert!(ClientConfig::try_new("not a url", None).is_err());
    }
}
