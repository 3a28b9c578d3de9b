mod client;
mod config;
mod latency;
mod progress;
mod report;
mod runner;
pub mod stats;

pub use client::{random_prompt, Generation, GenerationRequest, OpenAiClient, TextGenerationClient};
pub use config::{
    parse_concurrency_levels, parse_header, BenchmarkPlan, ClientConfig, MeasurementConfig,
    PromptSource, API_KEY_PLACEHOLDER, DEFAULT_PROMPT,
};
pub use latency::{LatencyProbe, TcpConnectProbe};
pub use progress::{token_bar, ProgressSink};
pub use report::{BenchmarkReport, MeasurementResult, TABLE_HEADER, TABLE_RULE};
pub use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
pub use runner::{
    execute, measure_speed, run_benchmark, BenchmarkEvent, FanoutOutcome, RawSample,
    SampleOutcome,
};
