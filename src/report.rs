use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

pub const TABLE_HEADER: &str = "| C | Gen Speed | Prompt TP | Total TP | Min TTFT | Avg TTFT | Med TTFT | P95 TTFT | P99 TTFT | StdDev | Success | Reqs | Duration |";
pub const TABLE_RULE: &str = "|---|-----------|-----------|----------|----------|----------|----------|----------|----------|--------|-------|------|----------|";

/// Summary of one concurrency level. Floating point fields other than
/// `success_rate` are rounded to two decimals; TTFT values and durations are
/// in seconds. `success_rate` is the exact ratio of successes to concurrency.
///
/// Throughput fields are `None` when the latency-corrected time window was not
/// positive, which happens when the baseline latency is as large as the
/// measured window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MeasurementResult {
    pub concurrency: usize,
    pub generation_speed: Option<f64>,
    pub prompt_throughput: Option<f64>,
    pub total_throughput: Option<f64>,
    pub max_ttft: f64,
    pub min_ttft: f64,
    pub avg_ttft: f64,
    pub median_ttft: f64,
    pub p95_ttft: f64,
    pub p99_ttft: f64,
    pub stddev_ttft: f64,
    pub success_rate: f64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub avg_prompt_tokens: f64,
    pub avg_completion_tokens: f64,
    pub duration: f64,
}

impl MeasurementResult {
    pub fn table_row(&self) -> String {
        format!(
            "| {:>2} | {} | {} | {} | {:>8.2} | {:>8.2} | {:>8.2} | {:>8.2} | {:>8.2} | {:>6.2} | {:>5.2}% | {:>4} | {:>8.2} |",
            self.concurrency,
            format_rate(self.generation_speed, 9),
            format_rate(self.prompt_throughput, 9),
            format_rate(self.total_throughput, 8),
            self.min_ttft,
            self.avg_ttft,
            self.median_ttft,
            self.p95_ttft,
            self.p99_ttft,
            self.stddev_ttft,
            self.success_rate * 100.0,
            self.successful_requests,
            self.duration,
        )
    }
}

fn format_rate(rate: Option<f64>, width: usize) -> String {
    match rate {
        Some(value) => format!("{:>width$.2}", value, width = width),
        None => format!("{:>width$}", "n/a", width = width),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkReport {
    pub model_name: String,
    pub input_tokens: u64,
    pub max_tokens: u32,
    /// Baseline latency in milliseconds, shared by every level.
    pub latency_ms: f64,
    pub results: Vec<MeasurementResult>,
}

impl BenchmarkReport {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize report as JSON")
    }

    /// YAML output uses kebab-case keys; JSON keeps snake_case.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&YamlReport::from(self))
            .context("failed to serialize report as YAML")
    }

    pub fn banner(&self, now: DateTime<Utc>) -> String {
        let rule = "#".repeat(110);
        format!(
            "\n{rule}\n{title:^110}\n{time:^110}\n{rule}\n{summary}",
            rule = rule,
            title = "LLM API Throughput Benchmark",
            time = format!("Time: {}", now.format("%Y-%m-%d %H:%M:%S UTC+0")),
            summary = self.summary(),
        )
    }

    fn summary(&self) -> String {
        format!(
            "Input Tokens: {}\nOutput Tokens: {}\nTest Model: {}\nLatency: {:.2} ms\n",
            self.input_tokens, self.max_tokens, self.model_name, self.latency_ms
        )
    }

    pub fn to_markdown(&self) -> String {
        let mut out = format!("```\n{}```\n\n", self.summary());
        out.push_str(TABLE_HEADER);
        out.push('\n');
        out.push_str(TABLE_RULE);
        out.push('\n');
        for result in &self.results {
            out.push_str(&result.table_row());
            out.push('\n');
        }
        out
    }

    pub fn markdown_file_name(&self) -> String {
        let safe = self.model_name.replace(['/', '\\'], "_");
        let safe = safe.trim();
        let safe = if safe.is_empty() { "model" } else { safe };
        format!("API_Throughput_{}.md", safe)
    }

    /// Writes the Markdown table into `dir` and returns the file path.
    pub fn save_markdown(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(self.markdown_file_name());
        fs::write(&path, self.to_markdown())
            .with_context(|| format!("failed to write results to {}", path.display()))?;
        Ok(path)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct YamlReport<'a> {
    model_name: &'a str,
    input_tokens: u64,
    max_tokens: u32,
    latency_ms: f64,
    results: Vec<YamlMeasurement>,
}

impl<'a> From<&'a BenchmarkReport> for YamlReport<'a> {
    fn from(report: &'a BenchmarkReport) -> Self {
        Self {
            model_name: &report.model_name,
            input_tokens: report.input_tokens,
            max_tokens: report.max_tokens,
            latency_ms: report.latency_ms,
            results: report.results.iter().map(YamlMeasurement::from).collect(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct YamlMeasurement {
    concurrency: usize,
    generation_speed: Option<f64>,
    prompt_throughput: Option<f64>,
    total_throughput: Option<f64>,
    max_ttft: f64,
    min_ttft: f64,
    avg_ttft: f64,
    median_ttft: f64,
    p95_ttft: f64,
    p99_ttft: f64,
    stddev_ttft: f64,
    success_rate: f64,
    successful_requests: u64,
    failed_requests: u64,
    total_prompt_tokens: u64,
    total_completion_tokens: u64,
    avg_prompt_tokens: f64,
    avg_completion_tokens: f64,
    duration: f64,
}

impl From<&MeasurementResult> for YamlMeasurement {
    fn from(result: &MeasurementResult) -> Self {
        Self {
            concurrency: result.concurrency,
            generation_speed: result.generation_speed,
            prompt_throughput: result.prompt_throughput,
            total_throughput: result.total_throughput,
            max_ttft: result.max_ttft,
            min_ttft: result.min_ttft,
            avg_ttft: result.avg_ttft,
            median_ttft: result.median_ttft,
            p95_ttft: result.p95_ttft,
            p99_ttft: result.p99_ttft,
            stddev_ttft: result.stddev_ttft,
            success_rate: result.success_rate,
            successful_requests: result.successful_requests,
            failed_requests: result.failed_requests,
            total_prompt_tokens: result.total_prompt_tokens,
            total_completion_tokens: result.total_completion_tokens,
            avg_prompt_tokens: result.avg_prompt_tokens,
            avg_completion_tokens: result.avg_completion_tokens,
            duration: result.duration,
        }
    }
}
