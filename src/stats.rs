//! Reduction of raw per-request samples into a [`MeasurementResult`].
//!
//! Percentiles use the nearest-rank method: the value at sorted index
//! `ceil(n * p) - 1`, clamped to the sample range. No interpolation happens,
//! so small sample sets always report an observed value (a single sample is
//! every percentile of itself).

#![allow(clippy::cast_precision_loss)]

use std::time::Duration;

use crate::report::MeasurementResult;
use crate::runner::{RawSample, SampleOutcome};

/// Nearest-rank percentile of `values` for `quantile` in `(0, 1]`.
///
/// Returns 0 for an empty slice.
pub fn percentile(values: &[f64], quantile: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    nearest_rank(&sorted, quantile)
}

fn nearest_rank(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (sorted.len() as f64 * quantile).ceil() as i64 - 1;
    let index = rank.clamp(0, sorted.len() as i64 - 1) as usize;
    sorted[index]
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Standard deviation with divisor `n`, not `n - 1`.
pub fn population_std_dev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = values.iter().map(|value| (value - mean).powi(2)).sum();
    (sum_sq / values.len() as f64).sqrt()
}

/// Tokens per second over `window_secs` after subtracting the baseline
/// latency. `None` when the corrected window is not positive.
pub fn latency_corrected_rate(tokens: u64, window_secs: f64, baseline_latency_ms: f64) -> Option<f64> {
    let window = window_secs - baseline_latency_ms / 1000.0;
    if window.is_finite() && window > 0.0 {
        Some(tokens as f64 / window)
    } else {
        None
    }
}

pub fn round_to_two_decimals(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Folds the samples of one run into its summary.
///
/// `concurrency` is the configured request count; slots without a sample are
/// counted as failures so that successes and failures always add up to it.
pub fn reduce(
    concurrency: usize,
    samples: &[RawSample],
    duration: Duration,
    baseline_latency_ms: f64,
) -> MeasurementResult {
    let mut ttfts = Vec::with_capacity(samples.len());
    let mut total_prompt_tokens = 0u64;
    let mut total_completion_tokens = 0u64;

    for sample in samples {
        if let SampleOutcome::Success {
            ttft_secs,
            prompt_tokens,
            completion_tokens,
        } = sample.outcome
        {
            ttfts.push(ttft_secs);
            total_prompt_tokens += prompt_tokens;
            total_completion_tokens += completion_tokens;
        }
    }
    ttfts.sort_by(f64::total_cmp);

    let successful_requests = ttfts.len() as u64;
    let failed_requests = (concurrency as u64).saturating_sub(successful_requests);
    let success_rate = if concurrency > 0 {
        successful_requests as f64 / concurrency as f64
    } else {
        0.0
    };

    let duration_secs = duration.as_secs_f64();
    let round = round_to_two_decimals;
    let mut result = MeasurementResult {
        concurrency,
        successful_requests,
        failed_requests,
        success_rate,
        total_prompt_tokens,
        total_completion_tokens,
        duration: round(duration_secs),
        ..MeasurementResult::default()
    };

    if successful_requests == 0 {
        result.generation_speed = Some(0.0);
        result.prompt_throughput = Some(0.0);
        result.total_throughput = Some(0.0);
        return result;
    }

    let avg_ttft = mean(&ttfts);
    let min_ttft = ttfts[0];
    let max_ttft = ttfts[ttfts.len() - 1];

    result.min_ttft = round(min_ttft);
    result.max_ttft = round(max_ttft);
    result.avg_ttft = round(avg_ttft);
    result.median_ttft = round(nearest_rank(&ttfts, 0.5));
    result.p95_ttft = round(nearest_rank(&ttfts, 0.95));
    result.p99_ttft = round(nearest_rank(&ttfts, 0.99));
    result.stddev_ttft = round(population_std_dev(&ttfts, avg_ttft));

    result.avg_prompt_tokens = round(total_prompt_tokens as f64 / successful_requests as f64);
    result.avg_completion_tokens =
        round(total_completion_tokens as f64 / successful_requests as f64);

    result.generation_speed =
        latency_corrected_rate(total_completion_tokens, duration_secs, baseline_latency_ms)
            .map(round);
    result.prompt_throughput =
        latency_corrected_rate(total_prompt_tokens, max_ttft, baseline_latency_ms).map(round);
    result.total_throughput = latency_corrected_rate(
        total_prompt_tokens + total_completion_tokens,
        duration_secs,
        baseline_latency_ms,
    )
    .map(round);

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(index: usize, ttft_secs: f64, prompt_tokens: u64, completion_tokens: u64) -> RawSample {
        RawSample {
            index,
            outcome: SampleOutcome::Success {
                ttft_secs,
                prompt_tokens,
                completion_tokens,
            },
        }
    }

    fn failure(index: usize) -> RawSample {
        RawSample {
            index,
            outcome: SampleOutcome::Failure {
                error: "connection refused".to_string(),
            },
        }
    }

    fn four_samples() -> Vec<RawSample> {
        // Deliberately out of order.
        vec![
            success(2, 0.3, 100, 250),
            success(0, 0.1, 100, 250),
            success(3, 0.4, 100, 250),
            success(1, 0.2, 100, 250),
        ]
    }

    #[test]
    fn percentile_uses_nearest_rank() {
        let values = [0.4, 0.1, 0.3, 0.2];
        assert_eq!(percentile(&values, 0.5), 0.2);
        assert_eq!(percentile(&values, 0.95), 0.4);
        assert_eq!(percentile(&values, 0.25), 0.1);
        assert_eq!(percentile(&values, 1.0), 0.4);
        assert_eq!(percentile(&values, 0.0), 0.1);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn percentile_of_singleton_is_the_value() {
        for quantile in [0.01, 0.5, 0.95, 0.99, 1.0] {
            assert_eq!(percentile(&[1.7], quantile), 1.7);
        }
    }

    #[test]
    fn std_dev_is_population_based() {
        let same = [0.25, 0.25, 0.25, 0.25];
        assert_eq!(population_std_dev(&same, mean(&same)), 0.0);

        let spread = [1.0, 2.0, 3.0, 4.0];
        let expected = 1.25f64.sqrt();
        assert!((population_std_dev(&spread, mean(&spread)) - expected).abs() < 1e-12);
    }

    #[test]
    fn ttft_statistics_from_fixed_samples() {
        let result = reduce(4, &four_samples(), Duration::from_secs(2), 0.0);

        assert_eq!(result.successful_requests, 4);
        assert_eq!(result.failed_requests, 0);
        assert_eq!(result.success_rate, 1.0);
        assert_eq!(result.min_ttft, 0.1);
        assert_eq!(result.max_ttft, 0.4);
        assert_eq!(result.median_ttft, 0.2);
        assert_eq!(result.p95_ttft, 0.4);
        assert_eq!(result.p99_ttft, 0.4);
        assert_eq!(result.avg_ttft, 0.25);
        assert_eq!(result.stddev_ttft, 0.11);
        assert_eq!(result.avg_prompt_tokens, 100.0);
        assert_eq!(result.avg_completion_tokens, 250.0);
        assert_eq!(result.duration, 2.0);
    }

    #[test]
    fn throughput_formulas() {
        let result = reduce(4, &four_samples(), Duration::from_secs(10), 0.0);
        assert_eq!(result.total_completion_tokens, 1000);
        assert_eq!(result.generation_speed, Some(100.0));
        assert_eq!(result.total_throughput, Some(140.0));
        // 400 prompt tokens over the slowest first token (0.4s).
        assert_eq!(result.prompt_throughput, Some(1000.0));
    }

    #[test]
    fn baseline_latency_is_subtracted() {
        let samples = vec![success(0, 0.5, 300, 1000)];
        let result = reduce(1, &samples, Duration::from_millis(10_250), 250.0);
        assert_eq!(result.generation_speed, Some(100.0));
        assert_eq!(result.total_throughput, Some(130.0));
        assert_eq!(result.prompt_throughput, Some(1200.0));
    }

    #[test]
    fn non_positive_window_yields_no_throughput() {
        let samples = vec![success(0, 0.05, 300, 100)];
        let result = reduce(1, &samples, Duration::from_millis(80), 100.0);
        assert_eq!(result.generation_speed, None);
        assert_eq!(result.prompt_throughput, None);
        assert_eq!(result.total_throughput, None);

        assert_eq!(latency_corrected_rate(10, 1.0, 1000.0), None);
        assert_eq!(latency_corrected_rate(10, f64::INFINITY, 0.0), None);
    }

    #[test]
    fn all_failures_degrade_to_zero() {
        let samples: Vec<RawSample> = (0..3).map(failure).collect();
        let result = reduce(3, &samples, Duration::from_secs(1), 5000.0);

        assert_eq!(result.successful_requests, 0);
        assert_eq!(result.failed_requests, 3);
        assert_eq!(result.success_rate, 0.0);
        assert_eq!(result.min_ttft, 0.0);
        assert_eq!(result.max_ttft, 0.0);
        assert_eq!(result.avg_ttft, 0.0);
        assert_eq!(result.median_ttft, 0.0);
        assert_eq!(result.p95_ttft, 0.0);
        assert_eq!(result.p99_ttft, 0.0);
        assert_eq!(result.stddev_ttft, 0.0);
        assert_eq!(result.avg_prompt_tokens, 0.0);
        assert_eq!(result.avg_completion_tokens, 0.0);
        assert_eq!(result.generation_speed, Some(0.0));
        assert_eq!(result.prompt_throughput, Some(0.0));
        assert_eq!(result.total_throughput, Some(0.0));
    }

    #[test]
    fn partial_failures_lower_success_rate() {
        let mut samples = four_samples();
        samples.push(failure(4));
        let result = reduce(5, &samples, Duration::from_secs(10), 0.0);
        assert_eq!(result.successful_requests, 4);
        assert_eq!(result.failed_requests, 1);
        assert_eq!(result.success_rate, 0.8);
        assert_eq!(
            result.successful_requests + result.failed_requests,
            result.concurrency as u64
        );
    }

    #[test]
    fn success_rate_keeps_full_precision() {
        let mut samples: Vec<RawSample> = (0..127).map(|i| success(i, 0.2, 10, 10)).collect();
        samples.push(failure(127));
        let result = reduce(128, &samples, Duration::from_secs(4), 0.0);

        assert_eq!(result.success_rate, 127.0 / 128.0);
        assert!(result.table_row().contains("| 99.22% |"));
    }

    #[test]
    fn missing_samples_count_as_failures() {
        let result = reduce(6, &four_samples(), Duration::from_secs(1), 0.0);
        assert_eq!(result.failed_requests, 2);
    }

    #[test]
    fn reduce_is_deterministic() {
        let samples = four_samples();
        let first = reduce(4, &samples, Duration::from_millis(2345), 12.5);
        let second = reduce(4, &samples, Duration::from_millis(2345), 12.5);
        assert_eq!(first, second);
    }

    #[test]
    fn zero_concurrency_has_zero_success_rate() {
        let result = reduce(0, &[], Duration::ZERO, 0.0);
        assert_eq!(result.success_rate, 0.0);
        assert_eq!(result.generation_speed, Some(0.0));
    }
}
