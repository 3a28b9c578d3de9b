use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::{GenerationRequest, TextGenerationClient};
use crate::config::{BenchmarkPlan, MeasurementConfig};
use crate::latency::LatencyProbe;
use crate::progress::{token_bar, ProgressSink};
use crate::report::{BenchmarkReport, MeasurementResult};
use crate::stats;

/// Token limit used when asking the endpoint how long the prompt is.
const PROMPT_PROBE_MAX_TOKENS: u32 = 4;

#[derive(Clone, Debug, PartialEq)]
pub enum SampleOutcome {
    Success {
        ttft_secs: f64,
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    Failure {
        error: String,
    },
}

/// Terminal outcome of one worker. `index` is a correlation key only.
#[derive(Clone, Debug, PartialEq)]
pub struct RawSample {
    pub index: usize,
    pub outcome: SampleOutcome,
}

#[derive(Debug)]
pub struct FanoutOutcome {
    /// One sample per worker, ordered by worker index.
    pub samples: Vec<RawSample>,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Wall-clock time from launch until the last worker terminated.
    pub duration: Duration,
}

/// Fires `config.concurrency` generations at once and waits for all of them.
///
/// Each worker owns one pre-allocated slot and the two counters are atomic,
/// so workers never contend with each other. A failed request is recorded in
/// its slot and never cancels the rest of the batch. There is no timeout here;
/// the batch lasts as long as the slowest request allowed by the client.
pub async fn execute<C>(
    client: Arc<C>,
    config: &MeasurementConfig,
    progress: Option<Arc<dyn ProgressSink>>,
) -> Result<FanoutOutcome>
where
    C: TextGenerationClient + ?Sized + 'static,
{
    config.validate()?;
    let concurrency = config.concurrency;
    let request = Arc::new(config.generation_request());
    let slots: Arc<Vec<OnceLock<RawSample>>> =
        Arc::new((0..concurrency).map(|_| OnceLock::new()).collect());
    let successes = Arc::new(AtomicU64::new(0));
    let failures = Arc::new(AtomicU64::new(0));

    let start = Instant::now();
    let mut join_set = JoinSet::new();
    for index in 0..concurrency {
        let client = Arc::clone(&client);
        let request = Arc::clone(&request);
        let progress = progress.clone();
        let slots = Arc::clone(&slots);
        let successes = Arc::clone(&successes);
        let failures = Arc::clone(&failures);
        join_set.spawn(async move {
            let outcome = run_worker(index, client.as_ref(), &request, progress.as_deref()).await;
            match outcome {
                SampleOutcome::Success { .. } => successes.fetch_add(1, Ordering::Relaxed),
                SampleOutcome::Failure { .. } => failures.fetch_add(1, Ordering::Relaxed),
            };
            let _ = slots[index].set(RawSample { index, outcome });
        });
    }

    while let Some(join_result) = join_set.join_next().await {
        if let Err(err) = join_result {
            warn!(error = %err, "worker task terminated abnormally");
            failures.fetch_add(1, Ordering::Relaxed);
        }
    }
    let duration = start.elapsed();

    let samples: Vec<RawSample> = slots
        .iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.get().cloned().unwrap_or_else(|| RawSample {
                index,
                outcome: SampleOutcome::Failure {
                    error: "worker terminated without reporting".to_string(),
                },
            })
        })
        .collect();

    let successful_requests = successes.load(Ordering::Relaxed);
    let failed_requests = failures.load(Ordering::Relaxed);
    if successful_requests + failed_requests != concurrency as u64 {
        return Err(anyhow!(
            "fanout accounted for {} of {} requests",
            successful_requests + failed_requests,
            concurrency
        ));
    }

    debug!(
        concurrency,
        successful_requests,
        failed_requests,
        elapsed_secs = duration.as_secs_f64(),
        "fanout complete"
    );

    Ok(FanoutOutcome {
        samples,
        successful_requests,
        failed_requests,
        duration,
    })
}

async fn run_worker<C>(
    index: usize,
    client: &C,
    request: &GenerationRequest,
    progress: Option<&dyn ProgressSink>,
) -> SampleOutcome
where
    C: TextGenerationClient + ?Sized,
{
    match client.generate(request, progress).await {
        Ok(generation) => SampleOutcome::Success {
            ttft_secs: generation.ttft.as_secs_f64(),
            prompt_tokens: generation.prompt_tokens,
            completion_tokens: generation.completion_tokens,
        },
        Err(err) => {
            let error = format!("{:#}", err);
            debug!(worker = index, error = %error, "request failed");
            SampleOutcome::Failure { error }
        }
    }
}

/// Runs one concurrency level end to end: validate, fan out, reduce.
pub async fn measure_speed<C>(
    client: Arc<C>,
    config: &MeasurementConfig,
    progress: Option<Arc<dyn ProgressSink>>,
) -> Result<MeasurementResult>
where
    C: TextGenerationClient + ?Sized + 'static,
{
    let fanout = execute(client, config, progress).await?;
    Ok(stats::reduce(
        config.concurrency,
        &fanout.samples,
        fanout.duration,
        config.baseline_latency_ms,
    ))
}

pub enum BenchmarkEvent<'a> {
    /// Baseline latency and prompt size are known; no level has run yet.
    Started(&'a BenchmarkReport),
    LevelCompleted(&'a MeasurementResult),
}

/// Measures every level of `plan` in order against one baseline latency.
///
/// The latency probe and the prompt-size probe must succeed; either failing
/// aborts the session before any level runs.
pub async fn run_benchmark<C, P, F>(
    client: Arc<C>,
    probe: &P,
    plan: &BenchmarkPlan,
    show_progress: bool,
    mut on_event: F,
) -> Result<BenchmarkReport>
where
    C: TextGenerationClient + ?Sized + 'static,
    P: LatencyProbe + ?Sized,
    F: FnMut(BenchmarkEvent<'_>),
{
    let latency_ms = probe
        .baseline_latency_ms()
        .await
        .context("latency test error")?;
    info!(latency_ms, "measured baseline latency");

    let probe_request = GenerationRequest {
        max_tokens: PROMPT_PROBE_MAX_TOKENS,
        ..plan.generation_request()
    };
    let input_tokens = client
        .generate(&probe_request, None)
        .await
        .context("error getting prompt tokens")?
        .prompt_tokens;

    let mut report = BenchmarkReport {
        model_name: plan.model.clone(),
        input_tokens,
        max_tokens: plan.max_tokens,
        latency_ms,
        results: Vec::with_capacity(plan.concurrency_levels.len()),
    };
    on_event(BenchmarkEvent::Started(&report));

    for &concurrency in &plan.concurrency_levels {
        let config = plan.measurement(concurrency, latency_ms)?;
        let bar = show_progress.then(|| token_bar(concurrency, config.max_tokens));
        let sink = bar
            .clone()
            .map(|bar| Arc::new(bar) as Arc<dyn ProgressSink>);

        let result = measure_speed(Arc::clone(&client), &config, sink)
            .await
            .with_context(|| format!("concurrency {}", concurrency))?;
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }

        info!(
            concurrency,
            successful = result.successful_requests,
            failed = result.failed_requests,
            "level complete"
        );
        on_event(BenchmarkEvent::LevelCompleted(&result));
        report.results.push(result);
    }

    Ok(report)
}
