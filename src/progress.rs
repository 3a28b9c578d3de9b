use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Receives incremental "tokens produced" updates from in-flight requests.
///
/// Implementations must return quickly; updates are fire-and-forget and a
/// slow or absent sink never changes measured results.
pub trait ProgressSink: Send + Sync {
    fn record_tokens(&self, tokens: u64);
}

impl ProgressSink for ProgressBar {
    fn record_tokens(&self, tokens: u64) {
        self.inc(tokens);
    }
}

/// Token progress bar for one concurrency level, drawn on stderr.
pub fn token_bar(concurrency: usize, max_tokens: u32) -> ProgressBar {
    let expected_tokens = concurrency as u64 * u64::from(max_tokens);
    let bar = ProgressBar::with_draw_target(Some(expected_tokens), ProgressDrawTarget::stderr());
    let style = ProgressStyle::with_template(
        "{msg} {spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} tokens ({per_sec})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("#>-");
    bar.set_style(style);
    bar.set_message(format!("Concurrency {}", concurrency));
    bar
}
