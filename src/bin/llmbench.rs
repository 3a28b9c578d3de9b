use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use llmbench_rs::{
    parse_concurrency_levels, run_benchmark, BenchmarkEvent, BenchmarkPlan, BenchmarkReport,
    ClientConfig, OpenAiClient, PromptSource, TcpConnectProbe, DEFAULT_PROMPT, TABLE_HEADER,
    TABLE_RULE,
};
use tracing::{warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Json,
    Yaml,
}

#[derive(Parser, Debug)]
#[command(
    name = "llmbench",
    about = "Measure generation throughput and time to first token of an OpenAI-compatible API"
)]
struct Args {
    /// Base URL of the OpenAI-compatible API (e.g. https://api.openai.com/v1)
    #[arg(short = 'u', long)]
    base_url: String,

    /// Value of the `api-version` query parameter
    #[arg(short = 'v', long)]
    api_version: Option<String>,

    /// API key for authentication
    #[arg(short = 'k', long)]
    api_key: Option<String>,

    /// Model to request; the first model listed by the endpoint when omitted
    #[arg(short = 'm', long)]
    model: Option<String>,

    /// Prompt sent with every request
    #[arg(short = 'p', long, default_value = DEFAULT_PROMPT)]
    prompt: String,

    /// Replace the default prompt with this many random words per request
    #[arg(short = 'n', long, default_value_t = 0)]
    num_words: usize,

    /// Comma-separated list of concurrency levels
    #[arg(short = 'c', long, default_value = "1,2,4,8,16,32,64,128")]
    concurrency: String,

    /// Maximum number of tokens to generate per request
    #[arg(short = 't', long, default_value_t = 512)]
    max_tokens: u32,

    /// Send `max_completion_tokens` instead of `max_tokens`
    #[arg(long)]
    use_max_completion_tokens: bool,

    /// Emit the full report in this format instead of the live table
    #[arg(short = 'f', long, value_enum)]
    format: Option<OutputFormat>,

    /// Custom header in `Key:Value` form; `{api_key}` is replaced with the API key
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Preset RooCode headers (custom headers still override them)
    #[arg(long)]
    roocode: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure_skip_tls_verify: bool,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 600)]
    request_timeout_secs: u64,

    /// Number of TCP connections averaged for the baseline latency
    #[arg(long, default_value_t = 5)]
    latency_attempts: usize,

    /// Connect timeout in seconds for each baseline latency attempt
    #[arg(long, default_value_t = 10)]
    latency_timeout_secs: u64,

    /// Enable debug logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let concurrency_levels =
        parse_concurrency_levels(&args.concurrency).context("invalid concurrency levels")?;
    if args.max_tokens == 0 {
        return Err(anyhow!("max-tokens must be greater than zero"));
    }

    let mut client_config = ClientConfig::try_new(&args.base_url, args.api_key.clone())?
        .with_api_version(args.api_version.clone())
        .with_request_timeout(Duration::from_secs(args.request_timeout_secs))
        .with_insecure_skip_tls_verify(args.insecure_skip_tls_verify)
        .with_max_completion_tokens(args.use_max_completion_tokens);

    if args.insecure_skip_tls_verify {
        eprintln!(
            "\n/!\\ WARNING: Skipping TLS certificate verification. This is insecure and should not be used in production. /!\\"
        );
    }

    if args.roocode {
        client_config = client_config
            .add_raw_header("User-Agent: RooCode/3.46.1")?
            .add_raw_header("Authorization: Bearer {api_key}")?;
    }
    for header in &args.headers {
        client_config = client_config.add_raw_header(header)?;
    }

    let client = Arc::new(OpenAiClient::try_new(client_config)?);
    let probe = TcpConnectProbe::for_url(&client.config().base_url)?
        .with_attempts(args.latency_attempts)
        .with_connect_timeout(Duration::from_secs(args.latency_timeout_secs));

    let model = match args.model.filter(|model| !model.trim().is_empty()) {
        Some(model) => model,
        None => client
            .first_available_model()
            .await
            .context("error discovering model")?,
    };

    let plan = BenchmarkPlan::try_new(
        model,
        PromptSource::from_cli(&args.prompt, args.num_words),
        args.max_tokens,
        concurrency_levels,
    )?;

    match args.format {
        None => run_table(client, &probe, &plan).await,
        Some(format) => {
            let report = run_benchmark(client, &probe, &plan, true, |_| {}).await?;
            let output = match format {
                OutputFormat::Json => report.to_json()?,
                OutputFormat::Yaml => report.to_yaml()?,
            };
            println!("{}", output);
            Ok(())
        }
    }
}

async fn run_table(
    client: Arc<OpenAiClient>,
    probe: &TcpConnectProbe,
    plan: &BenchmarkPlan,
) -> Result<()> {
    let report: BenchmarkReport = run_benchmark(client, probe, plan, true, |event| match event {
        BenchmarkEvent::Started(report) => {
            println!("{}", report.banner(Utc::now()));
            println!("{}", TABLE_HEADER);
            println!("{}", TABLE_RULE);
        }
        BenchmarkEvent::LevelCompleted(result) => println!("{}", result.table_row()),
    })
    .await?;

    println!("{}", TABLE_RULE);
    println!("\n{}", "=".repeat(100));

    let current_dir = env::current_dir().context("failed to resolve current directory")?;
    match report.save_markdown(&current_dir) {
        Ok(path) => println!("Results saved to: {}\n", path.display()),
        Err(err) => warn!("{:#}", err),
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose, env::var("RUST_LOG").ok().as_deref()))
        .with_writer(std::io::stderr)
        .init();
}

/// `RUST_LOG` wins when set and valid; otherwise WARN, or DEBUG with `--verbose`.
fn log_filter(verbose: bool, rust_log: Option<&str>) -> EnvFilter {
    let default_level = if verbose { Level::DEBUG } else { Level::WARN };
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default_level.as_str()))
}
