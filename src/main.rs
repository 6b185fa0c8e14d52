use anyhow::{anyhow, Context, Result};
use clap::Parser;
use reviewloop::config::{Config, Provider};
use reviewloop::ledger;
use reviewloop::llm;
use reviewloop::retry::TokioClock;
use reviewloop::review::{ReviewLoop, RunOptions};
use reviewloop::source::{self, Mode, Target};
use reviewloop::testing::CommandTestRunner;
use reviewloop::util::parse_duration;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "reviewloop",
    about = "Chunked code review and test generation with a language model",
    version
)]
struct Args {
    /// Directory to review (and where generated tests are written)
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// File to review in review-file mode
    #[arg(long)]
    file: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Mode::DiffUncommitted)]
    mode: Mode,

    /// Base branch for diff-branch mode
    #[arg(long, default_value = "master")]
    base: String,

    /// Overrides llm_provider from the config file
    #[arg(long, value_enum)]
    llm_provider: Option<Provider>,

    /// Overrides llm_model from the config file
    #[arg(long)]
    llm_model: Option<String>,

    /// Write generated tests to disk and run them
    #[arg(long)]
    write_tests: bool,

    /// Keep generated test files after the run
    #[arg(long)]
    keep_tests: bool,

    /// Time budget for each backend attempt (e.g. 90s, 5m)
    #[arg(long, default_value = "5m", value_parser = parse_duration)]
    chunk_timeout: Duration,

    /// Attempts per chunk stage before it is recorded as failed
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    max_retries: u32,

    /// Where failed chunks are recorded
    #[arg(long, default_value = "failed_chunks.json")]
    failed_chunks_file: PathBuf,

    /// Only process the chunks recorded in --failed-chunks-file
    #[arg(long)]
    resume_failed: bool,

    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn spawn_interrupt_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing the current chunk");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let config_path = Config::resolve_path(&args.config);
    let mut config = Config::load(&config_path)?;
    config.apply_overrides(args.llm_provider, args.llm_model.as_deref());
    tracing::info!(config = %config_path.display(), "loaded configuration");
    println!(
        "Using {} provider with model {}",
        config.llm_provider.as_str(),
        config.effective_model()
    );

    let backend = llm::connect(&config)?;
    if let Err(err) = backend.health_check().await {
        let hint = match config.llm_provider {
            Provider::Hosted => format!("set {}", llm::hosted::API_KEY_ENV),
            Provider::Local => format!("start the local server at {}", config.local_endpoint),
        };
        return Err(anyhow!("{} backend is not available: {} ({})", backend.name(), err, hint));
    }

    let target = Target {
        dir: &args.dir,
        file: args.file.as_deref(),
        base: &args.base,
    };
    let mut chunks = source::build_work_list(args.mode, &target, &config)?;

    if args.resume_failed {
        let failed = ledger::load(&args.failed_chunks_file)
            .context("Cannot resume without a failed-chunks file")?;
        println!(
            "Resuming {} failed chunk(s) from {}",
            failed.len(),
            args.failed_chunks_file.display()
        );
        chunks = ledger::select_chunks(chunks, &failed);
    }

    if chunks.is_empty() {
        if args.mode.is_diff() && !args.resume_failed {
            println!("No changes to review");
        } else {
            println!("Nothing to review");
        }
        return Ok(());
    }
    println!("Reviewing {} chunk(s)", chunks.len());

    let cancel = CancellationToken::new();
    spawn_interrupt_listener(cancel.clone());

    let options = RunOptions {
        write_tests: args.write_tests,
        keep_tests: args.keep_tests,
        target_dir: args.dir.clone(),
        chunk_timeout: args.chunk_timeout,
        max_retries: args.max_retries,
        ledger_path: Some(args.failed_chunks_file.clone()),
        ..RunOptions::from_config(&config)
    };
    let runner = CommandTestRunner::new(config.test_timeout());
    let clock = TokioClock;

    let summary = ReviewLoop::new(&config, backend.as_ref(), &runner, &clock, options)
        .run(&chunks, &cancel)
        .await;

    tracing::info!(
        attempted = summary.chunks_attempted,
        failed = summary.failed.len(),
        interrupted = summary.interrupted,
        "run finished"
    );
    Ok(())
}
