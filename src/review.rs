//! The review loop
//!
//! Walks the chunk list one chunk at a time: review, then test generation,
//! then (optionally) writing and running the generated tests. A chunk that
//! keeps failing is recorded in the ledger and the loop moves on; nothing a
//! single chunk does can stop the run. Cancellation is checked between
//! chunks only, so a chunk that has started always finishes.

use crate::chunk::Chunk;
use crate::config::{Config, LanguageConfig};
use crate::ledger::{self, FailedChunk};
use crate::llm::{self, BackendError, RequestKind, ReviewBackend};
use crate::retry::{retry_with_backoff, CallContext, Clock, RetryPolicy};
use crate::testing::{self, TestRunner};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Consecutive deadline failures before the loop suggests a longer timeout.
pub const TIMEOUT_WARNING_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Turn test suggestions into files and run them
    pub write_tests: bool,
    /// Leave generated test files in place after the run
    pub keep_tests: bool,
    /// Where generated tests are written and the test command runs
    pub target_dir: PathBuf,
    /// Budget for one attempt at one stage of one chunk
    pub chunk_timeout: Duration,
    /// Attempts per stage
    pub max_retries: u32,
    /// Fixed wait between stage attempts
    pub retry_delay: Duration,
    /// Backend calls (with exponential backoff) inside one attempt
    pub request_retries: u32,
    pub ledger_path: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            write_tests: false,
            keep_tests: false,
            target_dir: PathBuf::from("."),
            chunk_timeout: Duration::from_secs(5 * 60),
            max_retries: 1,
            retry_delay: Duration::from_secs(2),
            request_retries: 3,
            ledger_path: None,
        }
    }
}

impl RunOptions {
    /// Options derived from the config; CLI-only values keep their defaults.
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry_delay: config.retry_delay(),
            request_retries: config.request_retries,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub chunks_attempted: usize,
    pub empty_reviews: usize,
    pub artifacts_written: usize,
    pub tests_passed: usize,
    pub tests_failed: usize,
    pub failed: Vec<FailedChunk>,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run summary")?;
        writeln!(f, "  Chunks attempted:   {}", self.chunks_attempted)?;
        writeln!(f, "  Empty reviews:      {}", self.empty_reviews)?;
        if self.failed.is_empty() {
            writeln!(f, "  Failed chunks:      0")?;
        } else {
            let indices: Vec<String> = self.failed.iter().map(|c| c.index.to_string()).collect();
            writeln!(
                f,
                "  Failed chunks:      {} ({})",
                self.failed.len(),
                indices.join(", ")
            )?;
        }
        writeln!(f, "  Test files written: {}", self.artifacts_written)?;
        write!(
            f,
            "  Tests passed:       {}\n  Tests failed:       {}",
            self.tests_passed, self.tests_failed
        )?;
        if self.interrupted {
            write!(f, "\n  Interrupted before all chunks were processed")?;
        }
        Ok(())
    }
}

/// Counts back-to-back deadline failures.
#[derive(Debug, Default)]
struct TimeoutStreak {
    count: u32,
}

impl TimeoutStreak {
    /// Returns true once the streak reaches the warning threshold.
    fn observe<T>(&mut self, outcome: &Result<T, BackendError>) -> bool {
        match outcome {
            Err(err) if err.is_timeout() => {
                self.count += 1;
                self.count >= TIMEOUT_WARNING_THRESHOLD
            }
            _ => {
                self.count = 0;
                false
            }
        }
    }
}

#[derive(Debug, Default)]
struct RunState {
    summary: RunSummary,
    artifacts: Vec<PathBuf>,
    timeouts: TimeoutStreak,
}

impl RunState {
    fn record_failure(&mut self, chunk: &Chunk, kind: RequestKind, err: &BackendError) {
        self.summary
            .failed
            .push(FailedChunk::new(chunk.index, format!("{}: {}", kind.label(), err)));
    }

    fn observe(&mut self, chunk: &Chunk, outcome: &Result<String, BackendError>) {
        if self.timeouts.observe(outcome) {
            tracing::warn!(
                chunk = chunk.index,
                consecutive = self.timeouts.count,
                "several chunks in a row timed out; check the backend or raise --chunk-timeout"
            );
        }
    }
}

pub struct ReviewLoop<'a> {
    config: &'a Config,
    backend: &'a dyn ReviewBackend,
    runner: &'a dyn TestRunner,
    clock: &'a dyn Clock,
    options: RunOptions,
}

impl<'a> ReviewLoop<'a> {
    pub fn new(
        config: &'a Config,
        backend: &'a dyn ReviewBackend,
        runner: &'a dyn TestRunner,
        clock: &'a dyn Clock,
        options: RunOptions,
    ) -> Self {
        Self {
            config,
            backend,
            runner,
            clock,
            options,
        }
    }

    /// Process every chunk in order, then print the summary, clean up
    /// generated tests, and write the ledger if anything failed.
    pub async fn run(&self, chunks: &[Chunk], cancel: &CancellationToken) -> RunSummary {
        let mut state = RunState::default();

        for chunk in chunks {
            if cancel.is_cancelled() {
                tracing::info!(chunk = chunk.index, "interrupted, not starting further chunks");
                state.summary.interrupted = true;
                break;
            }
            self.process_chunk(chunk, &mut state).await;
        }

        self.finish(state)
    }

    async fn process_chunk(&self, chunk: &Chunk, state: &mut RunState) {
        state.summary.chunks_attempted += 1;
        let prompts = self
            .config
            .language(&chunk.language)
            .cloned()
            .unwrap_or_else(LanguageConfig::default);

        println!(
            "\n=== Chunk {} [{}] {} ===",
            chunk.index,
            chunk.language,
            chunk.location()
        );

        let review = self
            .call_with_retries(RequestKind::Review, chunk, prompts.review_prompt())
            .await;
        state.observe(chunk, &review);
        match review {
            Ok(text) if text.trim().is_empty() => {
                tracing::warn!(chunk = chunk.index, language = %chunk.language, "backend returned an empty review");
                state.summary.empty_reviews += 1;
            }
            Ok(text) => println!("{}", text.trim_end()),
            Err(err) => {
                tracing::error!(chunk = chunk.index, error = %err, "review failed, skipping chunk");
                state.record_failure(chunk, RequestKind::Review, &err);
                return;
            }
        }

        let suggestions = self
            .call_with_retries(RequestKind::TestGeneration, chunk, prompts.test_prompt())
            .await;
        state.observe(chunk, &suggestions);
        let suggestions = match suggestions {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(chunk = chunk.index, error = %err, "test generation failed, skipping chunk");
                state.record_failure(chunk, RequestKind::TestGeneration, &err);
                return;
            }
        };
        println!("\n--- Suggested tests (chunk {}) ---\n{}", chunk.index, suggestions.trim_end());

        if self.options.write_tests {
            self.write_and_run_tests(chunk, &suggestions, state);
        }
    }

    /// Up to `max_retries` attempts, each with a fresh deadline, waiting
    /// `retry_delay` between them. Every attempt may itself make up to
    /// `request_retries` backend calls, so the worst case is the product.
    async fn call_with_retries(
        &self,
        kind: RequestKind,
        chunk: &Chunk,
        prompt: &str,
    ) -> Result<String, BackendError> {
        let max_attempts = self.options.max_retries.max(1);
        let policy = RetryPolicy::new(self.options.request_retries);
        let mut attempt = 1;

        loop {
            // In-flight calls are not tied to the run's interrupt token.
            let ctx = CallContext::with_timeout(
                self.clock,
                self.options.chunk_timeout,
                CancellationToken::new(),
            );
            let span = tracing::info_span!(
                "chunk",
                chunk = chunk.index,
                language = %chunk.language,
                stage = kind.label(),
                attempt
            );
            let result = retry_with_backoff(&ctx, policy, self.clock, || {
                llm::request(self.backend, kind, prompt, &chunk.text, &chunk.language)
            })
            .instrument(span)
            .await;

            let err = match result {
                Ok(text) => return Ok(text),
                Err(err) => err,
            };

            tracing::warn!(
                chunk = chunk.index,
                attempt,
                max_attempts,
                language = %chunk.language,
                stage = kind.label(),
                error = %err,
                "attempt failed"
            );
            if attempt >= max_attempts {
                return Err(err);
            }
            self.clock.sleep(self.options.retry_delay).await;
            attempt += 1;
        }
    }

    fn write_and_run_tests(&self, chunk: &Chunk, suggestions: &str, state: &mut RunState) {
        let written = match testing::parse_and_write(
            suggestions,
            &chunk.language,
            &self.options.target_dir,
            chunk.index,
        ) {
            Ok(paths) => paths,
            Err(err) => {
                tracing::warn!(chunk = chunk.index, error = %err, "could not write generated tests");
                return;
            }
        };

        let count = written.len();
        for path in &written {
            println!("Wrote {}", path.display());
        }
        state.summary.artifacts_written += count;
        state.artifacts.extend(written);

        match self.runner.run(&chunk.language, &self.options.target_dir) {
            Ok(result) if result.passed => {
                println!("Tests passed ({} ms)", result.duration_ms);
                state.summary.tests_passed += count;
            }
            Ok(result) => {
                println!("Tests failed ({} ms)\n{}", result.duration_ms, result.output);
                state.summary.tests_failed += count;
            }
            Err(err) => {
                tracing::warn!(chunk = chunk.index, error = %err, "could not run tests");
                state.summary.tests_failed += count;
            }
        }
    }

    fn finish(&self, state: RunState) -> RunSummary {
        let RunState {
            summary, artifacts, ..
        } = state;

        println!("\n{}", summary);

        if self.options.keep_tests {
            if !artifacts.is_empty() {
                println!("Keeping {} generated test file(s)", artifacts.len());
            }
        } else {
            let removed = testing::cleanup(&artifacts);
            tracing::debug!(removed, "removed generated test files");
        }

        if summary.has_failures() {
            if let Some(path) = &self.options.ledger_path {
                match ledger::save(path, &summary.failed) {
                    Ok(()) => println!(
                        "Saved {} failed chunk(s) to {}; rerun with --resume-failed",
                        summary.failed.len(),
                        path.display()
                    ),
                    Err(err) => tracing::error!(error = %err, "could not save failed chunks"),
                }
            }
        }

        summary
    }
}
