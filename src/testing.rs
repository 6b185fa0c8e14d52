//! Generated test artifacts
//!
//! Turns the model's test suggestions into files on disk, runs the project's
//! test command, and removes the files again afterwards.

use crate::util::{run_with_time_limit, tail_chars};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

const FENCE: &str = "```";
const OUTPUT_TAIL_MAX_CHARS: usize = 4_000;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("no code blocks found in model test output")]
    NoCodeBlocks,
    #[error("unsupported language for generated tests: {0}")]
    UnsupportedLanguage(String),
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How generated tests are named and run for one language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestConvention {
    pub language: &'static str,
    prefix: &'static str,
    suffix: &'static str,
    pub program: &'static str,
    pub args: &'static [&'static str],
}

impl TestConvention {
    /// `<prefix><chunk>_<block>_<nanos><suffix>`
    pub fn file_name(&self, chunk_index: usize, block: usize, nanos: i64) -> String {
        format!(
            "{}{}_{}_{}{}",
            self.prefix, chunk_index, block, nanos, self.suffix
        )
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program)
            .chain(self.args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

const CONVENTIONS: &[TestConvention] = &[
    TestConvention {
        language: "go",
        prefix: "llm_generated_test_",
        suffix: "_test.go",
        program: "go",
        args: &["test", "./..."],
    },
    TestConvention {
        language: "php",
        prefix: "LLMGeneratedTest_",
        suffix: "Test.php",
        program: "phpunit",
        args: &[],
    },
    TestConvention {
        language: "python",
        prefix: "test_llm_generated_",
        suffix: ".py",
        program: "pytest",
        args: &[],
    },
    TestConvention {
        language: "javascript",
        prefix: "llm_generated_",
        suffix: ".test.js",
        program: "npm",
        args: &["test"],
    },
];

/// Look up the naming/run convention for a language.
pub fn convention_for(language: &str) -> Result<&'static TestConvention, ArtifactError> {
    CONVENTIONS
        .iter()
        .find(|c| c.language == language)
        .ok_or_else(|| ArtifactError::UnsupportedLanguage(language.to_string()))
}

/// Bodies of every fenced code block in `text`, in order.
///
/// The opening fence's info string (` ```go `) is dropped; an unterminated
/// trailing fence is ignored.
pub fn extract_code_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find(FENCE) {
        let after_open = &rest[open + FENCE.len()..];
        let Some(close) = after_open.find(FENCE) else {
            break;
        };
        blocks.push(strip_info_string(&after_open[..close]));
        rest = &after_open[close + FENCE.len()..];
    }
    blocks
}

fn strip_info_string(inner: &str) -> &str {
    match inner.split_once('\n') {
        Some((first, body)) if is_info_string(first) => body,
        _ => inner,
    }
}

fn is_info_string(line: &str) -> bool {
    line.trim()
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '_' | '.' | '#'))
}

fn timestamp_nanos() -> i64 {
    let now = chrono::Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000))
}

/// Write every code block in `model_output` as its own test file in `dir`.
///
/// Returns the written paths in block order. Zero blocks is an error, not an
/// empty success. If any write fails, files already written by this call are
/// removed before the error is returned.
pub fn parse_and_write(
    model_output: &str,
    language: &str,
    dir: &Path,
    chunk_index: usize,
) -> Result<Vec<PathBuf>, ArtifactError> {
    write_blocks(model_output, language, dir, chunk_index, timestamp_nanos)
}

fn write_blocks(
    model_output: &str,
    language: &str,
    dir: &Path,
    chunk_index: usize,
    mut now_nanos: impl FnMut() -> i64,
) -> Result<Vec<PathBuf>, ArtifactError> {
    let convention = convention_for(language)?;
    let blocks = extract_code_blocks(model_output);
    if blocks.is_empty() {
        return Err(ArtifactError::NoCodeBlocks);
    }

    let mut written = Vec::with_capacity(blocks.len());
    for (block, content) in blocks.iter().enumerate() {
        match write_new_file(dir, convention, chunk_index, block, content, &mut now_nanos) {
            Ok(path) => written.push(path),
            Err(err) => {
                cleanup(&written);
                return Err(err);
            }
        }
    }
    Ok(written)
}

/// Create the file exclusively; on a name clash, take a fresh timestamp.
fn write_new_file(
    dir: &Path,
    convention: &TestConvention,
    chunk_index: usize,
    block: usize,
    content: &str,
    now_nanos: &mut impl FnMut() -> i64,
) -> Result<PathBuf, ArtifactError> {
    let mut nanos = now_nanos();
    loop {
        let path = dir.join(convention.file_name(chunk_index, block, nanos));
        let file = OpenOptions::new().write(true).create_new(true).open(&path);
        match file {
            Ok(mut file) => {
                if let Err(source) = file.write_all(content.as_bytes()) {
                    let _ = fs::remove_file(&path);
                    return Err(ArtifactError::Write { path, source });
                }
                return Ok(path);
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                nanos = now_nanos().max(nanos + 1);
            }
            Err(source) => return Err(ArtifactError::Write { path, source }),
        }
    }
}

/// Remove generated files. Best effort: failures are logged, not returned.
pub fn cleanup(paths: &[PathBuf]) -> usize {
    let mut removed = 0;
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "could not remove generated test file");
            }
        }
    }
    removed
}

/// Result of running tests
#[derive(Debug, Clone)]
pub struct TestResult {
    pub passed: bool,
    pub output: String,
    pub duration_ms: u64,
}

impl TestResult {
    pub fn success(output: String, duration_ms: u64) -> Self {
        Self {
            passed: true,
            output,
            duration_ms,
        }
    }

    pub fn failure(output: String, duration_ms: u64) -> Self {
        Self {
            passed: false,
            output,
            duration_ms,
        }
    }
}

/// Runs a project's test suite for a language.
pub trait TestRunner: Send + Sync {
    fn run(&self, language: &str, dir: &Path) -> Result<TestResult, ArtifactError>;
}

/// Runs the language's test command as a child process.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    timeout: Duration,
}

impl CommandTestRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl TestRunner for CommandTestRunner {
    fn run(&self, language: &str, dir: &Path) -> Result<TestResult, ArtifactError> {
        let convention = convention_for(language)?;
        Ok(run_test_command(dir, convention, self.timeout))
    }
}

/// Run a test command and capture output; the exit status alone decides.
fn run_test_command(dir: &Path, convention: &TestConvention, timeout: Duration) -> TestResult {
    let start = Instant::now();
    let mut command = Command::new(convention.program);
    command.current_dir(dir).args(convention.args);

    let result = run_with_time_limit(&mut command, timeout);
    let duration_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(out) => {
            let mut combined = out.combined();
            if out.timed_out {
                combined.push_str(&format!("\n(timed out after {}s)", timeout.as_secs()));
            }
            let combined = tail_chars(combined.trim(), OUTPUT_TAIL_MAX_CHARS);
            if out.success() {
                TestResult::success(combined, duration_ms)
            } else {
                TestResult::failure(combined, duration_ms)
            }
        }
        Err(e) => TestResult::failure(
            format!("Failed to run {}: {}", convention.command_line(), e),
            duration_ms,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_strips_info_string() {
        let blocks = extract_code_blocks("```go\nfunc TestX(t *testing.T){}\n```");
        assert_eq!(blocks, vec!["func TestX(t *testing.T){}\n"]);
    }

    #[test]
    fn test_extract_multiple_blocks_in_order() {
        let text = "Intro\n```python\ndef test_a():\n    pass\n```\nmore\n```\nx = 1\n```\ntrailing ```unclosed";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks, vec!["def test_a():\n    pass\n", "x = 1\n"]);
    }

    #[test]
    fn test_extract_keeps_code_first_line() {
        let blocks = extract_code_blocks("```\npackage main\n```");
        assert_eq!(blocks, vec!["package main\n"]);
        let blocks = extract_code_blocks("```package main_test\nimport \"testing\"\n```");
        assert_eq!(blocks, vec!["package main_test\nimport \"testing\"\n"]);
    }

    #[test]
    fn test_file_names_differ_by_timestamp() {
        let go = convention_for("go").unwrap();
        let a = go.file_name(3, 0, 1_700_000_000_000_000_001);
        let b = go.file_name(3, 0, 1_700_000_000_000_000_002);
        assert_ne!(a, b);
        assert!(a.contains("_3_0_"));
        assert!(a.ends_with("_test.go"));
    }

    #[test]
    fn test_unknown_language_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse_and_write("```\nx\n```", "cobol", dir.path(), 0).unwrap_err();
        assert!(matches!(err, ArtifactError::UnsupportedLanguage(ref l) if l == "cobol"));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_no_blocks_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse_and_write("Just add more tests.", "go", dir.path(), 0).unwrap_err();
        assert!(matches!(err, ArtifactError::NoCodeBlocks));
        assert_eq!(err.to_string(), "no code blocks found in model test output");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_go_block_becomes_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = parse_and_write(
            "```go\nfunc TestX(t *testing.T){}\n```",
            "go",
            dir.path(),
            7,
        )
        .unwrap();

        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("llm_generated_test_7_0_"));
        assert!(name.ends_with(".go"));
        assert_eq!(
            fs::read_to_string(&files[0]).unwrap(),
            "func TestX(t *testing.T){}\n"
        );
    }

    #[test]
    fn test_name_clash_takes_new_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let fixed = || 42;
        let first = write_blocks("```\na\n```", "python", dir.path(), 1, fixed).unwrap();
        let second = write_blocks("```\nb\n```", "python", dir.path(), 1, fixed).unwrap();
        assert_ne!(first, second);
        assert_eq!(fs::read_to_string(&first[0]).unwrap(), "a\n");
        assert_eq!(fs::read_to_string(&second[0]).unwrap(), "b\n");
    }

    #[test]
    fn test_write_error_leaves_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let err = parse_and_write("```\na\n```", "go", &missing, 0).unwrap_err();
        assert!(matches!(err, ArtifactError::Write { .. }));
    }

    #[test]
    fn test_cleanup_removes_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let files = parse_and_write("```\na\n```\n```\nb\n```", "php", dir.path(), 2).unwrap();
        assert_eq!(files.len(), 2);
        let mut with_missing = files.clone();
        with_missing.push(dir.path().join("already-gone.php"));
        assert_eq!(cleanup(&with_missing), 2);
        assert!(files.iter().all(|f| !f.exists()));
    }

    #[test]
    fn test_command_line() {
        assert_eq!(convention_for("go").unwrap().command_line(), "go test ./...");
        assert_eq!(convention_for("php").unwrap().command_line(), "phpunit");
    }
}
