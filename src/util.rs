use regex::Regex;
use std::io::{self, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// First `max_chars` characters of `text` (Unicode-safe), with `...`
/// appended when anything was cut.
pub fn head_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Last `max_chars` characters of `text` (Unicode-safe).
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect::<String>()
}

/// Parse durations like `90s`, `5m`, `1h30m` or `250ms`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let text = input.trim();
    let whole = Regex::new(r"^(?:\d+(?:ms|s|m|h))+$").map_err(|e| e.to_string())?;
    if !whole.is_match(text) {
        return Err(format!(
            "invalid duration '{}' (expected e.g. 500ms, 30s, 5m, 1h)",
            input
        ));
    }

    let part = Regex::new(r"(\d+)(ms|s|m|h)").map_err(|e| e.to_string())?;
    let mut total = Duration::ZERO;
    for caps in part.captures_iter(text) {
        let value: u64 = caps[1]
            .parse()
            .map_err(|_| format!("duration value too large: '{}'", input))?;
        let step = match &caps[2] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            _ => Duration::from_secs(value.saturating_mul(3_600)),
        };
        total = total.saturating_add(step);
    }

    if total.is_zero() {
        return Err("duration must be greater than zero".to_string());
    }
    Ok(total)
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured result of a child process run under a time limit.
#[derive(Debug)]
pub struct CommandOutput {
    /// `None` if the process could not be reaped after a kill
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && matches!(self.status, Some(status) if status.success())
    }

    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        [self.stdout.trim(), self.stderr.trim()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Run `command` with stdin closed, killing it if it outlives `limit`.
///
/// Both pipes are drained on their own threads so a chatty child can't
/// fill a pipe and stall.
pub fn run_with_time_limit(command: &mut Command, limit: Duration) -> io::Result<CommandOutput> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + limit;
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if Instant::now() >= deadline {
            timed_out = true;
            let _ = child.kill();
            break child.wait().ok();
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(CommandOutput {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
        timed_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_chars_marks_cut() {
        assert_eq!(head_chars("ééééé", 2), "éé...");
        assert_eq!(head_chars("ok", 10), "ok");
        assert_eq!(head_chars("abc", 3), "abc");
        assert_eq!(head_chars("abc", 0), "...");
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("abcdef", 2), "ef");
        assert_eq!(tail_chars("ab", 5), "ab");
        assert_eq!(tail_chars("ab", 0), "");
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7_200)));
        assert_eq!(parse_duration("1m30s"), Ok(Duration::from_secs(90)));
    }

    #[test]
    fn test_parse_duration_rejects_bad_input() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("five minutes").is_err());
        assert!(parse_duration("0s").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_status_decides_success() {
        let ok = run_with_time_limit(&mut Command::new("true"), Duration::from_secs(10)).unwrap();
        assert!(ok.success());
        let failed =
            run_with_time_limit(&mut Command::new("false"), Duration::from_secs(10)).unwrap();
        assert!(!failed.success());
        assert!(!failed.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn test_output_is_captured_from_both_pipes() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2"]);
        let output = run_with_time_limit(&mut cmd, Duration::from_secs(10)).unwrap();
        assert_eq!(output.combined(), "out\nerr");
    }

    #[cfg(unix)]
    #[test]
    fn test_slow_command_is_killed() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let output = run_with_time_limit(&mut cmd, Duration::from_millis(100)).unwrap();
        assert!(output.timed_out);
        assert!(!output.success());
    }

    #[test]
    fn test_missing_program_is_error() {
        let mut cmd = Command::new("definitely-not-a-real-binary-4242");
        assert!(run_with_time_limit(&mut cmd, Duration::from_secs(1)).is_err());
    }
}
