//! Crash report rendering and size bounding.

use std::sync::LazyLock;

use regex::Regex;

/// Prefix placed on a report whose head was cut off.
pub const TRUNCATION_MARKER: &str = "[...truncated...]\n";

/// Report used when no harness is configured for the target.
pub const NO_HARNESS: &str = "No harness configured";

/// Marker used when the sidecar produced no output at all.
pub const NO_OUTPUT: &str = "No crash output captured";

/// The last sanitizer `SUMMARY:` line in a report, if any.
///
/// Used for log lines only; the full report is what the agent sees.
pub fn sanitizer_summary(text: &str) -> Option<&str> {
    static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)^SUMMARY: (\w+Sanitizer: .*?)\s*$").expect("summary regex is valid")
    });
    SUMMARY_RE
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Keep the tail of `text` so the result is at most `budget` characters.
///
/// Sanitizer summaries sit at the end of a crash log, so the head is what
/// gets dropped. Lengths are counted in chars, never bytes, so the cut never
/// lands inside a multi-byte sequence.
pub fn truncate_tail(text: &str, budget: usize) -> String {
    let total = text.chars().count();
    if total <= budget {
        return text.to_string();
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if budget <= marker_len {
        return text.chars().skip(total - budget).collect();
    }
    let keep = budget - marker_len;
    let mut out = String::with_capacity(TRUNCATION_MARKER.len() + keep * 4);
    out.push_str(TRUNCATION_MARKER);
    out.extend(text.chars().skip(total - keep));
    out
}

/// Render captured sidecar streams into one report, exit code last.
pub fn render_report(exit_code: Option<i32>, stdout: &str, stderr: &str) -> String {
    let exit_line = match exit_code {
        Some(code) => format!("Exit code: {code}"),
        None => "Exit code: unknown".to_string(),
    };
    let stdout = stdout.trim_end();
    let stderr = stderr.trim_end();
    if stdout.is_empty() && stderr.is_empty() {
        return format!("{NO_OUTPUT}\n{exit_line}\n");
    }

    let mut out = String::new();
    if !stdout.is_empty() {
        out.push_str("=== stdout ===\n");
        out.push_str(stdout);
        out.push('\n');
    }
    if !stderr.is_empty() {
        out.push_str("=== stderr ===\n");
        out.push_str(stderr);
        out.push('\n');
    }
    out.push_str(&exit_line);
    out.push('\n');
    out
}

/// Render a reproduction failure as report text.
pub fn render_error(cause: &str) -> String {
    format!("Error reproducing crash: {cause}")
}
