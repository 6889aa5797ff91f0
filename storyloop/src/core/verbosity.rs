//! Shape heuristic separating framework chatter from agent narration.

use std::sync::LazyLock;

use regex::Regex;

/// Timestamps must start within this many characters to count.
const TIMESTAMP_WINDOW: usize = 32;
/// Structured dumps (`{...}` / `[...]`) at least this long are chatter.
const STRUCTURED_MIN_LEN: usize = 240;

static TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}|\d{2}:\d{2}:\d{2}").expect("timestamp regex is valid")
});

static LOG_LEVEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\[?(?:trace|debug|info|warn|warning|error)\]?(?:[\s:]|$)")
        .expect("log level regex is valid")
});

/// True if a line looks like internal log output a presenter may hide.
pub fn is_verbose(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }
    if has_leading_timestamp(trimmed) || LOG_LEVEL.is_match(trimmed) {
        return true;
    }
    trimmed.len() >= STRUCTURED_MIN_LEN && (trimmed.starts_with('{') || trimmed.starts_with('['))
}

fn has_leading_timestamp(line: &str) -> bool {
    TIMESTAMP
        .find(line)
        .is_some_and(|found| line[..found.start()].chars().count() < TIMESTAMP_WINDOW)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narration_is_not_verbose() {
        assert!(!is_verbose("I'll start by reading the plan file."));
        assert!(!is_verbose(""));
        assert!(!is_verbose("   "));
        assert!(!is_verbose("Information gathered, moving on."));
    }

    #[test]
    fn timestamped_lines_are_verbose() {
        assert!(is_verbose("2025-01-04T10:22:01Z tool call started"));
        assert!(is_verbose("[10:22:01] fetching"));
    }

    #[test]
    fn late_timestamps_do_not_count() {
        let line = format!("{} at 10:22:01", "x".repeat(40));
        assert!(!is_verbose(&line));
    }

    #[test]
    fn log_levels_are_verbose() {
        assert!(is_verbose("DEBUG loading config"));
        assert!(is_verbose("[info] connected"));
        assert!(is_verbose("warn: retrying"));
    }

    #[test]
    fn long_structured_dumps_are_verbose() {
        let dump = format!("{{\"type\":\"event\",\"data\":\"{}\"}}", "a".repeat(300));
        assert!(is_verbose(&dump));
        assert!(!is_verbose("{\"short\": true}"));
    }
}
