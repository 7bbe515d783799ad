//! Line protocol spoken by worker programs on stdout.
//!
//! Three control shapes are recognised, everything else is a log line:
//!
//! ```text
//! STATUS: RUNNING | SUCCESS | FAILED
//! PROGRESS: <non-negative integer>     (absolute completed count)
//! MESSAGE: <free text>
//! ```
//!
//! Stderr never carries control lines.

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static STATUS_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^STATUS: (RUNNING|SUCCESS|FAILED)$").unwrap());

static PROGRESS_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^PROGRESS: (\d+)$").unwrap());

static MESSAGE_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^MESSAGE: (.*)$").unwrap());

/// Which pipe a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status a worker announces about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportedStatus {
    Running,
    Success,
    Failed,
}

impl ReportedStatus {
    fn parse(keyword: &str) -> Option<Self> {
        match keyword {
            "RUNNING" => Some(Self::Running),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether this status ends an attempt.
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// A recognised protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Status(ReportedStatus),
    Progress(u64),
    Message(String),
}

/// Result of classifying one line of worker output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Control(ControlEvent),
    Log(String),
}

impl Line {
    pub fn is_control(&self) -> bool {
        matches!(self, Line::Control(_))
    }
}

/// Classifies a single line. A trailing `\r` is dropped first.
pub fn classify(stream: Stream, line: &str) -> Line {
    let line = line.strip_suffix('\r').unwrap_or(line);

    if stream == Stream::Stdout {
        if let Some(event) = parse_control(line) {
            return Line::Control(event);
        }
    }

    Line::Log(line.to_string())
}

/// Classifies a captured sequence of lines in order.
pub fn classify_all<'a, I>(lines: I) -> Vec<Line>
where
    I: IntoIterator<Item = (Stream, &'a str)>,
{
    lines
        .into_iter()
        .map(|(stream, line)| classify(stream, line))
        .collect()
}

fn parse_control(line: &str) -> Option<ControlEvent> {
    if let Some(caps) = STATUS_LINE.captures(line) {
        return ReportedStatus::parse(caps.get(1)?.as_str()).map(ControlEvent::Status);
    }

    if let Some(caps) = PROGRESS_LINE.captures(line) {
        // Values that overflow u64 are not valid progress reports.
        return caps
            .get(1)?
            .as_str()
            .parse::<u64>()
            .ok()
            .map(ControlEvent::Progress);
    }

    MESSAGE_LINE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|text| ControlEvent::Message(text.as_str().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdout(line: &str) -> Line {
        classify(Stream::Stdout, line)
    }

    #[test]
    fn test_status_lines() {
        assert_eq!(
            stdout("STATUS: RUNNING"),
            Line::Control(ControlEvent::Status(ReportedStatus::Running))
        );
        assert_eq!(
            stdout("STATUS: SUCCESS"),
            Line::Control(ControlEvent::Status(ReportedStatus::Success))
        );
        assert_eq!(
            stdout("STATUS: FAILED"),
            Line::Control(ControlEvent::Status(ReportedStatus::Failed))
        );
    }

    #[test]
    fn test_status_is_exact() {
        assert!(!stdout("STATUS: DONE").is_control());
        assert!(!stdout("status: SUCCESS").is_control());
        assert!(!stdout("STATUS: SUCCESS ").is_control());
        assert!(!stdout(" STATUS: SUCCESS").is_control());
        assert!(!stdout("STATUS:SUCCESS").is_control());
    }

    #[test]
    fn test_progress_lines() {
        assert_eq!(stdout("PROGRESS: 0"), Line::Control(ControlEvent::Progress(0)));
        assert_eq!(stdout("PROGRESS: 42"), Line::Control(ControlEvent::Progress(42)));
        assert!(!stdout("PROGRESS: -1").is_control());
        assert!(!stdout("PROGRESS: 4.5").is_control());
        assert!(!stdout("PROGRESS: ").is_control());
        assert!(!stdout("PROGRESS: 99999999999999999999999").is_control());
    }

    #[test]
    fn test_message_lines() {
        assert_eq!(
            stdout("MESSAGE: Processing record 7"),
            Line::Control(ControlEvent::Message("Processing record 7".to_string()))
        );
        assert_eq!(
            stdout("MESSAGE: "),
            Line::Control(ControlEvent::Message(String::new()))
        );
        assert!(!stdout("MESSAGE:no space").is_control());
    }

    #[test]
    fn test_carriage_return_is_stripped() {
        assert_eq!(
            stdout("STATUS: SUCCESS\r"),
            Line::Control(ControlEvent::Status(ReportedStatus::Success))
        );
        assert_eq!(stdout("plain\r"), Line::Log("plain".to_string()));
    }

    #[test]
    fn test_stderr_is_log_only() {
        assert_eq!(
            classify(Stream::Stderr, "STATUS: SUCCESS"),
            Line::Log("STATUS: SUCCESS".to_string())
        );
        assert_eq!(
            classify(Stream::Stderr, "PROGRESS: 5"),
            Line::Log("PROGRESS: 5".to_string())
        );
    }

    #[test]
    fn test_other_lines_are_logs() {
        assert_eq!(
            stdout("This is an unrecognized log line 1"),
            Line::Log("This is an unrecognized log line 1".to_string())
        );
        assert_eq!(stdout(""), Line::Log(String::new()));
    }

    #[test]
    fn test_classification_is_idempotent() {
        let captured = vec![
            (Stream::Stdout, "STATUS: RUNNING"),
            (Stream::Stdout, "loading templates"),
            (Stream::Stderr, "warning: slow disk"),
            (Stream::Stdout, "MESSAGE: Processing record 1"),
            (Stream::Stdout, "PROGRESS: 1"),
            (Stream::Stderr, "PROGRESS: 2"),
            (Stream::Stdout, "STATUS: SUCCESS"),
        ];

        let first = classify_all(captured.clone());
        let second = classify_all(captured);
        assert_eq!(first, second);
        assert_eq!(first.iter().filter(|l| l.is_control()).count(), 4);
    }
}
