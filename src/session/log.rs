/// Ordered log lines for the current session.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    lines: Vec<String>,
}

impl LogSink {
    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Lines pushed at or after `from`, for consumers that follow the log.
    #[must_use]
    pub fn since(&self, from: usize) -> &[String] {
        self.lines.get(from..).unwrap_or_default()
    }
}

/// How a log line should be presented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogLine<'a> {
    Error(&'a str),
    Spoken { speaker: &'a str, message: &'a str },
    Plain(&'a str),
}

impl<'a> LogLine<'a> {
    #[must_use]
    pub fn classify(line: &'a str) -> Self {
        if line.starts_with("ERROR:") || line.contains("Error") {
            return LogLine::Error(line);
        }
        match line.split_once(':') {
            Some((speaker, message))
                if !speaker.trim().is_empty()
                    && !speaker.contains(char::is_whitespace)
                    && !message.trim().is_empty() =>
            {
                LogLine::Spoken {
                    speaker: speaker.trim(),
                    message: message.trim(),
                }
            }
            _ => LogLine::Plain(line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_tracks_new_lines() {
        let mut sink = LogSink::default();
        sink.push("one");
        sink.push("two");
        assert_eq!(sink.since(1), ["two"]);
        assert!(sink.since(2).is_empty());
        assert!(sink.since(9).is_empty());
    }

    #[test]
    fn classify_lines() {
        assert_eq!(
            LogLine::classify("ERROR: bad key"),
            LogLine::Error("ERROR: bad key")
        );
        assert_eq!(
            LogLine::classify("Rachel: Hello there"),
            LogLine::Spoken {
                speaker: "Rachel",
                message: "Hello there"
            }
        );
        assert_eq!(
            LogLine::classify("--- Cycle 1/3 ---"),
            LogLine::Plain("--- Cycle 1/3 ---")
        );
        assert_eq!(
            LogLine::classify("Scenario Failed (4/8.0). Optimizing..."),
            LogLine::Plain("Scenario Failed (4/8.0). Optimizing...")
        );
    }
}
