use crate::model::Transcript;

const AGENT_SPEAKER: &str = "agent";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptLine {
    pub speaker: String,
    pub content: String,
}

impl TranscriptLine {
    /// The agent is drawn differently from personas. Nothing else depends on this.
    #[must_use]
    pub fn is_agent(&self) -> bool {
        self.speaker.trim().eq_ignore_ascii_case(AGENT_SPEAKER)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedTranscript {
    pub lines: Vec<TranscriptLine>,
    /// Non-blank lines that had no `speaker: content` shape.
    pub unparseable: Vec<String>,
}

/// Normalize a transcript into speaker-tagged lines.
#[must_use]
pub fn parse(transcript: &Transcript) -> ParsedTranscript {
    match transcript {
        Transcript::Structured(turns) => ParsedTranscript {
            lines: turns
                .iter()
                .map(|turn| TranscriptLine {
                    speaker: turn.role.clone(),
                    content: turn.content.clone(),
                })
                .collect(),
            unparseable: Vec::new(),
        },
        Transcript::Text(text) => parse_text(text),
    }
}

fn parse_text(text: &str) -> ParsedTranscript {
    let mut parsed = ParsedTranscript::default();
    for raw in text.lines() {
        if raw.trim().is_empty() {
            continue;
        }
        match split_line(raw) {
            Some(line) => parsed.lines.push(line),
            None => {
                tracing::debug!(line = raw, "transcript line has no speaker");
                parsed.unparseable.push(raw.to_string());
            }
        }
    }
    parsed
}

fn split_line(raw: &str) -> Option<TranscriptLine> {
    let (speaker, content) = raw.split_once(':')?;
    let speaker = speaker.trim();
    let content = content.trim();
    if speaker.is_empty() || content.is_empty() {
        return None;
    }
    Some(TranscriptLine {
        speaker: speaker.to_string(),
        content: content.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Turn;

    #[test]
    fn text_transcript_splits_on_first_colon() {
        let parsed = parse(&Transcript::Text(
            "agent: Hi, this is Rachel.\npersona: Call me at 5:30".into(),
        ));
        assert_eq!(parsed.lines.len(), 2);
        assert!(parsed.lines[0].is_agent());
        assert_eq!(parsed.lines[1].speaker, "persona");
        assert_eq!(parsed.lines[1].content, "Call me at 5:30");
        assert!(parsed.unparseable.is_empty());
    }

    #[test]
    fn lines_without_speaker_are_flagged_not_guessed() {
        let parsed = parse(&Transcript::Text(
            "Agent: Hello\n\n(line noise)\ndefaulter:   \nDefaulter: fine".into(),
        ));
        let speakers: Vec<_> = parsed.lines.iter().map(|l| l.speaker.as_str()).collect();
        assert_eq!(speakers, ["Agent", "Defaulter"]);
        assert_eq!(parsed.unparseable, ["(line noise)", "defaulter:   "]);
    }

    #[test]
    fn agent_check_is_case_insensitive() {
        let line = TranscriptLine {
            speaker: "AGENT".into(),
            content: "ok".into(),
        };
        assert!(line.is_agent());
        let line = TranscriptLine {
            speaker: "agent smith".into(),
            content: "ok".into(),
        };
        assert!(!line.is_agent());
    }

    #[test]
    fn structured_turns_map_directly() {
        let parsed = parse(&Transcript::Structured(vec![
            Turn {
                role: "agent".into(),
                content: "Hello".into(),
            },
            Turn {
                role: "defaulter".into(),
                content: "Who is this?".into(),
            },
        ]));
        assert_eq!(parsed.lines.len(), 2);
        assert_eq!(parsed.lines[1].content, "Who is this?");
        assert!(!parsed.lines[1].is_agent());
    }
}
