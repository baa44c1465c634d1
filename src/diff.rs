use similar::{Algorithm, ChangeTag, TextDiff};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Unchanged,
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffSegment {
    pub kind: SegmentKind,
    pub text: String,
}

impl DiffSegment {
    fn new(kind: SegmentKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

/// Word-level edit script from `old` to `new`.
///
/// Words and whitespace runs are separate tokens. Adjacent tokens with the same
/// tag are folded into one segment, and identical inputs always produce a
/// single [`SegmentKind::Unchanged`] segment.
#[must_use]
pub fn diff_words(old: &str, new: &str) -> Vec<DiffSegment> {
    if old == new {
        return vec![DiffSegment::new(SegmentKind::Unchanged, old)];
    }

    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .diff_words(old, new);

    let mut segments: Vec<DiffSegment> = Vec::new();
    for change in diff.iter_all_changes() {
        let kind = match change.tag() {
            ChangeTag::Equal => SegmentKind::Unchanged,
            ChangeTag::Insert => SegmentKind::Added,
            ChangeTag::Delete => SegmentKind::Removed,
        };
        match segments.last_mut() {
            Some(last) if last.kind == kind => last.text.push_str(change.value()),
            _ => segments.push(DiffSegment::new(kind, change.value())),
        }
    }
    segments
}

/// Rebuild one side of a diff: the old text when `kind` is `Removed`, the new
/// text when it is `Added`.
#[must_use]
pub fn reconstruct(segments: &[DiffSegment], side: SegmentKind) -> String {
    segments
        .iter()
        .filter(|segment| segment.kind == SegmentKind::Unchanged || segment.kind == side)
        .map(|segment| segment.text.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_is_one_unchanged_segment() {
        let text = "You are Rachel.\nBe empathetic.";
        let segments = diff_words(text, text);
        assert_eq!(
            segments,
            vec![DiffSegment::new(SegmentKind::Unchanged, text)]
        );
    }

    #[test]
    fn single_word_replacement() {
        let segments = diff_words("A B", "A C");
        assert_eq!(
            segments,
            vec![
                DiffSegment::new(SegmentKind::Unchanged, "A "),
                DiffSegment::new(SegmentKind::Removed, "B"),
                DiffSegment::new(SegmentKind::Added, "C"),
            ]
        );
    }

    #[test]
    fn both_sides_reconstruct() {
        let old = "Offer the $50 plan first. Never mention fees.";
        let new = "Empathize first, then offer the $50 plan. State the plan is interest-free.";
        let segments = diff_words(old, new);
        assert_eq!(reconstruct(&segments, SegmentKind::Removed), old);
        assert_eq!(reconstruct(&segments, SegmentKind::Added), new);
        assert!(segments.windows(2).all(|pair| pair[0].kind != pair[1].kind));
    }

    #[test]
    fn diff_is_deterministic() {
        let a = diff_words("one two three", "one three four");
        let b = diff_words("one two three", "one three four");
        assert_eq!(a, b);
    }

    #[test]
    fn empty_inputs() {
        assert_eq!(
            diff_words("", ""),
            vec![DiffSegment::new(SegmentKind::Unchanged, "")]
        );
        assert_eq!(
            diff_words("", "new"),
            vec![DiffSegment::new(SegmentKind::Added, "new")]
        );
    }
}
