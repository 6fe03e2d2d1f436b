use crate::config::{DEFAULT_REASONING_CLOSE, DEFAULT_REASONING_OPEN};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Reasoning,
    Narrative,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub text: String,
}

impl Segment {
    pub fn narrative(text: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Narrative,
            text: text.into(),
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Reasoning,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentParser {
    open: String,
    close: String,
}

impl Default for SegmentParser {
    fn default() -> Self {
        Self::with_delimiters(DEFAULT_REASONING_OPEN, DEFAULT_REASONING_CLOSE)
    }
}

impl SegmentParser {
    pub fn with_delimiters(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }

    /// Splits `text` into reasoning and narrative spans in source order.
    ///
    /// An opening delimiter without a matching close is not treated as
    /// reasoning: it and everything after it stay narrative.
    pub fn parse(&self, text: &str) -> Vec<Segment> {
        let mut segments = Vec::new();
        if self.open.is_empty() || self.close.is_empty() {
            push_trimmed(&mut segments, SegmentKind::Narrative, text);
            return segments;
        }

        let mut cursor = 0;
        while cursor < text.len() {
            let rest = &text[cursor..];
            let Some(open_at) = rest.find(self.open.as_str()) else {
                push_trimmed(&mut segments, SegmentKind::Narrative, rest);
                break;
            };

            let inner_start = cursor + open_at + self.open.len();
            let Some(close_at) = text[inner_start..].find(self.close.as_str()) else {
                push_trimmed(&mut segments, SegmentKind::Narrative, rest);
                break;
            };

            push_trimmed(&mut segments, SegmentKind::Narrative, &rest[..open_at]);
            push_trimmed(
                &mut segments,
                SegmentKind::Reasoning,
                &text[inner_start..inner_start + close_at],
            );
            cursor = inner_start + close_at + self.close.len();
        }

        segments
    }
}

fn push_trimmed(segments: &mut Vec<Segment>, kind: SegmentKind, text: &str) {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return;
    }
    segments.push(Segment {
        kind,
        text: trimmed.to_string(),
    });
}
