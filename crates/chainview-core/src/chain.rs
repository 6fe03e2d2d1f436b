use crate::completion::PIPELINE_ERROR_MESSAGE;
use crate::record::{RecordKind, StreamRecord};
use crate::segments::{SegmentKind, SegmentParser};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

const REASONING_HEADER: &str = "> **Reasoning**";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Success,
    Pending,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainNode {
    pub title: String,
    pub content: String,
    pub status: NodeStatus,
    pub has_structured_data: bool,
    pub region: String,
    pub segment: SegmentKind,
    pub timestamp: DateTime<Utc>,
    pub record_id: String,
}

/// Rebuilds the cross-region thought chain from retained records.
pub struct ChainComposer {
    parser: SegmentParser,
    tagged_fence: Regex,
    any_fence: Regex,
}

impl Default for ChainComposer {
    fn default() -> Self {
        Self::new(SegmentParser::default())
    }
}

impl ChainComposer {
    pub fn new(parser: SegmentParser) -> Self {
        Self {
            parser,
            tagged_fence: Regex::new(r"(?im)^\s*(```|~~~)\s*(json|yaml|yml)\b")
                .expect("valid regex"),
            any_fence: Regex::new(r"(?s)```.*?```|~~~.*?~~~").expect("valid regex"),
        }
    }

    /// Orders records by emission time (stable for equal timestamps) and
    /// emits one node per parsed segment.
    pub fn compose(&self, records: &[StreamRecord]) -> Vec<ChainNode> {
        let mut ordered = records
            .iter()
            .filter(|record| !matches!(record.kind, RecordKind::Session | RecordKind::Heartbeat))
            .collect::<Vec<_>>();
        ordered.sort_by_key(|record| record.timestamp);

        let pending = pending_record_ids(&ordered);
        let mut nodes = Vec::new();
        for record in ordered {
            if record.kind == RecordKind::Error && record.content.trim().is_empty() {
                nodes.push(ChainNode {
                    title: record.source.clone(),
                    content: PIPELINE_ERROR_MESSAGE.to_string(),
                    status: NodeStatus::Error,
                    has_structured_data: false,
                    region: record.region.clone(),
                    segment: SegmentKind::Narrative,
                    timestamp: record.timestamp,
                    record_id: record.id.clone(),
                });
                continue;
            }

            let status = if record.kind == RecordKind::Error {
                NodeStatus::Error
            } else if pending.contains(record.id.as_str()) {
                NodeStatus::Pending
            } else {
                NodeStatus::Success
            };

            for segment in self.parser.parse(&record.content) {
                let content = match segment.kind {
                    SegmentKind::Reasoning => wrap_reasoning(&segment.text),
                    SegmentKind::Narrative => segment.text.clone(),
                };
                nodes.push(ChainNode {
                    title: record.source.clone(),
                    content,
                    status,
                    has_structured_data: self.has_structured_data(&segment.text),
                    region: record.region.clone(),
                    segment: segment.kind,
                    timestamp: record.timestamp,
                    record_id: record.id.clone(),
                });
            }
        }
        nodes
    }

    /// Fenced block tagged json/yaml, or a bare JSON object/array outside fences.
    pub fn has_structured_data(&self, text: &str) -> bool {
        if self.tagged_fence.is_match(text) {
            return true;
        }
        let unfenced = self.any_fence.replace_all(text, " ");
        bare_json(&unfenced, '{') || bare_json(&unfenced, '[')
    }
}

fn pending_record_ids<'a>(ordered: &[&'a StreamRecord]) -> HashSet<&'a str> {
    let mut pending = HashSet::new();
    if ordered.iter().any(|record| record.kind.is_terminal()) {
        return pending;
    }

    let mut latest: HashMap<(&str, &str), &str> = HashMap::new();
    let mut finished: HashSet<(&str, &str)> = HashSet::new();
    for &record in ordered {
        latest.insert(record.pair(), record.id.as_str());
        if record.is_final {
            finished.insert(record.pair());
        }
    }
    for (pair, id) in latest {
        if !finished.contains(&pair) {
            pending.insert(id);
        }
    }
    pending
}

fn wrap_reasoning(text: &str) -> String {
    let mut wrapped = String::from(REASONING_HEADER);
    for line in text.lines() {
        wrapped.push('\n');
        if line.trim().is_empty() {
            wrapped.push('>');
        } else {
            wrapped.push_str("> ");
            wrapped.push_str(line);
        }
    }
    wrapped
}

/// Tries every `open` position as the start of one JSON value, so stray
/// braces earlier in the text do not hide a later object.
fn bare_json(text: &str, open: char) -> bool {
    text.match_indices(open).any(|(start, _)| {
        let mut values =
            serde_json::Deserializer::from_str(&text[start..]).into_iter::<serde_json::Value>();
        matches!(
            values.next(),
            Some(Ok(serde_json::Value::Object(_) | serde_json::Value::Array(_)))
        )
    })
}
