use crate::config::AggregatorConfig;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

const MAX_ERROR_EXCERPT: usize = 160;
const EPOCH_SECONDS_CUTOFF: f64 = 1e12;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Session,
    Message,
    Final,
    Error,
    Heartbeat,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Session => "session",
            RecordKind::Message => "message",
            RecordKind::Final => "final",
            RecordKind::Error => "error",
            RecordKind::Heartbeat => "heartbeat",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordKind::Final | RecordKind::Error)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdOrigin {
    Producer,
    Synthesized,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimestampOrigin {
    Producer,
    Receipt,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamRecord {
    pub id: String,
    pub id_origin: IdOrigin,
    pub kind: RecordKind,
    pub source: String,
    pub region: String,
    pub content: String,
    pub is_final: bool,
    pub timestamp: DateTime<Utc>,
    pub timestamp_origin: TimestampOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl StreamRecord {
    /// Builds a record with a producer-supplied id and timestamp.
    pub fn new(
        id: impl Into<String>,
        kind: RecordKind,
        source: impl Into<String>,
        region: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            id_origin: IdOrigin::Producer,
            kind,
            source: source.into(),
            region: region.into(),
            content: content.into(),
            is_final: false,
            timestamp,
            timestamp_origin: TimestampOrigin::Producer,
            result: None,
            session_id: None,
        }
    }

    pub fn with_final(mut self, is_final: bool) -> Self {
        self.is_final = is_final;
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn pair(&self) -> (&str, &str) {
        (self.source.as_str(), self.region.as_str())
    }
}

/// One server-sent event as handed over by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl RawFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Record(StreamRecord),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown event type: {0}")]
    UnknownEvent(String),
    #[error("malformed {event} payload: {reason}")]
    Malformed { event: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Record(RecordKind),
    Close,
}

fn frame_kind(name: &str) -> Option<FrameKind> {
    match name.trim().to_ascii_lowercase().as_str() {
        "session" => Some(FrameKind::Record(RecordKind::Session)),
        "message" => Some(FrameKind::Record(RecordKind::Message)),
        "final" | "final_result" => Some(FrameKind::Record(RecordKind::Final)),
        "error" => Some(FrameKind::Record(RecordKind::Error)),
        "ping" | "heartbeat" => Some(FrameKind::Record(RecordKind::Heartbeat)),
        "close" => Some(FrameKind::Close),
        _ => None,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WirePayload {
    #[serde(alias = "id")]
    message_id: Option<Value>,
    #[serde(rename = "type")]
    kind: Option<String>,
    source: Option<String>,
    region: Option<String>,
    content: Option<Value>,
    is_final: Option<bool>,
    timestamp: Option<Value>,
    result: Option<Value>,
    session_id: Option<String>,
    error: Option<String>,
    message: Option<String>,
}

/// Hands out receipt timestamps that never repeat or go backwards.
#[derive(Debug, Default, Clone)]
pub struct ReceiptClock {
    last: Option<DateTime<Utc>>,
}

impl ReceiptClock {
    pub fn next(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let stamped = match self.last {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last = Some(stamped);
        stamped
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

pub struct RecordDecoder {
    default_region: String,
    default_source: String,
    known_regions: BTreeSet<String>,
    clock: ReceiptClock,
    sequence: u64,
    session_id: Option<String>,
}

impl RecordDecoder {
    pub fn new(config: &AggregatorConfig) -> Self {
        Self {
            default_region: config.default_region.clone(),
            default_source: config.default_source.clone(),
            known_regions: config
                .known_regions
                .iter()
                .map(|region| region.trim().to_lowercase())
                .collect(),
            clock: ReceiptClock::default(),
            sequence: 0,
            session_id: None,
        }
    }

    pub fn set_session_id(&mut self, session_id: Option<String>) {
        self.session_id = session_id;
    }

    pub fn reset(&mut self) {
        self.clock.reset();
        self.sequence = 0;
        self.session_id = None;
    }

    pub fn decode(&mut self, frame: &RawFrame) -> Result<DecodedFrame, DecodeError> {
        self.decode_at(frame, Utc::now())
    }

    pub fn decode_at(
        &mut self,
        frame: &RawFrame,
        received_at: DateTime<Utc>,
    ) -> Result<DecodedFrame, DecodeError> {
        let event_name = frame
            .event
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or("message");
        let named =
            frame_kind(event_name).ok_or_else(|| DecodeError::UnknownEvent(event_name.to_string()))?;

        if named == FrameKind::Close {
            return Ok(DecodedFrame::Close);
        }

        let payload = match parse_payload(event_name, &frame.data)? {
            Some(payload) => payload,
            None if named == FrameKind::Record(RecordKind::Heartbeat) => Map::new(),
            None => {
                return Err(DecodeError::Malformed {
                    event: event_name.to_string(),
                    reason: "empty payload".to_string(),
                })
            }
        };

        let wire: WirePayload =
            serde_json::from_value(Value::Object(payload)).map_err(|err| DecodeError::Malformed {
                event: event_name.to_string(),
                reason: err.to_string(),
            })?;

        let kind = match (named, wire.kind.as_deref()) {
            (FrameKind::Record(RecordKind::Message), Some(declared)) => {
                match frame_kind(declared) {
                    Some(FrameKind::Record(kind)) => kind,
                    Some(FrameKind::Close) => return Ok(DecodedFrame::Close),
                    None => return Err(DecodeError::UnknownEvent(declared.to_string())),
                }
            }
            (FrameKind::Record(kind), _) => kind,
            (FrameKind::Close, _) => return Ok(DecodedFrame::Close),
        };

        Ok(DecodedFrame::Record(self.build_record(
            kind,
            wire,
            frame.id.as_deref(),
            received_at,
        )))
    }

    fn build_record(
        &mut self,
        kind: RecordKind,
        wire: WirePayload,
        frame_id: Option<&str>,
        received_at: DateTime<Utc>,
    ) -> StreamRecord {
        self.sequence += 1;

        let source = wire
            .source
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(self.default_source.as_str())
            .to_string();
        let region = self.route_region(wire.region.as_deref());

        let mut content = wire.content.map(content_text).unwrap_or_default();
        if kind == RecordKind::Error && content.trim().is_empty() {
            content = wire
                .error
                .or(wire.message)
                .map(|value| value.trim().to_string())
                .unwrap_or_default();
        }

        let (timestamp, timestamp_origin) = match wire.timestamp.as_ref().and_then(parse_timestamp)
        {
            Some(timestamp) => (timestamp, TimestampOrigin::Producer),
            None => {
                if let Some(raw) = wire.timestamp.as_ref().filter(|value| !value.is_null()) {
                    warn!("record_timestamp_invalid: {raw}; using receipt time");
                }
                (self.clock.next(received_at), TimestampOrigin::Receipt)
            }
        };

        let session_id = wire
            .session_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                (kind == RecordKind::Session && !content.trim().is_empty())
                    .then(|| content.trim().to_string())
            });

        let producer_id = wire
            .message_id
            .as_ref()
            .and_then(id_text)
            .or_else(|| {
                frame_id
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(ToString::to_string)
            });
        let (id, id_origin) = match producer_id {
            Some(id) => (id, IdOrigin::Producer),
            None => {
                let session = self.session_id.as_deref().unwrap_or("-");
                let digest = sha256_hex(
                    format!(
                        "{session}:{}:{kind}:{source}:{region}:{content}",
                        self.sequence
                    )
                    .as_bytes(),
                );
                (format!("rec:{}", &digest[..24]), IdOrigin::Synthesized)
            }
        };

        StreamRecord {
            id,
            id_origin,
            kind,
            source,
            region,
            content,
            is_final: wire.is_final.unwrap_or(false),
            timestamp,
            timestamp_origin,
            result: wire.result.filter(|value| !value.is_null()),
            session_id,
        }
    }

    fn route_region(&self, region: Option<&str>) -> String {
        let Some(region) = region
            .map(|value| value.trim().to_lowercase())
            .filter(|value| !value.is_empty())
        else {
            return self.default_region.clone();
        };
        if self.known_regions.is_empty() || self.known_regions.contains(&region) {
            return region;
        }
        debug!(
            region = %region,
            fallback = %self.default_region,
            "unknown_region_rerouted"
        );
        self.default_region.clone()
    }
}

fn parse_payload(event: &str, data: &str) -> Result<Option<Map<String, Value>>, DecodeError> {
    let mut text = data.trim();
    if let Some(inner) = text.strip_prefix("data:") {
        text = inner.trim();
    }
    if text.is_empty() {
        return Ok(None);
    }

    let malformed = |reason: String| DecodeError::Malformed {
        event: event.to_string(),
        reason,
    };

    let value: Value = serde_json::from_str(text)
        .map_err(|err| malformed(format!("{err} in {}", excerpt(text))))?;
    let value = match value {
        Value::String(inner) if inner.trim_start().starts_with('{') => {
            serde_json::from_str(inner.trim())
                .map_err(|err| malformed(format!("{err} in {}", excerpt(&inner))))?
        }
        other => other,
    };

    match value {
        Value::Object(map) => Ok(Some(map)),
        other => Err(malformed(format!(
            "expected a JSON object, found {}",
            json_type(&other)
        ))),
    }
}

fn content_text(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text,
        other => other.to_string(),
    }
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => {
            let text = text.trim();
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|datetime| datetime.with_timezone(&Utc))
                .or_else(|| text.parse::<f64>().ok().and_then(epoch_timestamp))
        }
        Value::Number(number) => number.as_f64().and_then(epoch_timestamp),
        _ => None,
    }
}

fn epoch_timestamp(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let millis = if value < EPOCH_SECONDS_CUTOFF {
        value * 1_000.0
    } else {
        value
    };
    Utc.timestamp_millis_opt(millis.round() as i64).single()
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= MAX_ERROR_EXCERPT {
        return text.to_string();
    }
    let mut clipped = text.chars().take(MAX_ERROR_EXCERPT).collect::<String>();
    clipped.push('…');
    clipped
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
