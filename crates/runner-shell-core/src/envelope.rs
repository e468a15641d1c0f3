//! Event envelopes exchanged between a session and its peer.
//!
//! An [`Envelope`] is kept as the raw JSON object it was built or received
//! as, so that [`validate`] can report structural problems (missing fields,
//! out-of-range enumerations) instead of failing inside deserialization.
//! Unknown extra fields are carried through untouched.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Fields every envelope must carry, in the order they are checked.
pub const REQUIRED_FIELDS: [&str; 7] = ["id", "sessionId", "ts", "type", "level", "seq", "payload"];

/// Sub-fields of a partial fragment descriptor.
pub const PARTIAL_FIELDS: [&str; 3] = ["id", "index", "total"];

/// Envelope event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Session announcement, sent once after connecting.
    Init,
    /// Free-form log line.
    Log,
    /// Progress or phase report.
    Status,
    /// A command started.
    CommandStart,
    /// Output chunk from a running command.
    CommandOutput,
    /// A command finished.
    CommandEnd,
    /// A file in the workspace changed.
    FileChange,
    /// Git activity (commit, push, branch).
    GitEvent,
    /// Pull request activity.
    PrEvent,
    /// Tool invocation by the agent.
    ToolEvent,
    /// Final outcome of the work.
    Result,
    /// Failure report.
    Error,
    /// Liveness signal.
    Heartbeat,
}

impl EventType {
    /// Every allowed event type.
    pub const ALL: [Self; 13] = [
        Self::Init,
        Self::Log,
        Self::Status,
        Self::CommandStart,
        Self::CommandOutput,
        Self::CommandEnd,
        Self::FileChange,
        Self::GitEvent,
        Self::PrEvent,
        Self::ToolEvent,
        Self::Result,
        Self::Error,
        Self::Heartbeat,
    ];

    /// Wire name of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Log => "log",
            Self::Status => "status",
            Self::CommandStart => "command_start",
            Self::CommandOutput => "command_output",
            Self::CommandEnd => "command_end",
            Self::FileChange => "file_change",
            Self::GitEvent => "git_event",
            Self::PrEvent => "pr_event",
            Self::ToolEvent => "tool_event",
            Self::Result => "result",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Look up a type by its wire name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Whether envelopes of this type are protocol bookkeeping rather than
    /// work for the adapter.
    #[must_use]
    pub const fn is_bookkeeping(self) -> bool {
        matches!(self, Self::Init | Self::Heartbeat)
    }
}

/// Envelope severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    /// Normal operation.
    Info,
    /// Something worth attention that did not fail.
    Warn,
    /// A failure.
    Error,
}

impl Level {
    /// Every allowed level.
    pub const ALL: [Self; 3] = [Self::Info, Self::Warn, Self::Error];

    /// Wire name of this level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Look up a level by its wire name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.as_str() == name)
    }
}

/// Fragment descriptor for an envelope that is one chunk of a larger message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partial {
    pub id: String,
    pub index: u64,
    pub total: u64,
}

/// Structural validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid type: {0}")]
    InvalidType(String),
    #[error("invalid level: {0}")]
    InvalidLevel(String),
    #[error("invalid ts: {0}")]
    InvalidTimestamp(String),
    #[error("invalid partial: {0}")]
    InvalidPartial(String),
}

/// One event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    /// Start building a fresh envelope with a new id and the current time.
    #[must_use]
    pub fn builder(session_id: impl Into<String>, event_type: EventType, seq: u64) -> EnvelopeBuilder {
        EnvelopeBuilder::new(session_id.into(), event_type, seq)
    }

    /// Wrap an already-decoded JSON object.
    #[must_use]
    pub const fn from_map(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Raw field access.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.get("id").and_then(Value::as_str)
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.get("sessionId").and_then(Value::as_str)
    }

    #[must_use]
    pub fn ts(&self) -> Option<&str> {
        self.get("ts").and_then(Value::as_str)
    }

    /// Parsed event type, `None` when absent or not one of [`EventType::ALL`].
    #[must_use]
    pub fn event_type(&self) -> Option<EventType> {
        self.get("type").and_then(Value::as_str).and_then(EventType::parse)
    }

    #[must_use]
    pub fn level(&self) -> Option<Level> {
        self.get("level").and_then(Value::as_str).and_then(Level::parse)
    }

    #[must_use]
    pub fn seq(&self) -> Option<u64> {
        self.get("seq").and_then(Value::as_u64)
    }

    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        self.get("payload")
    }

    /// Fragment descriptor, if present and well-typed.
    #[must_use]
    pub fn partial(&self) -> Option<Partial> {
        self.get("partial")
            .filter(|p| !p.is_null())
            .and_then(|p| serde_json::from_value(p.clone()).ok())
    }

    /// Borrow the underlying JSON object.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Serialize to a single JSON line (no trailing newline).
    ///
    /// # Errors
    /// Returns error if a payload value cannot be serialized.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }
}

/// Builder for outbound envelopes.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    session_id: String,
    event_type: EventType,
    level: Level,
    seq: u64,
    payload: Value,
    step: Option<String>,
    origin: Option<String>,
    partial: Option<Partial>,
}

impl EnvelopeBuilder {
    fn new(session_id: String, event_type: EventType, seq: u64) -> Self {
        Self {
            session_id,
            event_type,
            level: Level::Info,
            seq,
            payload: Value::Object(Map::new()),
            step: None,
            origin: None,
            partial: None,
        }
    }

    /// Set the level (defaults to `info`).
    #[must_use]
    pub const fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the payload (defaults to an empty object).
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    #[must_use]
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    #[must_use]
    pub fn partial(mut self, partial: Partial) -> Self {
        self.partial = Some(partial);
        self
    }

    /// Finish the envelope, stamping a new id and the current UTC time.
    #[must_use]
    pub fn build(self) -> Envelope {
        let mut fields = Map::new();
        fields.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
        fields.insert("sessionId".into(), Value::String(self.session_id));
        fields.insert("ts".into(), Value::String(now_timestamp()));
        fields.insert("type".into(), Value::String(self.event_type.as_str().into()));
        fields.insert("level".into(), Value::String(self.level.as_str().into()));
        fields.insert("seq".into(), Value::from(self.seq));
        fields.insert("payload".into(), self.payload);
        if let Some(step) = self.step {
            fields.insert("step".into(), Value::String(step));
        }
        if let Some(origin) = self.origin {
            fields.insert("origin".into(), Value::String(origin));
        }
        if let Some(partial) = self.partial {
            fields.insert(
                "partial".into(),
                serde_json::json!({
                    "id": partial.id,
                    "index": partial.index,
                    "total": partial.total,
                }),
            );
        }
        Envelope(fields)
    }
}

/// Current time as an RFC 3339 string with a `Z` suffix.
#[must_use]
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Check the structural well-formedness of an envelope.
///
/// Rules are checked in priority order and the first violation is returned:
/// required fields, type, level, timestamp, partial fragment.
///
/// # Errors
/// Returns the first [`ValidationError`] found.
pub fn validate(envelope: &Envelope) -> Result<(), ValidationError> {
    let fields = envelope.as_map();

    for key in REQUIRED_FIELDS {
        if !fields.contains_key(key) {
            return Err(ValidationError::MissingField(key));
        }
    }

    let event_type = &fields["type"];
    if event_type.as_str().and_then(EventType::parse).is_none() {
        return Err(ValidationError::InvalidType(describe(event_type)));
    }

    let level = &fields["level"];
    if level.as_str().and_then(Level::parse).is_none() {
        return Err(ValidationError::InvalidLevel(describe(level)));
    }

    let ts = &fields["ts"];
    if !ts.as_str().is_some_and(is_timestamp) {
        return Err(ValidationError::InvalidTimestamp(describe(ts)));
    }

    match fields.get("partial") {
        None | Some(Value::Null) => {}
        Some(Value::Object(partial)) => {
            if let Some(missing) = PARTIAL_FIELDS.into_iter().find(|k| !partial.contains_key(*k)) {
                return Err(ValidationError::InvalidPartial(format!("missing {missing}")));
            }
        }
        Some(_) => return Err(ValidationError::InvalidPartial("not an object".into())),
    }

    Ok(())
}

fn describe(value: &Value) -> String {
    value.as_str().map_or_else(|| value.to_string(), str::to_string)
}

/// Accepts ISO 8601 calendar timestamps: a bare date, or a date and an
/// `HH:MM[:SS[.fff]]` time joined by `T` or a space, with an optional `Z` or
/// `±HH[[:]MM]` offset.
fn is_timestamp(raw: &str) -> bool {
    if DateTime::parse_from_rfc3339(raw).is_ok() || NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok() {
        return true;
    }

    let (local, offset) = split_offset(raw);
    offset.is_none_or(is_utc_offset)
        && LOCAL_FORMATS
            .iter()
            .any(|format| NaiveDateTime::parse_from_str(local, format).is_ok())
}

const LOCAL_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Split `raw` into its local date-time and the offset digits after the sign.
fn split_offset(raw: &str) -> (&str, Option<&str>) {
    if let Some(local) = raw.strip_suffix(['Z', 'z']) {
        return (local, None);
    }
    // An offset sign can only appear in the time part, after `YYYY-MM-DDT`.
    match raw.get(11..).and_then(|time| time.rfind(['+', '-'])) {
        Some(pos) => (&raw[..11 + pos], Some(&raw[12 + pos..])),
        None => (raw, None),
    }
}

fn is_utc_offset(digits: &str) -> bool {
    if !digits.bytes().all(|b| b.is_ascii_digit() || b == b':') {
        return false;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits, "00"),
        4 => (&digits[..2], &digits[2..]),
        5 if digits.as_bytes()[2] == b':' => (&digits[..2], &digits[3..]),
        _ => return false,
    };
    matches!(
        (hours.parse::<u8>(), minutes.parse::<u8>()),
        (Ok(h), Ok(m)) if h < 24 && m < 60
    )
}
