//! Asynchronous event parsing for `650` notifications.
//!
//! Tor announces circuit and stream changes as spontaneous `650` messages:
//!
//! ```text
//! 650 CIRC 4 BUILT $FP1~alpha,$FP2~beta,$FP3~gamma BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL
//! 650 STREAM 7 SENTCONNECT 4 example.com:443
//! ```
//!
//! The parameter portion after `650 <TYPE> ` is a mix of positional tokens
//! and trailing `KEY=VALUE` assignments. [`EventRecord`] captures both:
//! positional tokens in arrival order, keyword tokens in a map. The
//! tokenizer treats double-quoted substrings as atomic, so values with
//! embedded whitespace (e.g. `SUMMARY="Connecting to relay"`) survive as
//! one token.
//!
//! [`CircuitEvent`] and [`StreamEvent`] are typed views over the generic
//! record, used by the tracker.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::framing::ControlMessage;

/// Event families this client can subscribe to.
///
/// The connection enables these with `setevents stream circ` right after
/// authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Circuit status changes (`CIRC`).
    Circ,
    /// Stream status changes (`STREAM`).
    Stream,
}

impl EventType {
    /// The keyword as it appears on the wire.
    pub fn keyword(&self) -> &'static str {
        match self {
            EventType::Circ => "CIRC",
            EventType::Stream => "STREAM",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.keyword())
    }
}

impl std::str::FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CIRC" => Ok(EventType::Circ),
            "STREAM" => Ok(EventType::Stream),
            other => Err(Error::Parse(format!("unknown event type: {}", other))),
        }
    }
}

/// One parsed `650` event.
///
/// Positional tokens keep their arrival order; `KEY=VALUE` tokens are
/// collected into [`keywords`](Self::keywords) regardless of position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Event keyword, e.g. `CIRC` or `STREAM`.
    pub event_type: String,
    /// Unnamed tokens in arrival order.
    pub positional: Vec<String>,
    /// `KEY=VALUE` tokens.
    pub keywords: HashMap<String, String>,
}

impl EventRecord {
    /// Parses the first line of a `650` message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if the message is not a `650` event or has
    /// no event keyword.
    pub fn parse(message: &ControlMessage) -> Result<Self> {
        if !message.is_async_event() {
            return Err(Error::Parse(format!(
                "not an asynchronous event: {}",
                message.raw
            )));
        }
        let line = message.lines().next().unwrap_or("");
        let params = line
            .strip_prefix("650 ")
            .ok_or_else(|| Error::Parse(format!("malformed event line: {}", line)))?;

        let mut tokens = tokenize(params).into_iter();
        let event_type = tokens
            .next()
            .ok_or_else(|| Error::Parse("event line carries no keyword".to_string()))?;

        let mut positional = Vec::new();
        let mut keywords = HashMap::new();
        for token in tokens {
            match split_keyword(&token) {
                Some((key, value)) => {
                    keywords.insert(key.to_string(), value.to_string());
                }
                None => positional.push(token),
            }
        }

        Ok(EventRecord {
            event_type,
            positional,
            keywords,
        })
    }

    /// Positional token at `index`, if present.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.positional.get(index).map(String::as_str)
    }

    /// Keyword value for `key`, if present.
    pub fn keyword(&self, key: &str) -> Option<&str> {
        self.keywords.get(key).map(String::as_str)
    }
}

/// Splits on whitespace, keeping double-quoted substrings atomic.
///
/// Quotes are stripped from the emitted token; embedded whitespace inside
/// quotes is preserved.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut saw_any = false;

    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                saw_any = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if saw_any {
                    tokens.push(std::mem::take(&mut current));
                    saw_any = false;
                }
            }
            c => {
                current.push(c);
                saw_any = true;
            }
        }
    }
    if saw_any {
        tokens.push(current);
    }
    tokens
}

/// Classifies a token as `KEY=VALUE` and splits it at the first `=`.
///
/// Relay specifiers like `$FP=nickname` stay positional: a keyword key is
/// alphanumeric-or-underscore and never starts with `$`.
fn split_keyword(token: &str) -> Option<(&str, &str)> {
    let (key, value) = token.split_once('=')?;
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((key, value))
}

/// Circuit lifecycle states announced by `CIRC` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    /// Circuit construction has started.
    Launched,
    /// All hops are in place; the circuit is usable.
    Built,
    /// The circuit gained a hop.
    Extended,
    /// Construction or operation failed.
    Failed,
    /// The circuit was torn down.
    Closed,
}

impl std::str::FromStr for CircuitStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "LAUNCHED" => Ok(CircuitStatus::Launched),
            "BUILT" => Ok(CircuitStatus::Built),
            "EXTENDED" => Ok(CircuitStatus::Extended),
            "FAILED" => Ok(CircuitStatus::Failed),
            "CLOSED" => Ok(CircuitStatus::Closed),
            other => Err(Error::Parse(format!("unknown circuit status: {}", other))),
        }
    }
}

/// Stream lifecycle states announced by `STREAM` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// New connection request received.
    New,
    /// New host-resolution request received.
    NewResolve,
    /// Address remapped to another.
    Remap,
    /// Connect cell sent along a circuit.
    SentConnect,
    /// Resolve cell sent along a circuit.
    SentResolve,
    /// Stream established.
    Succeeded,
    /// Stream failed.
    Failed,
    /// Stream closed.
    Closed,
    /// Stream detached from its circuit.
    Detached,
}

impl std::str::FromStr for StreamStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NEW" => Ok(StreamStatus::New),
            "NEWRESOLVE" => Ok(StreamStatus::NewResolve),
            "REMAP" => Ok(StreamStatus::Remap),
            "SENTCONNECT" => Ok(StreamStatus::SentConnect),
            "SENTRESOLVE" => Ok(StreamStatus::SentResolve),
            "SUCCEEDED" => Ok(StreamStatus::Succeeded),
            "FAILED" => Ok(StreamStatus::Failed),
            "CLOSED" => Ok(StreamStatus::Closed),
            "DETACHED" => Ok(StreamStatus::Detached),
            other => Err(Error::Parse(format!("unknown stream status: {}", other))),
        }
    }
}

/// One hop of a circuit path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathHop {
    /// 40-hex-character relay fingerprint, without the `$` prefix.
    pub fingerprint: String,
    /// Relay nickname, when the path used a named form.
    pub nickname: Option<String>,
}

/// Typed view of a `CIRC` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitEvent {
    /// Circuit identifier.
    pub id: String,
    /// Announced status.
    pub status: CircuitStatus,
    /// Relay path, possibly empty while the circuit is young.
    pub path: Vec<PathHop>,
    /// `PURPOSE=` keyword, when present.
    pub purpose: Option<String>,
    /// `BUILD_FLAGS=` entries, comma-split.
    pub build_flags: Vec<String>,
}

impl CircuitEvent {
    /// Interprets a generic record as a `CIRC` event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] when the record is not a `CIRC` event, is
    /// missing the id or status, or carries an unknown status keyword.
    pub fn from_record(record: &EventRecord) -> Result<Self> {
        if record.event_type != "CIRC" {
            return Err(Error::Parse(format!(
                "expected CIRC event, got {}",
                record.event_type
            )));
        }
        let id = record
            .arg(0)
            .ok_or_else(|| Error::Parse("CIRC event without circuit id".to_string()))?
            .to_string();
        let status: CircuitStatus = record
            .arg(1)
            .ok_or_else(|| Error::Parse("CIRC event without status".to_string()))?
            .parse()?;
        let path = record.arg(2).map(parse_path).unwrap_or_default();
        let purpose = record.keyword("PURPOSE").map(str::to_string);
        let build_flags = record
            .keyword("BUILD_FLAGS")
            .map(|flags| flags.split(',').map(str::to_string).collect())
            .unwrap_or_default();

        Ok(CircuitEvent {
            id,
            status,
            path,
            purpose,
            build_flags,
        })
    }
}

/// Typed view of a `STREAM` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    /// Stream identifier.
    pub id: String,
    /// Announced status.
    pub status: StreamStatus,
    /// Circuit the stream is attached to (`"0"` when unattached).
    pub circuit_id: String,
    /// Connection target as `host:port`.
    pub target: String,
}

impl StreamEvent {
    /// Interprets a generic record as a `STREAM` event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] when the record is not a `STREAM` event or
    /// lacks any of the four positional fields.
    pub fn from_record(record: &EventRecord) -> Result<Self> {
        if record.event_type != "STREAM" {
            return Err(Error::Parse(format!(
                "expected STREAM event, got {}",
                record.event_type
            )));
        }
        let field = |index: usize, name: &str| {
            record
                .arg(index)
                .map(str::to_string)
                .ok_or_else(|| Error::Parse(format!("STREAM event without {}", name)))
        };
        let id = field(0, "stream id")?;
        let status: StreamStatus = field(1, "status")?.parse()?;
        let circuit_id = field(2, "circuit id")?;
        let target = field(3, "target")?;

        Ok(StreamEvent {
            id,
            status,
            circuit_id,
            target,
        })
    }

    /// The target's host portion: everything before the first `:`.
    pub fn target_host(&self) -> &str {
        self.target.split(':').next().unwrap_or(&self.target)
    }
}

/// Parses a comma-separated circuit path.
///
/// Accepts `$fingerprint`, `$fingerprint~nickname`, and the legacy
/// `$fingerprint=nickname` hop forms.
pub fn parse_path(path: &str) -> Vec<PathHop> {
    let mut hops = Vec::new();
    for hop in path.split(',') {
        let hop = hop.trim_start_matches('$');
        if let Some((fp, nick)) = hop.split_once('~') {
            hops.push(PathHop {
                fingerprint: fp.to_string(),
                nickname: Some(nick.to_string()),
            });
        } else if let Some((fp, nick)) = hop.split_once('=') {
            hops.push(PathHop {
                fingerprint: fp.to_string(),
                nickname: Some(nick.to_string()),
            });
        } else if !hop.is_empty() {
            hops.push(PathHop {
                fingerprint: hop.to_string(),
                nickname: None,
            });
        }
    }
    hops
}
