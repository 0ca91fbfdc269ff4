//! `GETINFO` request formatting and reply parsing.
//!
//! The `GETINFO` family reads controller state by key. This module owns the
//! three pieces of that exchange:
//!
//! - a **capability table** mapping each key (or key prefix ending in `/`)
//!   to a [`KeySupport`] tag: parse this value, refuse it as unsupported,
//!   or refuse it as deprecated. Keys absent from the table are unknown.
//!   Validation happens before any bytes are written to the socket.
//! - **request formatting**: `getinfo <k1> <k2> …`, keys joined by spaces.
//! - **reply parsing**: the reply body is scanned for key/value segments in
//!   two shapes, then each value runs through the parser its key maps to.
//!
//! ```text
//! single-line:  250-key=value
//! multi-line:   250+key=
//!               ...body, any text, may span lines...
//!               .
//! ```
//!
//! The trailing `250 OK` status line is not a key/value entry.
//!
//! # Example
//!
//! ```rust
//! use circuitwatch_rs::getinfo;
//! use circuitwatch_rs::framing::ControlMessage;
//!
//! let reply = ControlMessage {
//!     status: 250,
//!     raw: "250-traffic/read=41952\r\n250 OK".to_string(),
//! };
//! let values = getinfo::parse_response(&reply).unwrap();
//! assert_eq!(values["traffic/read"].as_integer(), Some(41952));
//! ```

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::error::{Error, Result};
use crate::framing::ControlMessage;

/// How a value string is turned into an [`InfoValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueParser {
    /// Keep the value verbatim.
    Text,
    /// Parse a decimal integer.
    Integer,
    /// Parse `"1"`/`"0"`.
    Boolean,
    /// Parse a router-status entry (`ns/id/<fp>` bodies).
    RouterStatus,
}

/// Capability-table tag for one key or key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySupport {
    /// Served; values run through the given parser.
    Parse(ValueParser),
    /// Deliberately not served by this client.
    NotSupported,
    /// Retired by Tor; refused locally.
    Deprecated,
}

/// A parsed `GETINFO` value.
#[derive(Debug, Clone, PartialEq)]
pub enum InfoValue {
    /// Verbatim text.
    Text(String),
    /// Decimal integer.
    Integer(i64),
    /// `"1"`/`"0"` flag.
    Boolean(bool),
    /// Router-status record from an `ns/id/<fp>` body.
    Router(RouterStatusEntry),
}

impl InfoValue {
    /// Text content, for [`Text`](Self::Text) values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            InfoValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content, for [`Integer`](Self::Integer) values.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            InfoValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Flag content, for [`Boolean`](Self::Boolean) values.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            InfoValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Router record, for [`Router`](Self::Router) values.
    pub fn as_router(&self) -> Option<&RouterStatusEntry> {
        match self {
            InfoValue::Router(r) => Some(r),
            _ => None,
        }
    }
}

/// One router-status entry, as returned for `ns/id/<fp>`.
///
/// Parsed from the `r`/`s`/`w` line group. The tracker consumes
/// [`nickname`](Self::nickname) and [`address`](Self::address); the
/// remaining fields are exposed for completeness.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterStatusEntry {
    /// Relay nickname from the `r` line.
    pub nickname: String,
    /// 40-hex-character fingerprint, decoded from the `r` line identity.
    pub fingerprint: String,
    /// Publication time from the `r` line.
    pub published: DateTime<Utc>,
    /// Dotted-quad relay address.
    pub address: String,
    /// OR port.
    pub or_port: u16,
    /// Directory port (0 when absent).
    pub dir_port: u16,
    /// Flags from the `s` line.
    pub flags: Vec<String>,
    /// `Bandwidth=` weight from the `w` line.
    pub bandwidth: Option<u64>,
    /// `Measured=` weight from the `w` line.
    pub measured: Option<u64>,
}

/// Capability table. Prefix entries end in `/`; everything else is exact.
fn capability_table() -> &'static HashMap<&'static str, KeySupport> {
    static TABLE: OnceLock<HashMap<&'static str, KeySupport>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use KeySupport::{Deprecated, NotSupported, Parse};
        use ValueParser::{Boolean, Integer, RouterStatus, Text};

        let mut table = HashMap::new();

        // Served keys.
        table.insert("version", Parse(Text));
        table.insert("config-file", Parse(Text));
        table.insert("config-text", Parse(Text));
        table.insert("address", Parse(Text));
        table.insert("fingerprint", Parse(Text));
        table.insert("traffic/read", Parse(Integer));
        table.insert("traffic/written", Parse(Integer));
        table.insert("accounting/enabled", Parse(Boolean));
        table.insert("accounting/hibernating", Parse(Text));
        table.insert("process/descriptor-limit", Parse(Integer));
        table.insert("ip-to-country/", Parse(Text));
        table.insert("next-circuit/", Parse(Text));
        table.insert("ns/id/", Parse(RouterStatus));

        // Retired by Tor.
        table.insert("network-status", Deprecated);
        table.insert("addr-mappings/", Deprecated);

        // Documented keys this client refuses to serve.
        for key in [
            "accounting/bytes",
            "accounting/bytes-left",
            "accounting/interval-start",
            "accounting/interval-wake",
            "accounting/interval-end",
            "entry-guards",
            "circuit-status",
            "stream-status",
            "orconn-status",
            "address-mappings/",
            "config/names",
            "info/names",
            "events/names",
            "features/names",
            "desc/all-recent",
            "desc/id/",
            "desc/name/",
            "md/id/",
            "md/name/",
            "extra-info/digest/",
            "dir/server/",
            "dir/status/",
            "dir/status-vote-current/",
            "ns/all",
            "ns/name/",
            "ns/purpose/",
            "status/",
            "net/listeners/",
            "exit-policy/default",
            "exit-policy/full",
            "process/pid",
            "process/uid",
            "process/user",
            "dormant",
        ] {
            table.insert(key, NotSupported);
        }

        table
    })
}

/// Looks a key up: exact match first, then the longest prefix ending in `/`.
pub fn lookup(key: &str) -> Option<KeySupport> {
    let table = capability_table();
    if let Some(support) = table.get(key) {
        return Some(*support);
    }
    table
        .iter()
        .filter(|(prefix, _)| prefix.ends_with('/') && key.starts_with(*prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, support)| *support)
}

/// Validates one key against the capability table.
///
/// # Errors
///
/// [`Error::UnsupportedKey`], [`Error::DeprecatedKey`], or
/// [`Error::UnknownKey`], matching the table's classification.
pub fn validate_key(key: &str) -> Result<ValueParser> {
    match lookup(key) {
        Some(KeySupport::Parse(parser)) => Ok(parser),
        Some(KeySupport::NotSupported) => Err(Error::UnsupportedKey(key.to_string())),
        Some(KeySupport::Deprecated) => Err(Error::DeprecatedKey(key.to_string())),
        None => Err(Error::UnknownKey(key.to_string())),
    }
}

/// Formats a `getinfo` request line, validating every key first.
///
/// The request fails as a unit: if any key is refused, no request text is
/// produced and nothing reaches the socket.
///
/// # Errors
///
/// Key-classification errors from [`validate_key`], or [`Error::Config`]
/// for an empty key list.
pub fn format_request<S: AsRef<str>>(keys: &[S]) -> Result<String> {
    if keys.is_empty() {
        return Err(Error::Config("getinfo requires at least one key".to_string()));
    }
    for key in keys {
        validate_key(key.as_ref())?;
    }
    let mut request = String::from("getinfo");
    for key in keys {
        request.push(' ');
        request.push_str(key.as_ref());
    }
    Ok(request)
}

/// Extracts and parses every key/value segment of a `GETINFO` reply.
///
/// # Errors
///
/// [`Error::Protocol`] if the reply is an error reply, [`Error::Parse`] if
/// a line fits neither segment shape nor the trailing status line, or if a
/// value fails its key's parser.
pub fn parse_response(message: &ControlMessage) -> Result<HashMap<String, InfoValue>> {
    if message.is_error() {
        return Err(Error::Protocol {
            status: message.status,
            message: message.raw.clone(),
        });
    }

    let lines: Vec<&str> = message.lines().collect();
    let mut values = HashMap::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        if let Some(entry) = line.strip_prefix("250-") {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| Error::Parse(format!("key/value line without '=': {}", line)))?;
            values.insert(key.to_string(), parse_value(key, value)?);
        } else if let Some(entry) = line.strip_prefix("250+") {
            let key = entry.strip_suffix('=').ok_or_else(|| {
                Error::Parse(format!("multi-line opener without trailing '=': {}", line))
            })?;
            let mut body = Vec::new();
            loop {
                i += 1;
                match lines.get(i) {
                    Some(&".") => break,
                    Some(&body_line) => body.push(body_line),
                    None => {
                        return Err(Error::Parse(format!(
                            "unterminated multi-line value for key {}",
                            key
                        )))
                    }
                }
            }
            values.insert(key.to_string(), parse_value(key, &body.join("\r\n"))?);
        } else if is_status_line(line) {
            // Trailing "250 OK"; not a key/value entry.
        } else {
            return Err(Error::Parse(format!(
                "unexpected line in GETINFO reply: {}",
                line
            )));
        }
        i += 1;
    }

    Ok(values)
}

/// `NNN ` final-line shape.
fn is_status_line(line: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.len() >= 4 && bytes[..3].iter().all(u8::is_ascii_digit) && bytes[3] == b' '
}

/// Runs a value through the parser its key maps to.
///
/// Keys without a `Parse` entry fall back to verbatim text: request-time
/// validation already refused anything we would not send, so an unexpected
/// reply key is preserved rather than dropped.
fn parse_value(key: &str, value: &str) -> Result<InfoValue> {
    let parser = match lookup(key) {
        Some(KeySupport::Parse(parser)) => parser,
        _ => ValueParser::Text,
    };
    match parser {
        ValueParser::Text => Ok(InfoValue::Text(value.to_string())),
        ValueParser::Integer => value
            .trim()
            .parse()
            .map(InfoValue::Integer)
            .map_err(|_| Error::Parse(format!("key {} has non-integer value: {}", key, value))),
        ValueParser::Boolean => match value.trim() {
            "1" => Ok(InfoValue::Boolean(true)),
            "0" => Ok(InfoValue::Boolean(false)),
            other => Err(Error::Parse(format!(
                "key {} has non-boolean value: {}",
                key, other
            ))),
        },
        ValueParser::RouterStatus => parse_router_status(value).map(InfoValue::Router),
    }
}

/// Parses the `r`/`s`/`w` line group of a router-status body.
///
/// The `r` line comes in two layouts: with a descriptor digest (9 tokens)
/// as `GETINFO ns/id/<fp>` returns it, and without (8 tokens) as microdesc
/// consensuses carry it. Both are accepted.
///
/// # Errors
///
/// [`Error::Parse`] when the `r` line is missing or short, the identity
/// does not decode, the nickname or address is empty, or a port or the
/// publication time does not parse.
pub fn parse_router_status(body: &str) -> Result<RouterStatusEntry> {
    let mut entry: Option<RouterStatusEntry> = None;

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(r_line) = line.strip_prefix("r ") {
            let parts: Vec<&str> = r_line.split_whitespace().collect();
            // With digest: nick identity digest date time IP ORPort DirPort
            // Without:     nick identity date time IP ORPort DirPort
            let (date_at, addr_at) = match parts.len() {
                8.. => (3, 5),
                7 => (2, 4),
                n => {
                    return Err(Error::Parse(format!(
                        "router status r line has {} fields: {}",
                        n + 1,
                        line
                    )))
                }
            };

            let nickname = parts[0].to_string();
            if nickname.is_empty() {
                return Err(Error::Parse("router status without nickname".to_string()));
            }
            let fingerprint = decode_identity(parts[1])?;
            let published = parse_published(parts[date_at], parts[date_at + 1])?;
            let address = parts[addr_at].to_string();
            if address.is_empty() {
                return Err(Error::Parse("router status without address".to_string()));
            }
            let or_port = parse_port(parts[addr_at + 1])?;
            let dir_port = parts
                .get(addr_at + 2)
                .map(|p| parse_port(p))
                .transpose()?
                .unwrap_or(0);

            entry = Some(RouterStatusEntry {
                nickname,
                fingerprint,
                published,
                address,
                or_port,
                dir_port,
                flags: Vec::new(),
                bandwidth: None,
                measured: None,
            });
        } else if let Some(flags) = line.strip_prefix("s ") {
            if let Some(ref mut entry) = entry {
                entry.flags = flags.split_whitespace().map(str::to_string).collect();
            }
        } else if let Some(weights) = line.strip_prefix("w ") {
            if let Some(ref mut entry) = entry {
                for part in weights.split_whitespace() {
                    if let Some((key, value)) = part.split_once('=') {
                        if let Ok(v) = value.parse::<u64>() {
                            match key {
                                "Bandwidth" => entry.bandwidth = Some(v),
                                "Measured" => entry.measured = Some(v),
                                _ => {}
                            }
                        }
                    }
                }
            }
        }
    }

    entry.ok_or_else(|| Error::Parse("router status body without r line".to_string()))
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse()
        .map_err(|_| Error::Parse(format!("invalid port in router status: {}", s)))
}

fn parse_published(date: &str, time: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%Y-%m-%d %H:%M:%S")
        .map_err(|e| Error::Parse(format!("invalid publication time: {}", e)))?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Decodes a base64 relay identity to its 40-character hex fingerprint.
fn decode_identity(b64: &str) -> Result<String> {
    let padded = match b64.len() % 4 {
        2 => format!("{}==", b64),
        3 => format!("{}=", b64),
        _ => b64.to_string(),
    };
    let bytes = base64_to_bytes(&padded)
        .ok_or_else(|| Error::Parse(format!("invalid base64 identity: {}", b64)))?;
    if bytes.is_empty() {
        return Err(Error::Parse("empty relay identity".to_string()));
    }
    Ok(bytes.iter().map(|b| format!("{:02X}", b)).collect())
}

/// Minimal base64 decoder for relay identities.
fn base64_to_bytes(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let input = input.trim_end_matches('=');
    let mut output = Vec::new();
    let mut buffer = 0u32;
    let mut bits = 0;

    for c in input.bytes() {
        let value = ALPHABET.iter().position(|&x| x == c)? as u32;
        buffer = (buffer << 6) | value;
        bits += 6;

        if bits >= 8 {
            bits -= 8;
            output.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    Some(output)
}
