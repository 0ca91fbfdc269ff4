//! Line framing and message assembly for the control-port byte stream.
//!
//! The control port speaks a CRLF-terminated text protocol. Two small state
//! machines turn the raw byte stream into complete protocol messages:
//!
//! ```text
//!   socket bytes ──▶ LineFramer ──▶ lines ──▶ MessageAssembler ──▶ ControlMessage
//! ```
//!
//! [`LineFramer`] buffers a partial trailing line across reads, so framing
//! is insensitive to how the transport chunks the stream. A reply split as
//! `"250 O"`, `"K\r\n"` produces the same output as the unsplit bytes.
//!
//! [`MessageAssembler`] groups lines into messages. A control-port reply is
//! complete when a line of the form `NNN ` (three digits then a space)
//! arrives and either it is the only buffered line or the buffer's first
//! line carries the same three-digit status. The second condition keeps
//! multi-line `250+key=` bodies intact: their interior lines never end the
//! message, and the closing `250 OK` does.
//!
//! Neither type interprets message content; classification lives in
//! [`ControlMessage`] accessors and downstream modules.

/// One complete control-port message.
///
/// Holds the verbatim text (interior lines joined with CRLF, no trailing
/// terminator) and the status code taken from the final line.
///
/// Status classes observed on a control connection:
///
/// | Class | Meaning |
/// |-------|---------|
/// | `2xx` | success reply |
/// | `4xx`/`5xx` | error reply |
/// | `650` | asynchronous event |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    /// Three-digit status code from the final line.
    pub status: u16,
    /// Full message text, lines joined with CRLF.
    pub raw: String,
}

impl ControlMessage {
    /// True for `2xx`, `4xx`, and `5xx` messages: replies to a command.
    pub fn is_reply(&self) -> bool {
        self.status < 600
    }

    /// True for `6xx` messages: spontaneous asynchronous events.
    pub fn is_async_event(&self) -> bool {
        self.status >= 600
    }

    /// True for `4xx` and `5xx` replies.
    pub fn is_error(&self) -> bool {
        (400..600).contains(&self.status)
    }

    /// Iterate over the message's lines.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.raw.split("\r\n")
    }
}

/// Splits arbitrary text chunks into CRLF-terminated lines.
///
/// Maintains a single pending-tail buffer. Each chunk is appended to the
/// tail and every complete line is emitted in arrival order; whatever
/// follows the last CRLF becomes the new tail.
#[derive(Debug, Default)]
pub struct LineFramer {
    tail: String,
}

impl LineFramer {
    /// Creates a framer with an empty tail.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of text, returning every line completed by it.
    ///
    /// Emitted lines have their CRLF terminator stripped.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.tail.push_str(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.tail.find("\r\n") {
            let rest = self.tail.split_off(pos + 2);
            self.tail.truncate(pos);
            lines.push(std::mem::replace(&mut self.tail, rest));
        }
        lines
    }

    /// Text received after the last complete line.
    pub fn pending(&self) -> &str {
        &self.tail
    }
}

/// Groups framed lines into complete [`ControlMessage`]s.
///
/// Lines accumulate in a pending buffer until the termination rule is met:
/// the newest line starts with three digits followed by a space, and either
/// the buffer holds only that line or the buffer's first line begins with
/// the same three digits. Interior lines of a `250+key=` body (including
/// lines that happen to start with `250-`) therefore never terminate the
/// message early.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    pending: Vec<String>,
}

impl MessageAssembler {
    /// Creates an assembler with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line; returns the completed message if this line ends one.
    pub fn push_line(&mut self, line: String) -> Option<ControlMessage> {
        self.pending.push(line);

        let last = self.pending.last().map(String::as_str)?;
        let status = final_line_status(last)?;

        let complete = self.pending.len() == 1
            || self.pending[0].as_bytes().get(..3) == last.as_bytes().get(..3);
        if !complete {
            return None;
        }

        let raw = self.pending.join("\r\n");
        self.pending.clear();
        Some(ControlMessage { status, raw })
    }

    /// Number of lines buffered for the message in progress.
    pub fn pending_lines(&self) -> usize {
        self.pending.len()
    }
}

/// Parses `NNN ` final-line form; returns the status code on match.
fn final_line_status(line: &str) -> Option<u16> {
    let bytes = line.as_bytes();
    if bytes.len() < 4 || bytes[3] != b' ' {
        return None;
    }
    if !bytes[..3].iter().all(u8::is_ascii_digit) {
        return None;
    }
    line[..3].parse().ok()
}
