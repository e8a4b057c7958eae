//! Frame parsing, validation and serialization.

use std::fmt::Write as _;

use crate::command::Command;
use crate::error::{FrameError, Result};
use crate::header;
use crate::headers::Headers;
use crate::negotiate::HeartBeat;

/// End-of-frame sentinel.
pub const TERMINATOR: char = '\0';

/// One protocol message unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    command: Command,
    headers: Headers,
    body: String,
}

impl Frame {
    /// Frame with no headers and an empty body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Headers::new(),
            body: String::new(),
        }
    }

    /// Builder: set a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.headers.insert(key, value);
        self
    }

    /// Builder: set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// The command.
    pub fn command(&self) -> Command {
        self.command
    }

    /// All headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Value of one header.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// The body text.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Check the required-header set for the frame's command.
    pub fn validate(&self) -> Result<()> {
        match self
            .command
            .required_headers()
            .iter()
            .copied()
            .find(|name| !self.headers.contains(name))
        {
            Some(missing) => Err(FrameError::MissingHeader {
                command: self.command,
                header: missing,
            }),
            None => Ok(()),
        }
    }

    /// Parse one terminated frame from wire text.
    ///
    /// Leading EOLs (heart-beats) before the command and trailing EOLs after
    /// the terminator are ignored. A `content-length` header, when present,
    /// bounds the body so it may contain NUL bytes.
    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw.trim_start_matches(['\r', '\n']);
        if rest.is_empty() {
            return Err(FrameError::protocol("empty frame"));
        }

        let (command_line, mut rest) =
            next_line(rest).ok_or_else(|| FrameError::protocol("missing header/body separator"))?;
        if command_line.is_empty() {
            return Err(FrameError::protocol("missing command"));
        }
        let command: Command = command_line.parse()?;

        let mut headers = Headers::new();
        loop {
            let (line, after) = next_line(rest)
                .ok_or_else(|| FrameError::protocol("missing header/body separator"))?;
            rest = after;
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::protocol(format!("malformed header line '{line}'")))?;
            let (key, value) = if command.escapes_headers() {
                (unescape(key)?, unescape(value)?)
            } else {
                (key.to_owned(), value.to_owned())
            };
            // Repeated header: the last occurrence replaces earlier ones.
            let _ = headers.insert(key, value);
        }

        let (body, trailer) = match headers.get(header::CONTENT_LENGTH) {
            Some(length) => split_sized_body(rest, length)?,
            None => {
                let end = rest
                    .find(TERMINATOR)
                    .ok_or_else(|| FrameError::protocol("missing frame terminator"))?;
                (&rest[..end], &rest[end + 1..])
            }
        };
        if !trailer.chars().all(|c| c == '\r' || c == '\n') {
            return Err(FrameError::protocol("unexpected data after frame terminator"));
        }

        let frame = Self {
            command,
            headers,
            body: body.to_owned(),
        };
        frame.validate()?;
        Ok(frame)
    }

    /// Wire text for this frame, terminator included.
    ///
    /// A body containing NUL gets a `content-length` header so it parses back
    /// intact.
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.command.as_str());
        out.push('\n');
        for (key, value) in self.headers.iter() {
            if self.command.escapes_headers() {
                let _ = writeln!(out, "{}:{}", escape(key), escape(value));
            } else {
                let _ = writeln!(out, "{key}:{value}");
            }
        }
        if self.body.contains(TERMINATOR) && !self.headers.contains(header::CONTENT_LENGTH) {
            let _ = writeln!(out, "{}:{}", header::CONTENT_LENGTH, self.body.len());
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push(TERMINATOR);
        out
    }

    /// Value of the `receipt` header, if the sender asked for one.
    pub fn receipt_request(&self) -> Option<&str> {
        self.header(header::RECEIPT)
    }

    /// RECEIPT frame acknowledging this frame's `receipt` header.
    pub fn receipt(&self) -> Option<Self> {
        self.receipt_request()
            .map(|id| Self::new(Command::Receipt).with_header(header::RECEIPT_ID, id))
    }

    /// CONNECTED reply to a handshake.
    pub fn connected(version: &str, heart_beat: HeartBeat, server: &str, session: &str) -> Self {
        Self::new(Command::Connected)
            .with_header(header::VERSION, version)
            .with_header(header::HEART_BEAT, heart_beat.to_string())
            .with_header(header::SERVER, server)
            .with_header(header::SESSION, session)
    }

    /// MESSAGE frame delivered for a subscription.
    pub fn message(
        destination: &str,
        message_id: &str,
        subscription: &str,
        body: impl Into<String>,
    ) -> Self {
        Self::new(Command::Message)
            .with_header(header::DESTINATION, destination)
            .with_header(header::MESSAGE_ID, message_id)
            .with_header(header::SUBSCRIPTION, subscription)
            .with_body(body)
    }

    /// ERROR frame with a short `message` header and a detail body.
    pub fn error(message: &str, details: impl Into<String>) -> Self {
        Self::new(Command::Error)
            .with_header(header::MESSAGE, message)
            .with_header(header::CONTENT_TYPE, "text/plain")
            .with_body(details)
    }

    /// ERROR frame describing a codec failure.
    pub fn from_error(err: &FrameError) -> Self {
        Self::error(err.code(), err.to_string())
    }
}

/// Whether `raw` is a bare heart-beat (only EOLs).
pub fn is_heartbeat(raw: &str) -> bool {
    !raw.is_empty() && raw.chars().all(|c| c == '\r' || c == '\n')
}

/// Split off one LF-terminated line, dropping a trailing CR.
fn next_line(input: &str) -> Option<(&str, &str)> {
    let end = input.find('\n')?;
    let line = &input[..end];
    Some((line.strip_suffix('\r').unwrap_or(line), &input[end + 1..]))
}

fn split_sized_body<'a>(rest: &'a str, length: &str) -> Result<(&'a str, &'a str)> {
    let length: usize = length
        .trim()
        .parse()
        .map_err(|_| FrameError::protocol(format!("invalid content-length '{length}'")))?;
    if rest.len() <= length || !rest.is_char_boundary(length) {
        return Err(FrameError::protocol("body shorter than content-length"));
    }
    let (body, after) = rest.split_at(length);
    let trailer = after
        .strip_prefix(TERMINATOR)
        .ok_or_else(|| FrameError::protocol("missing frame terminator"))?;
    Ok((body, trailer))
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            other => {
                let seq = other.map(String::from).unwrap_or_default();
                return Err(FrameError::protocol(format!(
                    "invalid header escape '\\{seq}'"
                )));
            }
        }
    }
    Ok(out)
}
