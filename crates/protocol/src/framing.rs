//! Line framing for the control-port protocol.
//!
//! # Reply Format
//!
//! Every reply consists of one or more CRLF-terminated lines. Each line
//! starts with a three digit status code followed by a separator:
//! - `-` : a mid-reply line, more lines follow
//! - `+` : a data line, followed by a data block terminated by a lone `.`
//! - ` ` : the final line of the reply
//!
//! Replies with status `650` are asynchronous events and are not answers to
//! any command. All lines of one reply share the same status code.

use crate::error::{ProtocolError, Result};

/// Status code of a successful command.
pub const STATUS_OK: u16 = 250;

/// Status code used for asynchronous event notifications.
pub const STATUS_ASYNC_EVENT: u16 = 650;

/// Status code returned when authentication fails.
pub const STATUS_AUTH_FAILED: u16 = 515;

/// Terminator appended to every outgoing line.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Maximum number of lines accepted in a single reply, data block lines
/// included.
pub const MAX_REPLY_LINES: usize = 4096;

/// Separator kind of a reply line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// `NNN-` continuation line.
    Mid,
    /// `NNN+` line introducing a data block.
    Data,
    /// `NNN ` final line.
    End,
}

/// A single parsed reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    /// Three digit status code.
    pub code: u16,
    /// Separator kind.
    pub kind: LineKind,
    /// Text after the separator.
    pub text: String,
}

impl ReplyLine {
    /// Parses one line (without its terminator).
    pub fn parse(line: &str) -> Result<Self> {
        let bytes = line.as_bytes();
        if bytes.len() < 4 || !bytes[..3].iter().all(u8::is_ascii_digit) {
            return Err(ProtocolError::MalformedReply(line.to_string()));
        }

        let code = line[..3]
            .parse::<u16>()
            .map_err(|_| ProtocolError::MalformedReply(line.to_string()))?;

        let kind = match bytes[3] {
            b'-' => LineKind::Mid,
            b'+' => LineKind::Data,
            b' ' => LineKind::End,
            _ => return Err(ProtocolError::MalformedReply(line.to_string())),
        };

        Ok(Self {
            code,
            kind,
            text: line[4..].to_string(),
        })
    }
}

/// A complete reply, possibly spanning several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Status code shared by all lines.
    pub code: u16,
    /// Line texts in order. A data block is appended to the text of the
    /// line that introduced it, separated by `\n`.
    pub lines: Vec<String>,
}

impl Reply {
    /// Returns true for 2xx status codes.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns true if this reply is an asynchronous event.
    pub fn is_async_event(&self) -> bool {
        self.code == STATUS_ASYNC_EVENT
    }

    /// Text of the final line, typically `OK` or an error description.
    pub fn message(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or("")
    }

    /// Converts a non-success reply into an error: `515` becomes
    /// [`ProtocolError::AuthenticationRejected`], anything else
    /// [`ProtocolError::Rejected`].
    pub fn into_result(self) -> Result<Self> {
        match self.code {
            _ if self.is_ok() => Ok(self),
            STATUS_AUTH_FAILED => Err(ProtocolError::AuthenticationRejected(
                self.message().to_string(),
            )),
            code => Err(ProtocolError::Rejected {
                code,
                message: self.message().to_string(),
            }),
        }
    }

    /// Looks up a `key=value` line, as returned by `GETINFO`.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let (k, v) = line.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

/// Incremental decoder turning raw lines into complete replies.
#[derive(Debug, Default)]
pub struct ReplyDecoder {
    /// Status code of the reply being assembled.
    code: Option<u16>,
    /// Lines collected so far.
    lines: Vec<String>,
    /// Data block being collected, with the text of its header line.
    data: Option<(String, Vec<String>)>,
    /// Lines of the current reply seen so far, data block lines included.
    line_count: usize,
    /// The current reply passed the line limit; its lines are dropped until
    /// the final one.
    overflowed: bool,
}

impl ReplyDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a reply is partially assembled.
    pub fn is_partial(&self) -> bool {
        self.code.is_some()
    }

    /// Feeds one raw line and returns a reply once it is complete.
    ///
    /// Trailing CR/LF characters are ignored. On a malformed line the partial
    /// reply is discarded so the decoder can resynchronize on the next reply.
    /// A reply longer than [`MAX_REPLY_LINES`] is consumed up to its final
    /// line and then reported as [`ProtocolError::ReplyTooLong`].
    pub fn feed(&mut self, raw: &str) -> Result<Option<Reply>> {
        let line = raw.trim_end_matches(['\r', '\n']);

        if let Some((header, mut block)) = self.data.take() {
            if line == "." {
                if !self.overflowed {
                    block.insert(0, header);
                    self.lines.push(block.join("\n"));
                }
            } else {
                self.count_line();
                if self.overflowed {
                    block = Vec::new();
                } else {
                    let unescaped = line.strip_prefix('.').filter(|l| l.starts_with('.'));
                    block.push(unescaped.unwrap_or(line).to_string());
                }
                self.data = Some((header, block));
            }
            return Ok(None);
        }

        let parsed = match ReplyLine::parse(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };

        match self.code {
            Some(expected) if expected != parsed.code => {
                self.reset();
                return Err(ProtocolError::MixedStatus {
                    expected,
                    got: parsed.code,
                });
            }
            _ => self.code = Some(parsed.code),
        }

        self.count_line();

        match parsed.kind {
            LineKind::Mid => {
                if !self.overflowed {
                    self.lines.push(parsed.text);
                }
                Ok(None)
            }
            LineKind::Data => {
                self.data = Some((parsed.text, Vec::new()));
                Ok(None)
            }
            LineKind::End if self.overflowed => {
                self.reset();
                Err(ProtocolError::ReplyTooLong {
                    code: parsed.code,
                    limit: MAX_REPLY_LINES,
                })
            }
            LineKind::End => {
                self.lines.push(parsed.text);
                let reply = Reply {
                    code: parsed.code,
                    lines: std::mem::take(&mut self.lines),
                };
                self.reset();
                Ok(Some(reply))
            }
        }
    }

    fn count_line(&mut self) {
        self.line_count += 1;
        if self.line_count > MAX_REPLY_LINES && !self.overflowed {
            self.overflowed = true;
            self.lines = Vec::new();
        }
    }

    /// Discards any partially assembled reply.
    pub fn reset(&mut self) {
        self.code = None;
        self.lines.clear();
        self.data = None;
        self.line_count = 0;
        self.overflowed = false;
    }
}
