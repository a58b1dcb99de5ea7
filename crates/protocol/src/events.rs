//! Asynchronous event parsing.
//!
//! Status events arrive as `650` replies of the form
//!
//! ```text
//! 650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=45 TAG=loading_descriptors SUMMARY="Loading relay descriptors"
//! 650 STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED
//! 650 STATUS_CLIENT NOTICE CIRCUIT_NOT_ESTABLISHED REASON=CLOCK_JUMPED
//! ```
//!
//! Only the two event kinds the connection orchestrator consumes are
//! interpreted; everything else is reported as unrecognized.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::framing::Reply;

/// Event type keyword carrying client status events.
pub const STATUS_CLIENT: &str = "STATUS_CLIENT";

/// Kinds of events a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Bootstrap progress reports.
    Status,
    /// Circuit establishment changes.
    CircuitEstablished,
}

impl EventKind {
    /// All kinds, in subscription order.
    pub const ALL: [EventKind; 2] = [EventKind::Status, EventKind::CircuitEstablished];

    /// The `SETEVENTS` keyword that must be enabled to receive this kind.
    pub fn event_type(self) -> &'static str {
        match self {
            EventKind::Status | EventKind::CircuitEstablished => STATUS_CLIENT,
        }
    }
}

/// Bootstrap completion percentage in `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BootstrapProgress(u8);

impl BootstrapProgress {
    /// Bootstrap finished.
    pub const COMPLETE: BootstrapProgress = BootstrapProgress(100);

    /// Returns `None` for values above 100.
    pub fn new(percent: u8) -> Option<Self> {
        (percent <= 100).then_some(Self(percent))
    }

    /// The percentage value.
    pub fn percent(self) -> u8 {
        self.0
    }

    /// Returns true at 100%.
    pub fn is_complete(self) -> bool {
        self.0 == 100
    }
}

impl fmt::Display for BootstrapProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// An event the orchestrator reacts to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlEvent {
    /// Bootstrap progressed.
    Bootstrap {
        /// Completion percentage.
        progress: BootstrapProgress,
        /// Machine-readable phase tag.
        tag: Option<String>,
        /// Human-readable phase summary.
        summary: Option<String>,
    },
    /// The daemon gained (`true`) or lost (`false`) the ability to build circuits.
    CircuitEstablished(bool),
}

impl ControlEvent {
    /// The subscription kind this event is delivered to.
    pub fn kind(&self) -> EventKind {
        match self {
            ControlEvent::Bootstrap { .. } => EventKind::Status,
            ControlEvent::CircuitEstablished(_) => EventKind::CircuitEstablished,
        }
    }

    /// Interprets an asynchronous reply.
    ///
    /// Returns `Ok(None)` for well-formed events of other types.
    pub fn from_reply(reply: &Reply) -> Result<Option<Self>> {
        if !reply.is_async_event() {
            return Err(ProtocolError::MalformedEvent(format!(
                "status {} is not an event",
                reply.code
            )));
        }
        let first = reply
            .lines
            .first()
            .ok_or_else(|| ProtocolError::MalformedEvent("empty event".to_string()))?;
        let status = match StatusEvent::parse(first)? {
            Some(status) => status,
            None => return Ok(None),
        };
        status.into_control_event()
    }
}

/// A parsed `STATUS_*` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Event type, e.g. `STATUS_CLIENT`.
    pub event_type: String,
    /// Severity, e.g. `NOTICE`.
    pub severity: String,
    /// Status action, e.g. `BOOTSTRAP`.
    pub action: String,
    /// `KEY=value` arguments.
    pub arguments: HashMap<String, String>,
}

impl StatusEvent {
    /// Parses the text of a `650` line. Returns `Ok(None)` for non-status events.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let (positional, arguments) = parse_arguments(text)?;
        let mut positional = positional.into_iter();

        let event_type = match positional.next() {
            Some(t) if t.starts_with("STATUS_") => t,
            Some(_) => return Ok(None),
            None => return Err(ProtocolError::MalformedEvent(text.to_string())),
        };
        let (severity, action) = match (positional.next(), positional.next()) {
            (Some(severity), Some(action)) => (severity, action),
            _ => return Err(ProtocolError::MalformedEvent(text.to_string())),
        };

        Ok(Some(Self {
            event_type,
            severity,
            action,
            arguments,
        }))
    }

    fn into_control_event(mut self) -> Result<Option<ControlEvent>> {
        if self.event_type != STATUS_CLIENT {
            return Ok(None);
        }

        match self.action.as_str() {
            "BOOTSTRAP" => {
                let raw = self.arguments.get("PROGRESS").ok_or_else(|| {
                    ProtocolError::MalformedEvent("BOOTSTRAP without PROGRESS".to_string())
                })?;
                let progress = raw
                    .parse::<u8>()
                    .ok()
                    .and_then(BootstrapProgress::new)
                    .ok_or_else(|| {
                        ProtocolError::MalformedEvent(format!("invalid PROGRESS value: {}", raw))
                    })?;
                Ok(Some(ControlEvent::Bootstrap {
                    progress,
                    tag: self.arguments.remove("TAG"),
                    summary: self.arguments.remove("SUMMARY"),
                }))
            }
            "CIRCUIT_ESTABLISHED" => Ok(Some(ControlEvent::CircuitEstablished(true))),
            "CIRCUIT_NOT_ESTABLISHED" => Ok(Some(ControlEvent::CircuitEstablished(false))),
            _ => Ok(None),
        }
    }
}

/// Splits event text into positional words and `KEY=value` arguments.
///
/// Values may be quoted; `\"` and `\\` escapes are honoured inside quotes.
pub fn parse_arguments(text: &str) -> Result<(Vec<String>, HashMap<String, String>)> {
    let mut positional = Vec::new();
    let mut arguments = HashMap::new();
    let mut chars = text.chars().peekable();

    loop {
        while chars.peek() == Some(&' ') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut word = String::new();
        let mut key: Option<String> = None;
        while let Some(&c) = chars.peek() {
            if c == ' ' {
                break;
            }
            chars.next();
            if c == '=' && key.is_none() {
                key = Some(std::mem::take(&mut word));
                if chars.peek() == Some(&'"') {
                    chars.next();
                    word = read_quoted(&mut chars, text)?;
                    break;
                }
                continue;
            }
            word.push(c);
        }

        match key {
            Some(key) => {
                arguments.insert(key, word);
            }
            None => positional.push(word),
        }
    }

    Ok((positional, arguments))
}

fn read_quoted(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, text: &str) -> Result<String> {
    let mut value = String::new();
    loop {
        match chars.next() {
            Some('\\') => match chars.next() {
                Some(escaped) => value.push(escaped),
                None => break,
            },
            Some('"') => return Ok(value),
            Some(c) => value.push(c),
            None => break,
        }
    }
    Err(ProtocolError::MalformedEvent(format!(
        "unterminated quoted value in: {}",
        text
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(text: &str) -> Reply {
        Reply {
            code: 650,
            lines: vec![text.to_string()],
        }
    }

    #[test]
    fn test_bootstrap_progress_bounds() {
        assert_eq!(BootstrapProgress::new(0).unwrap().percent(), 0);
        assert!(BootstrapProgress::new(100).unwrap().is_complete());
        assert!(BootstrapProgress::new(101).is_none());
        assert_eq!(BootstrapProgress::new(45).unwrap().to_string(), "45%");
    }

    #[test]
    fn test_parse_bootstrap_event() {
        let reply = event(
            "STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=45 TAG=loading_descriptors SUMMARY=\"Loading relay descriptors\"",
        );
        let parsed = ControlEvent::from_reply(&reply).unwrap().unwrap();
        assert_eq!(
            parsed,
            ControlEvent::Bootstrap {
                progress: BootstrapProgress::new(45).unwrap(),
                tag: Some("loading_descriptors".to_string()),
                summary: Some("Loading relay descriptors".to_string()),
            }
        );
        assert_eq!(parsed.kind(), EventKind::Status);
    }

    #[test]
    fn test_parse_circuit_events() {
        let established = event("STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED");
        assert_eq!(
            ControlEvent::from_reply(&established).unwrap(),
            Some(ControlEvent::CircuitEstablished(true))
        );

        let lost = event("STATUS_CLIENT NOTICE CIRCUIT_NOT_ESTABLISHED REASON=CLOCK_JUMPED");
        let parsed = ControlEvent::from_reply(&lost).unwrap().unwrap();
        assert_eq!(parsed, ControlEvent::CircuitEstablished(false));
        assert_eq!(parsed.kind(), EventKind::CircuitEstablished);
    }

    #[test]
    fn test_unrelated_events_are_ignored() {
        let circ = event("CIRC 12 BUILT $AAAA~relay PURPOSE=GENERAL");
        assert_eq!(ControlEvent::from_reply(&circ).unwrap(), None);

        let general = event("STATUS_GENERAL NOTICE CLOCK_JUMPED TIME=120");
        assert_eq!(ControlEvent::from_reply(&general).unwrap(), None);

        let other_action = event("STATUS_CLIENT NOTICE ENOUGH_DIR_INFO");
        assert_eq!(ControlEvent::from_reply(&other_action).unwrap(), None);
    }

    #[test]
    fn test_invalid_progress_is_malformed() {
        let reply = event("STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=250");
        assert!(matches!(
            ControlEvent::from_reply(&reply),
            Err(ProtocolError::MalformedEvent(_))
        ));

        let reply = event("STATUS_CLIENT NOTICE BOOTSTRAP TAG=done");
        assert!(ControlEvent::from_reply(&reply).is_err());
    }

    #[test]
    fn test_non_event_reply_rejected() {
        let reply = Reply {
            code: 250,
            lines: vec!["OK".to_string()],
        };
        assert!(ControlEvent::from_reply(&reply).is_err());
    }

    #[test]
    fn test_parse_arguments_escapes() {
        let (positional, args) =
            parse_arguments("WARN BUG MSG=\"say \\\"hi\\\" \\\\ bye\" COUNT=2").unwrap();
        assert_eq!(positional, vec!["WARN", "BUG"]);
        assert_eq!(args["MSG"], "say \"hi\" \\ bye");
        assert_eq!(args["COUNT"], "2");
    }

    #[test]
    fn test_parse_arguments_unterminated_quote() {
        assert!(parse_arguments("A=\"never closed").is_err());
    }

    #[test]
    fn test_status_event_too_short() {
        assert!(StatusEvent::parse("STATUS_CLIENT NOTICE").is_err());
    }
}
