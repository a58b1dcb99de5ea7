//! Control-port command definitions.
//!
//! Commands are encoded as a single CRLF-terminated line: a keyword followed
//! by space-separated arguments. Configuration values containing spaces,
//! quotes or backslashes are sent as quoted strings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::framing::LINE_TERMINATOR;

/// Signals accepted by the `SIGNAL` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    /// Reload configuration and rebuild circuits as needed.
    Reload,
    /// Switch to clean circuits for new connections.
    Newnym,
}

impl Signal {
    /// Returns the keyword used on the wire.
    pub fn keyword(self) -> &'static str {
        match self {
            Signal::Reload => "RELOAD",
            Signal::Newnym => "NEWNYM",
        }
    }
}

/// A command sent to the daemon's control port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Authenticate with the raw bytes of the authentication cookie.
    Authenticate(Vec<u8>),
    /// Set one or more configuration values.
    SetConf(Vec<(String, String)>),
    /// Reset configuration keys to their defaults.
    ResetConf(Vec<String>),
    /// Replace the set of subscribed asynchronous event types.
    SetEvents(Vec<String>),
    /// Query information keys.
    GetInfo(Vec<String>),
    /// Send a signal.
    Signal(Signal),
}

impl Command {
    /// Convenience constructor for a single `SETCONF` pair.
    pub fn set_conf(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::SetConf(vec![(key.into(), value.into())])
    }

    /// Returns the command keyword.
    pub fn keyword(&self) -> &'static str {
        match self {
            Command::Authenticate(_) => "AUTHENTICATE",
            Command::SetConf(_) => "SETCONF",
            Command::ResetConf(_) => "RESETCONF",
            Command::SetEvents(_) => "SETEVENTS",
            Command::GetInfo(_) => "GETINFO",
            Command::Signal(_) => "SIGNAL",
        }
    }

    /// Encodes the command as a wire line including the terminator.
    pub fn encode(&self) -> Result<String> {
        let mut line = String::from(self.keyword());

        match self {
            Command::Authenticate(cookie) => {
                line.push(' ');
                line.push_str(&hex::encode_upper(cookie));
            }
            Command::SetConf(pairs) => {
                if pairs.is_empty() {
                    return Err(ProtocolError::InvalidArgument(
                        "SETCONF requires at least one key".to_string(),
                    ));
                }
                for (key, value) in pairs {
                    validate_keyword(key)?;
                    line.push(' ');
                    line.push_str(key);
                    line.push('=');
                    line.push_str(&quote_value(value)?);
                }
            }
            Command::ResetConf(keys) | Command::GetInfo(keys) | Command::SetEvents(keys) => {
                if keys.is_empty() && !matches!(self, Command::SetEvents(_)) {
                    return Err(ProtocolError::InvalidArgument(format!(
                        "{} requires at least one key",
                        self.keyword()
                    )));
                }
                for key in keys {
                    validate_keyword(key)?;
                    line.push(' ');
                    line.push_str(key);
                }
            }
            Command::Signal(signal) => {
                line.push(' ');
                line.push_str(signal.keyword());
            }
        }

        line.push_str(LINE_TERMINATOR);
        Ok(line)
    }
}

impl fmt::Display for Command {
    /// Human-readable form for logging. Cookie bytes are never printed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Authenticate(_) => write!(f, "AUTHENTICATE <cookie>"),
            Command::SetConf(pairs) => {
                write!(f, "SETCONF")?;
                for (key, value) in pairs {
                    write!(f, " {}={}", key, value)?;
                }
                Ok(())
            }
            Command::ResetConf(keys) | Command::GetInfo(keys) | Command::SetEvents(keys) => {
                write!(f, "{}", self.keyword())?;
                for key in keys {
                    write!(f, " {}", key)?;
                }
                Ok(())
            }
            Command::Signal(signal) => write!(f, "SIGNAL {}", signal.keyword()),
        }
    }
}

/// Keys and keywords may not contain whitespace, quotes or `=`.
fn validate_keyword(key: &str) -> Result<()> {
    let invalid = key.is_empty()
        || key
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '"' || c == '=');
    if invalid {
        return Err(ProtocolError::InvalidArgument(format!("invalid key: {:?}", key)));
    }
    Ok(())
}

/// Quotes a configuration value if it contains characters that need it.
pub fn quote_value(value: &str) -> Result<String> {
    if value.contains(['\r', '\n']) {
        return Err(ProtocolError::InvalidArgument(
            "configuration values cannot span lines".to_string(),
        ));
    }

    let needs_quotes =
        value.is_empty() || value.chars().any(|c| c == ' ' || c == '"' || c == '\\');
    if !needs_quotes {
        return Ok(value.to_string());
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    Ok(quoted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_authenticate_uses_uppercase_hex() {
        let cmd = Command::Authenticate(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(cmd.encode().unwrap(), "AUTHENTICATE DEADBEEF\r\n");
    }

    #[test]
    fn test_display_hides_cookie() {
        let cmd = Command::Authenticate(vec![0xde, 0xad]);
        assert_eq!(cmd.to_string(), "AUTHENTICATE <cookie>");
    }

    #[test]
    fn test_encode_setconf_multiple_pairs() {
        let cmd = Command::SetConf(vec![
            ("ClientPreferIPv6DirPort".to_string(), "auto".to_string()),
            ("ClientUseIPv4".to_string(), "1".to_string()),
        ]);
        assert_eq!(
            cmd.encode().unwrap(),
            "SETCONF ClientPreferIPv6DirPort=auto ClientUseIPv4=1\r\n"
        );
    }

    #[test]
    fn test_encode_setconf_quotes_spaces() {
        let cmd = Command::set_conf("Bridge", "obfs4 192.0.2.1:443 cert=\"x\"");
        assert_eq!(
            cmd.encode().unwrap(),
            "SETCONF Bridge=\"obfs4 192.0.2.1:443 cert=\\\"x\\\"\"\r\n"
        );
    }

    #[test]
    fn test_encode_setconf_rejects_newline() {
        let cmd = Command::set_conf("Nickname", "a\r\nSIGNAL SHUTDOWN");
        assert!(matches!(
            cmd.encode(),
            Err(ProtocolError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_encode_setconf_rejects_bad_key() {
        let cmd = Command::set_conf("Bad Key", "1");
        assert!(cmd.encode().is_err());

        let cmd = Command::SetConf(Vec::new());
        assert!(cmd.encode().is_err());
    }

    #[test]
    fn test_encode_setevents_allows_empty() {
        assert_eq!(Command::SetEvents(Vec::new()).encode().unwrap(), "SETEVENTS\r\n");
        assert_eq!(
            Command::SetEvents(vec!["STATUS_CLIENT".to_string()])
                .encode()
                .unwrap(),
            "SETEVENTS STATUS_CLIENT\r\n"
        );
    }

    #[test]
    fn test_encode_getinfo_and_resetconf() {
        let cmd = Command::GetInfo(vec!["status/circuit-established".to_string()]);
        assert_eq!(
            cmd.encode().unwrap(),
            "GETINFO status/circuit-established\r\n"
        );

        let cmd = Command::ResetConf(vec!["Bridge".to_string()]);
        assert_eq!(cmd.encode().unwrap(), "RESETCONF Bridge\r\n");

        assert!(Command::GetInfo(Vec::new()).encode().is_err());
    }

    #[test]
    fn test_encode_signals() {
        assert_eq!(
            Command::Signal(Signal::Reload).encode().unwrap(),
            "SIGNAL RELOAD\r\n"
        );
        assert_eq!(
            Command::Signal(Signal::Newnym).encode().unwrap(),
            "SIGNAL NEWNYM\r\n"
        );
    }

    #[test]
    fn test_quote_value_empty() {
        assert_eq!(quote_value("").unwrap(), "\"\"");
        assert_eq!(quote_value("plain").unwrap(), "plain");
    }

    #[test]
    fn test_signal_serde_names() {
        let json = serde_json::to_string(&Signal::Newnym).unwrap();
        assert_eq!(json, "\"NEWNYM\"");
    }
}
