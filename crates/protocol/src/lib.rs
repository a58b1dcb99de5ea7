//! # Control-Port Protocol Library
//!
//! This crate implements the wire format spoken on the anonymizing daemon's
//! local control port. It performs no I/O: callers feed it lines read from
//! the socket and write the strings it produces.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Commands  /  Status Events       │  messages, events
//! ├─────────────────────────────────────────┤
//! │            Reply Framing                │  NNN- / NNN+ / NNN lines
//! ├─────────────────────────────────────────┤
//! │        Transport (loopback TCP)         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Command, ControlEvent, ReplyDecoder};
//!
//! let line = Command::set_conf("DisableNetwork", "0").encode().unwrap();
//! assert_eq!(line, "SETCONF DisableNetwork=0\r\n");
//!
//! let mut decoder = ReplyDecoder::new();
//! let reply = decoder
//!     .feed("650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=10 TAG=conn_done\r\n")
//!     .unwrap()
//!     .unwrap();
//! let event = ControlEvent::from_reply(&reply).unwrap();
//! assert!(matches!(event, Some(ControlEvent::Bootstrap { .. })));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Command encoding
//! - [`framing`]: Reply line parsing and assembly
//! - [`events`]: Asynchronous status event parsing
//! - [`error`]: Error types

pub mod error;
pub mod events;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use events::{BootstrapProgress, ControlEvent, EventKind, StatusEvent, STATUS_CLIENT};
pub use framing::{
    LineKind, Reply, ReplyDecoder, ReplyLine, LINE_TERMINATOR, MAX_REPLY_LINES,
    STATUS_ASYNC_EVENT, STATUS_AUTH_FAILED, STATUS_OK,
};
pub use messages::{Command, Signal};
