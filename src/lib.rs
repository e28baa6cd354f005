//! Persistent interpreter sessions over subprocess stdio.
//!
//! A [`Session`] owns one long-lived interpreter subprocess and lets callers
//! submit source code while the interpreter keeps its variables and state
//! across calls. Requests and responses travel as single JSON objects over
//! the shared stdin/stdout pipes; framing, correlation, single-writer
//! serialization, timeouts, and crash recovery all live in this crate.

mod commands;
mod config;
mod diagnostics;
mod dispatcher;
mod error;
pub mod event_log;
mod framing;
mod protocol;
mod session;
mod supervisor;

pub use commands::SessionCommand;
pub use config::{
    DEFAULT_REQUEST_TIMEOUT, DEFAULT_SHUTDOWN_GRACE, DEFAULT_STARTUP_TIMEOUT, SessionConfig,
};
pub use error::SessionError;
pub use framing::{
    DEFAULT_END_MARKER, DEFAULT_READY_MARKER, DEFAULT_SENTINEL, DEFAULT_START_MARKER, Decoded,
    FrameDecoder, FramerConfig, encode_request,
};
pub use protocol::{ExecuteOutcome, Request, RequestCommand, Response};
pub use session::{Session, SessionState};
