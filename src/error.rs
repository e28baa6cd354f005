use std::time::Duration;

/// Transport-level failures of the bridge itself. Failures of the code the
/// interpreter ran come back as `ExecuteOutcome { success: false, .. }`, not
/// through this enum.
#[derive(Debug)]
pub enum SessionError {
    /// The interpreter process could not be started.
    Spawn(std::io::Error),
    /// The interpreter never printed its readiness marker within the window.
    InitTimeout(Duration),
    /// A request produced no matching response within the window.
    ResponseTimeout(Duration),
    /// A flushed stream segment could not be decoded into a response.
    Malformed { fragment: String },
    /// The interpreter exited while requests were outstanding.
    UnexpectedExit,
    /// The session protocol was violated in some other way.
    Protocol(String),
    Io(std::io::Error),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Spawn(err) => write!(f, "failed to spawn interpreter: {err}"),
            SessionError::InitTimeout(timeout) => write!(
                f,
                "interpreter produced no readiness marker within {} ms",
                timeout.as_millis()
            ),
            SessionError::ResponseTimeout(timeout) => write!(
                f,
                "interpreter produced no response within {} ms",
                timeout.as_millis()
            ),
            SessionError::Malformed { fragment } => {
                write!(f, "malformed interpreter response: {fragment}")
            }
            SessionError::UnexpectedExit => write!(f, "interpreter exited unexpectedly"),
            SessionError::Protocol(message) => write!(f, "session protocol error: {message}"),
            SessionError::Io(err) => write!(f, "session io error: {err}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Spawn(err) | SessionError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io(err)
    }
}
