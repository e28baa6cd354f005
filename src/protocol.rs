use serde::{Deserialize, Serialize};

/// A call the host sends to the interpreter, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub id: String,
    pub command: RequestCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestCommand {
    Execute,
    Snapshot,
    Health,
}

impl RequestCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestCommand::Execute => "execute",
            RequestCommand::Snapshot => "snapshot",
            RequestCommand::Health => "health",
        }
    }
}

impl Request {
    pub fn execute(id: String, code: String) -> Self {
        Self {
            id,
            command: RequestCommand::Execute,
            code: Some(code),
        }
    }

    pub fn snapshot(id: String) -> Self {
        Self {
            id,
            command: RequestCommand::Snapshot,
            code: None,
        }
    }

    pub fn health(id: String) -> Self {
        Self {
            id,
            command: RequestCommand::Health,
            code: None,
        }
    }
}

/// One reply from the interpreter. `success: false` reports a failure of the
/// executed code, not of the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_more: Option<bool>,
}

/// What a completed call looks like to library callers.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub variable_count: Option<u64>,
    pub needs_more: bool,
}

impl ExecuteOutcome {
    pub(crate) fn from_response(response: Response) -> Self {
        Self {
            success: response.success,
            stdout: response.stdout.unwrap_or_default(),
            stderr: response.stderr.unwrap_or_default(),
            error: response.error,
            variable_count: response.variable_count,
            needs_more: response.needs_more.unwrap_or(false),
        }
    }

    /// An outcome synthesized on the host side, without a wire round trip.
    pub(crate) fn host(text: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: text.into(),
            stderr: String::new(),
            error: None,
            variable_count: None,
            needs_more: false,
        }
    }
}
