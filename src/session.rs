use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::commands::{HELP_TEXT, SessionCommand};
use crate::config::SessionConfig;
use crate::diagnostics;
use crate::dispatcher::{PendingTable, RequestDispatcher};
use crate::error::SessionError;
use crate::event_log;
use crate::protocol::{ExecuteOutcome, Request, RequestCommand, Response};
use crate::supervisor::{ExitHooks, InterpreterProcess, StdinWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No interpreter; the next call spawns one.
    Uninitialized,
    /// Spawned, waiting for the readiness marker.
    Starting,
    /// Idle interpreter, ready for a request.
    Ready,
    /// A request holds the write lock.
    Busy,
    /// The interpreter died with requests outstanding. Transient: the
    /// session immediately returns to Uninitialized.
    Crashed,
    /// A reset is tearing the interpreter down.
    Resetting,
}

impl SessionState {
    fn as_str(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Busy => "busy",
            SessionState::Crashed => "crashed",
            SessionState::Resetting => "resetting",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct SessionMeta {
    spawn_count: u64,
    request_count: u64,
    variable_count: Option<u64>,
    last_activity: Option<Instant>,
}

struct SessionShared {
    state: Mutex<SessionState>,
    process: Mutex<Option<InterpreterProcess>>,
    pending: PendingTable,
    meta: Mutex<SessionMeta>,
}

impl SessionShared {
    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().expect("session state mutex poisoned");
        if *state != next {
            diagnostics::trace(format!("session state: {} -> {}", *state, next));
            *state = next;
        }
    }

    fn state(&self) -> SessionState {
        *self.state.lock().expect("session state mutex poisoned")
    }
}

/// One persistent interpreter session. All methods take `&self`; the session
/// is safe to share across threads and serializes requests internally.
pub struct Session {
    config: SessionConfig,
    shared: Arc<SessionShared>,
    dispatcher: RequestDispatcher,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        event_log::initialize(
            config.debug_events_dir.clone(),
            event_log::StartupContext {
                program: config.program.display().to_string(),
                debug_repl: false,
            },
        )
        .map_err(|err| SessionError::Protocol(format!("failed to initialize event log: {err}")))?;
        let pending = PendingTable::new();
        Ok(Self {
            config,
            shared: Arc::new(SessionShared {
                state: Mutex::new(SessionState::Uninitialized),
                process: Mutex::new(None),
                pending: pending.clone(),
                meta: Mutex::new(SessionMeta::default()),
            }),
            dispatcher: RequestDispatcher::new(pending),
        })
    }

    /// The default Python-backed session.
    pub fn python() -> Result<Self, SessionError> {
        Self::new(SessionConfig::python())
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.state() == SessionState::Ready
    }

    /// Run `code` in the interpreter, or intercept it as a meta-command.
    /// `Err` means the transport failed; a failure of the code itself comes
    /// back as `Ok` with `success: false`.
    pub fn execute(&self, code: &str) -> Result<ExecuteOutcome, SessionError> {
        self.execute_with_timeout(code, self.config.request_timeout)
    }

    pub fn execute_with_timeout(
        &self,
        code: &str,
        timeout: Duration,
    ) -> Result<ExecuteOutcome, SessionError> {
        if let Some(command) = SessionCommand::parse(code) {
            return self.run_command(command, timeout);
        }
        let response =
            self.send_request(RequestCommand::Execute, Some(code.to_string()), timeout)?;
        Ok(ExecuteOutcome::from_response(response))
    }

    /// Ask the interpreter for its variable count and names.
    pub fn snapshot(&self) -> Result<ExecuteOutcome, SessionError> {
        let response =
            self.send_request(RequestCommand::Snapshot, None, self.config.request_timeout)?;
        Ok(ExecuteOutcome::from_response(response))
    }

    /// Liveness probe over the wire, spawning the interpreter if needed.
    pub fn health(&self) -> Result<bool, SessionError> {
        let response =
            self.send_request(RequestCommand::Health, None, self.config.request_timeout)?;
        Ok(response.success)
    }

    /// Kill the interpreter and forget all session metadata. The next call
    /// starts a fresh interpreter.
    pub fn reset(&self) -> Result<(), SessionError> {
        self.shared.set_state(SessionState::Resetting);
        let taken = self
            .shared
            .process
            .lock()
            .expect("session process mutex poisoned")
            .take();
        if let Some(process) = taken {
            let pid = process.pid();
            process.shutdown_graceful(self.config.shutdown_grace)?;
            diagnostics::trace(format!("reset shut down interpreter pid={pid}"));
        }
        {
            let mut meta = self.shared.meta.lock().expect("session meta mutex poisoned");
            meta.variable_count = None;
            meta.last_activity = None;
        }
        event_log::log("reset", json!({}));
        self.shared.set_state(SessionState::Uninitialized);
        Ok(())
    }

    fn run_command(
        &self,
        command: SessionCommand,
        timeout: Duration,
    ) -> Result<ExecuteOutcome, SessionError> {
        match command {
            SessionCommand::Help => Ok(ExecuteOutcome::host(HELP_TEXT)),
            SessionCommand::Memory => Ok(ExecuteOutcome::host(self.render_memory())),
            SessionCommand::Reset => {
                self.reset()?;
                Ok(ExecuteOutcome::host(
                    "session reset; a fresh interpreter starts on the next call",
                ))
            }
            SessionCommand::Vars => {
                let response = self.send_request(RequestCommand::Snapshot, None, timeout)?;
                Ok(reshape_vars(response))
            }
            SessionCommand::Clear => {
                let Some(clear_code) = self.config.clear_code.clone() else {
                    return Ok(ExecuteOutcome::host(
                        "/clear is not configured for this interpreter",
                    ));
                };
                let response =
                    self.send_request(RequestCommand::Execute, Some(clear_code), timeout)?;
                if response.success {
                    let mut meta = self.shared.meta.lock().expect("session meta mutex poisoned");
                    meta.variable_count = Some(0);
                }
                Ok(reshape_clear(response))
            }
        }
    }

    fn send_request(
        &self,
        command: RequestCommand,
        code: Option<String>,
        timeout: Duration,
    ) -> Result<Response, SessionError> {
        let writer = self.ensure_started()?;
        let request = Request {
            id: self.dispatcher.next_request_id(),
            command,
            code,
        };
        let shared = self.shared.clone();
        let result = self
            .dispatcher
            .send_with(&writer, request, timeout, move || {
                shared.set_state(SessionState::Busy)
            });
        match &result {
            Ok(response) => {
                self.note_completed(response);
                self.shared.set_state(SessionState::Ready);
            }
            // The exit hook already moved the state through Crashed.
            Err(SessionError::UnexpectedExit) => {}
            Err(_) => self.shared.set_state(SessionState::Ready),
        }
        result
    }

    /// Spawn the interpreter if none is live. At most one handle exists at a
    /// time; a dead one is dropped before its replacement is spawned.
    fn ensure_started(&self) -> Result<StdinWriter, SessionError> {
        let mut slot = self
            .shared
            .process
            .lock()
            .expect("session process mutex poisoned");
        let alive = match slot.as_mut() {
            Some(process) => process.is_running()?,
            None => false,
        };
        if alive {
            let process = slot.as_ref().expect("live interpreter should be present");
            return Ok(process.writer());
        }
        if let Some(dead) = slot.take() {
            // Already exited; kill() reaps it so no zombie lingers.
            let _ = dead.kill();
        }

        self.shared.set_state(SessionState::Starting);
        let shared = self.shared.clone();
        let hooks = ExitHooks {
            on_unexpected_exit: Some(Arc::new(move || {
                shared.set_state(SessionState::Crashed);
                shared.set_state(SessionState::Uninitialized);
            })),
        };
        let process =
            match InterpreterProcess::spawn(&self.config, self.shared.pending.clone(), hooks) {
                Ok(process) => process,
                Err(err) => {
                    self.shared.set_state(SessionState::Uninitialized);
                    return Err(err);
                }
            };
        if let Err(err) = process.wait_ready(self.config.startup_timeout) {
            let _ = process.kill();
            self.shared.set_state(SessionState::Uninitialized);
            return Err(err);
        }
        {
            let mut meta = self.shared.meta.lock().expect("session meta mutex poisoned");
            meta.spawn_count += 1;
        }
        self.shared.set_state(SessionState::Ready);
        let writer = process.writer();
        *slot = Some(process);
        Ok(writer)
    }

    fn note_completed(&self, response: &Response) {
        let mut meta = self.shared.meta.lock().expect("session meta mutex poisoned");
        meta.request_count += 1;
        meta.last_activity = Some(Instant::now());
        if let Some(count) = response.variable_count {
            meta.variable_count = Some(count);
        }
    }

    fn render_memory(&self) -> String {
        let state = self.shared.state();
        let meta = self.shared.meta.lock().expect("session meta mutex poisoned");
        let variables = meta
            .variable_count
            .map(|count| count.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let activity = meta
            .last_activity
            .map(|at| format!("{}s ago", at.elapsed().as_secs()))
            .unwrap_or_else(|| "never".to_string());
        format!(
            "session state: {state}\n\
             interpreter spawns: {}\n\
             requests dispatched: {}\n\
             variables (cached): {variables}\n\
             last activity: {activity}",
            meta.spawn_count, meta.request_count
        )
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let taken = self
            .shared
            .process
            .lock()
            .expect("session process mutex poisoned")
            .take();
        if let Some(process) = taken {
            let _ = process.kill();
        }
    }
}

fn reshape_vars(response: Response) -> ExecuteOutcome {
    if !response.success {
        return ExecuteOutcome::from_response(response);
    }
    let names: Vec<&str> = response
        .stdout
        .as_deref()
        .unwrap_or_default()
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect();
    let count = response.variable_count.unwrap_or(names.len() as u64);
    let mut outcome = if count == 0 {
        ExecuteOutcome::host("no variables defined")
    } else {
        ExecuteOutcome::host(format!("variables ({count}): {}", names.join(", ")))
    };
    outcome.variable_count = Some(count);
    outcome
}

fn reshape_clear(response: Response) -> ExecuteOutcome {
    if !response.success {
        return ExecuteOutcome::from_response(response);
    }
    let cleared = response
        .stdout
        .as_deref()
        .map(str::trim)
        .and_then(|raw| raw.parse::<u64>().ok());
    let mut outcome = match cleared {
        Some(count) => ExecuteOutcome::host(format!("cleared {count} variables")),
        None => ExecuteOutcome::host("cleared all variables"),
    };
    outcome.variable_count = Some(0);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_response(stdout: &str, count: u64) -> Response {
        Response {
            id: "req-1".to_string(),
            success: true,
            stdout: Some(stdout.to_string()),
            stderr: None,
            error: None,
            variable_count: Some(count),
            needs_more: None,
        }
    }

    #[test]
    fn reshape_vars_lists_names_with_count() {
        let outcome = reshape_vars(snapshot_response("a\nb\nc", 3));
        assert!(outcome.success);
        assert_eq!(outcome.stdout, "variables (3): a, b, c");
        assert_eq!(outcome.variable_count, Some(3));
    }

    #[test]
    fn reshape_vars_handles_empty_namespace() {
        let outcome = reshape_vars(snapshot_response("", 0));
        assert_eq!(outcome.stdout, "no variables defined");
        assert_eq!(outcome.variable_count, Some(0));
    }

    #[test]
    fn reshape_vars_passes_failures_through() {
        let mut response = snapshot_response("", 0);
        response.success = false;
        response.error = Some("boom".to_string());
        let outcome = reshape_vars(response);
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("boom"));
    }

    #[test]
    fn reshape_clear_reports_the_cleared_count() {
        let outcome = reshape_clear(snapshot_response("2\n", 0));
        assert_eq!(outcome.stdout, "cleared 2 variables");
        assert_eq!(outcome.variable_count, Some(0));
    }

    #[test]
    fn session_state_displays_lowercase() {
        assert_eq!(SessionState::Uninitialized.to_string(), "uninitialized");
        assert_eq!(SessionState::Busy.to_string(), "busy");
    }
}
