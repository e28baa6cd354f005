use std::io::{Read, Write};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::config::SessionConfig;
use crate::diagnostics;
use crate::dispatcher::PendingTable;
use crate::error::SessionError;
use crate::event_log;
use crate::framing::{Decoded, FrameDecoder};

const READ_CHUNK_BYTES: usize = 8192;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const TERM_ESCALATION_WAIT: Duration = Duration::from_secs(2);
const CLOSE_STDIN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Default, Clone)]
pub(crate) struct ExitHooks {
    pub on_unexpected_exit: Option<Arc<dyn Fn() + Send + Sync>>,
}

enum StdinCommand {
    Write {
        payload: Vec<u8>,
        reply: mpsc::Sender<Result<(), SessionError>>,
    },
    Close {
        reply: mpsc::Sender<Result<(), SessionError>>,
    },
}

/// Cloneable handle onto the single stdin writer thread. All frames funnel
/// through that thread, so concurrent callers can never interleave bytes.
#[derive(Clone)]
pub(crate) struct StdinWriter {
    tx: mpsc::Sender<StdinCommand>,
}

impl StdinWriter {
    pub fn write(&self, payload: Vec<u8>, timeout: Duration) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(StdinCommand::Write {
                payload,
                reply: reply_tx,
            })
            .map_err(|_| SessionError::UnexpectedExit)?;
        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(SessionError::Protocol(
                "timed out writing to interpreter stdin".to_string(),
            )),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(SessionError::UnexpectedExit),
        }
    }

    fn close(&self, timeout: Duration) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(StdinCommand::Close { reply: reply_tx })
            .map_err(|_| SessionError::UnexpectedExit)?;
        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => Err(SessionError::UnexpectedExit),
        }
    }
}

struct StreamFlags {
    ready: bool,
    disconnected: bool,
}

/// Readiness and disconnection flags shared between the reader threads and
/// whoever is blocked in `wait_ready`.
struct ProcessStatus {
    flags: Mutex<StreamFlags>,
    cvar: Condvar,
}

impl ProcessStatus {
    fn new() -> Self {
        Self {
            flags: Mutex::new(StreamFlags {
                ready: false,
                disconnected: false,
            }),
            cvar: Condvar::new(),
        }
    }

    fn note_ready(&self) {
        let mut flags = self.flags.lock().expect("process status mutex poisoned");
        if !flags.ready {
            flags.ready = true;
            self.cvar.notify_all();
        }
    }

    fn note_disconnected(&self) {
        let mut flags = self.flags.lock().expect("process status mutex poisoned");
        if !flags.disconnected {
            flags.disconnected = true;
            self.cvar.notify_all();
        }
    }

    fn wait_ready(&self, timeout: Duration) -> Result<(), SessionError> {
        let deadline = Instant::now() + timeout;
        let mut flags = self.flags.lock().expect("process status mutex poisoned");
        loop {
            if flags.ready {
                return Ok(());
            }
            if flags.disconnected {
                return Err(SessionError::Protocol(
                    "interpreter exited before its readiness marker".to_string(),
                ));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::InitTimeout(timeout));
            }
            let remaining = deadline.saturating_duration_since(now);
            let (next, _) = self
                .cvar
                .wait_timeout(flags, remaining)
                .expect("process status mutex poisoned");
            flags = next;
        }
    }
}

/// One live interpreter subprocess: the child handle, its stdin writer
/// thread, and the reader threads that decode its output.
pub(crate) struct InterpreterProcess {
    child: Child,
    stdin_tx: mpsc::Sender<StdinCommand>,
    status: Arc<ProcessStatus>,
    expected_exit: Arc<AtomicBool>,
}

impl InterpreterProcess {
    pub fn spawn(
        config: &SessionConfig,
        pending: PendingTable,
        hooks: ExitHooks,
    ) -> Result<Self, SessionError> {
        let mut command = Command::new(&config.program);
        command.args(&config.args);
        for (key, value) in &config.envs {
            command.env(key, value);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(target_family = "unix")]
        {
            use std::os::unix::process::CommandExt;
            // Own process group so signals reach the interpreter's children.
            unsafe {
                command.pre_exec(|| {
                    libc::setpgid(0, 0);
                    Ok(())
                });
            }
        }

        let mut child = command.spawn().map_err(SessionError::Spawn)?;
        if let Some(status) = child.try_wait().map_err(SessionError::Spawn)? {
            return Err(SessionError::Protocol(format!(
                "interpreter exited immediately with {status}"
            )));
        }
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Protocol("interpreter stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Protocol("interpreter stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SessionError::Protocol("interpreter stderr unavailable".to_string()))?;

        diagnostics::trace(format!(
            "spawned interpreter pid={} program={}",
            child.id(),
            config.program.display()
        ));
        event_log::log_lazy("spawn", || {
            json!({
                "pid": child.id(),
                "program": config.program.display().to_string(),
            })
        });

        let status = Arc::new(ProcessStatus::new());
        let expected_exit = Arc::new(AtomicBool::new(false));
        let stdin_tx = spawn_stdin_writer(stdin);
        spawn_stdout_reader(
            stdout,
            FrameDecoder::new(config.framer()),
            pending,
            status.clone(),
            expected_exit.clone(),
            hooks,
        );
        spawn_stderr_reader(stderr, config.ready_marker.clone(), status.clone());

        Ok(Self {
            child,
            stdin_tx,
            status,
            expected_exit,
        })
    }

    pub fn writer(&self) -> StdinWriter {
        StdinWriter {
            tx: self.stdin_tx.clone(),
        }
    }

    /// Block until the readiness marker appears on stdout or stderr.
    pub fn wait_ready(&self, timeout: Duration) -> Result<(), SessionError> {
        self.status.wait_ready(timeout)
    }

    pub fn is_running(&mut self) -> Result<bool, SessionError> {
        Ok(self.child.try_wait().map_err(SessionError::Io)?.is_none())
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Suppress crash handling for an exit the host itself initiated.
    pub fn note_expected_exit(&self) {
        self.expected_exit.store(true, Ordering::Relaxed);
    }

    /// Close stdin and give the interpreter a grace window to leave on its
    /// own, then escalate: SIGTERM, a short wait, SIGKILL.
    pub fn shutdown_graceful(mut self, grace: Duration) -> Result<(), SessionError> {
        self.note_expected_exit();
        let _ = self.writer().close(CLOSE_STDIN_TIMEOUT);
        if self.wait_exit_until(Instant::now() + grace)? {
            return Ok(());
        }
        diagnostics::trace(format!(
            "interpreter pid={} ignored stdin close, sending SIGTERM",
            self.pid()
        ));
        self.send_signal(Signal::Term);
        if self.wait_exit_until(Instant::now() + TERM_ESCALATION_WAIT)? {
            return Ok(());
        }
        diagnostics::trace(format!(
            "interpreter pid={} ignored SIGTERM, sending SIGKILL",
            self.pid()
        ));
        self.send_signal(Signal::Kill);
        self.child.wait().map_err(SessionError::Io)?;
        Ok(())
    }

    /// Immediate SIGKILL, no grace.
    pub fn kill(mut self) -> Result<(), SessionError> {
        self.note_expected_exit();
        self.send_signal(Signal::Kill);
        self.child.wait().map_err(SessionError::Io)?;
        Ok(())
    }

    fn wait_exit_until(&mut self, deadline: Instant) -> Result<bool, SessionError> {
        loop {
            if self.child.try_wait().map_err(SessionError::Io)?.is_some() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    #[cfg(target_family = "unix")]
    fn send_signal(&mut self, signal: Signal) {
        let signum = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let pid = self.child.id() as libc::pid_t;
        // Negative pid targets the whole process group.
        unsafe {
            libc::kill(-pid, signum);
        }
    }

    #[cfg(not(target_family = "unix"))]
    fn send_signal(&mut self, _signal: Signal) {
        let _ = self.child.kill();
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

fn spawn_stdin_writer(stdin: ChildStdin) -> mpsc::Sender<StdinCommand> {
    let (tx, rx) = mpsc::channel::<StdinCommand>();
    thread::spawn(move || {
        let mut stdin = Some(stdin);
        for command in rx {
            match command {
                StdinCommand::Write { payload, reply } => {
                    let result = match stdin.as_mut() {
                        Some(stdin) => write_frame(stdin, &payload),
                        None => Err(SessionError::Protocol(
                            "interpreter stdin already closed".to_string(),
                        )),
                    };
                    let _ = reply.send(result);
                }
                StdinCommand::Close { reply } => {
                    stdin = None;
                    let _ = reply.send(Ok(()));
                }
            }
        }
    });
    tx
}

fn write_frame(stdin: &mut ChildStdin, payload: &[u8]) -> Result<(), SessionError> {
    stdin
        .write_all(payload)
        .and_then(|_| stdin.flush())
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::BrokenPipe {
                SessionError::UnexpectedExit
            } else {
                SessionError::Io(err)
            }
        })
}

fn spawn_stdout_reader(
    mut stdout: ChildStdout,
    mut decoder: FrameDecoder,
    pending: PendingTable,
    status: Arc<ProcessStatus>,
    expected_exit: Arc<AtomicBool>,
    hooks: ExitHooks,
) {
    thread::spawn(move || {
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        loop {
            let read = match stdout.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(read) => read,
            };
            let frames = decoder.feed(&chunk[..read]);
            if decoder.ready_seen() {
                status.note_ready();
            }
            for frame in frames {
                match frame {
                    Decoded::Response(response) => {
                        pending.deliver(response);
                    }
                    Decoded::Malformed { fragment } => {
                        diagnostics::trace(format!("malformed frame: {fragment}"));
                        pending.fail_in_flight(fragment);
                    }
                }
            }
        }
        status.note_disconnected();
        pending.fail_all();
        if expected_exit.load(Ordering::Relaxed) {
            return;
        }
        diagnostics::trace("interpreter stdout closed unexpectedly");
        event_log::log("unexpected_exit", json!({}));
        if let Some(hook) = hooks.on_unexpected_exit.as_ref() {
            hook();
        }
    });
}

/// Stderr carries no frames; it is scanned only for the readiness marker
/// (some interpreters announce themselves there) and drained so the pipe
/// never fills.
fn spawn_stderr_reader(mut stderr: ChildStderr, ready_marker: String, status: Arc<ProcessStatus>) {
    thread::spawn(move || {
        let marker = ready_marker.as_bytes();
        let mut carry: Vec<u8> = Vec::new();
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        let mut found = false;
        loop {
            let read = match stderr.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(read) => read,
            };
            if found {
                continue;
            }
            carry.extend_from_slice(&chunk[..read]);
            if memchr::memmem::find(&carry, marker).is_some() {
                status.note_ready();
                found = true;
                carry = Vec::new();
            } else if carry.len() > marker.len() {
                // Keep just enough tail to match a marker split across reads.
                let cut = carry.len() - (marker.len() - 1);
                carry.drain(..cut);
            }
        }
    });
}
