use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::json;

use crate::diagnostics;
use crate::error::SessionError;
use crate::event_log;
use crate::framing;
use crate::protocol::{Request, Response};
use crate::supervisor::StdinWriter;

const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// FIFO mutual exclusion over the interpreter's stdin. Plain `Mutex` makes
/// no fairness promise, so waiters take a ticket and are served in ticket
/// order. Acquisition never times out; per-request deadlines apply only once
/// the frame is on the wire.
pub(crate) struct WriteLock {
    tickets: Mutex<Tickets>,
    cvar: Condvar,
}

struct Tickets {
    next: u64,
    serving: u64,
}

impl WriteLock {
    pub fn new() -> Self {
        Self {
            tickets: Mutex::new(Tickets {
                next: 0,
                serving: 0,
            }),
            cvar: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> WriteLockGuard<'_> {
        let mut tickets = self.tickets.lock().expect("write lock mutex poisoned");
        let ticket = tickets.next;
        tickets.next += 1;
        while tickets.serving != ticket {
            tickets = self
                .cvar
                .wait(tickets)
                .expect("write lock mutex poisoned");
        }
        WriteLockGuard { lock: self }
    }
}

pub(crate) struct WriteLockGuard<'a> {
    lock: &'a WriteLock,
}

impl Drop for WriteLockGuard<'_> {
    fn drop(&mut self) {
        let mut tickets = self
            .lock
            .tickets
            .lock()
            .expect("write lock mutex poisoned");
        tickets.serving += 1;
        self.lock.cvar.notify_all();
    }
}

struct PendingEntry {
    reply: mpsc::Sender<Result<Response, SessionError>>,
    deadline: Instant,
    settled: bool,
}

pub(crate) enum SettleOutcome {
    TimedOut,
    /// The response arrived between the timer firing and the table lock
    /// being taken; the reply channel already holds it.
    AlreadySettled,
}

/// Outstanding requests keyed by correlation ID. Settlement is guarded by a
/// flag on the entry, not by map absence, so a timer firing concurrently
/// with response arrival settles each request exactly once.
#[derive(Clone, Default)]
pub(crate) struct PendingTable {
    entries: Arc<Mutex<HashMap<String, PendingEntry>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.entries.lock().expect("pending table mutex poisoned")
    }

    pub fn register(
        &self,
        id: String,
        reply: mpsc::Sender<Result<Response, SessionError>>,
        deadline: Instant,
    ) {
        self.lock().insert(
            id,
            PendingEntry {
                reply,
                deadline,
                settled: false,
            },
        );
    }

    /// Route a response to its waiter. Responses with no matching entry are
    /// orphans: logged and dropped, never an error.
    pub fn deliver(&self, response: Response) -> bool {
        let id = response.id.clone();
        let reply = {
            let mut entries = self.lock();
            match entries.get_mut(&id) {
                None => {
                    diagnostics::trace(format!("orphan response dropped: id={id}"));
                    event_log::log("orphan_response", json!({ "id": id }));
                    return false;
                }
                Some(entry) if entry.settled => {
                    diagnostics::trace(format!("response for already-settled request: id={id}"));
                    return false;
                }
                Some(entry) => {
                    entry.settled = true;
                    if Instant::now() > entry.deadline {
                        diagnostics::trace(format!("response matched past its deadline: id={id}"));
                    }
                    entry.reply.clone()
                }
            }
        };
        let _ = reply.send(Ok(response));
        self.lock().remove(&id);
        true
    }

    /// Called by the waiter when its deadline elapses.
    pub fn settle_timeout(&self, id: &str) -> SettleOutcome {
        let mut entries = self.lock();
        match entries.get_mut(id) {
            Some(entry) if !entry.settled => {
                entry.settled = true;
                entries.remove(id);
                SettleOutcome::TimedOut
            }
            _ => SettleOutcome::AlreadySettled,
        }
    }

    /// A frame arrived that could not be decoded. Single-writer discipline
    /// means at most one request is in flight; reject it if present,
    /// otherwise the fragment is only logged.
    pub fn fail_in_flight(&self, fragment: String) {
        let reply = {
            let mut entries = self.lock();
            let unsettled: Vec<&String> = entries
                .iter()
                .filter(|(_, entry)| !entry.settled)
                .map(|(id, _)| id)
                .collect();
            let [id] = unsettled.as_slice() else {
                diagnostics::trace(format!(
                    "malformed frame with no single in-flight request: {fragment}"
                ));
                return;
            };
            let id = (*id).clone();
            let entry = entries.get_mut(&id).expect("pending entry should exist");
            entry.settled = true;
            let reply = entry.reply.clone();
            entries.remove(&id);
            reply
        };
        diagnostics::trace("malformed frame rejected the in-flight request");
        let _ = reply.send(Err(SessionError::Malformed { fragment }));
    }

    /// Reject every outstanding request. Used when the interpreter exits.
    pub fn fail_all(&self) {
        let replies: Vec<mpsc::Sender<Result<Response, SessionError>>> = {
            let mut entries = self.lock();
            let replies = entries
                .values_mut()
                .filter(|entry| !entry.settled)
                .map(|entry| {
                    entry.settled = true;
                    entry.reply.clone()
                })
                .collect();
            entries.clear();
            replies
        };
        for reply in replies {
            let _ = reply.send(Err(SessionError::UnexpectedExit));
        }
    }

    /// Drop an entry that never made it onto the wire.
    pub fn discard(&self, id: &str) {
        self.lock().remove(id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Serializes requests onto the interpreter's stdin and matches responses
/// back to their callers.
pub(crate) struct RequestDispatcher {
    write_lock: WriteLock,
    pending: PendingTable,
    next_seq: AtomicU64,
}

impl RequestDispatcher {
    pub fn new(pending: PendingTable) -> Self {
        Self {
            write_lock: WriteLock::new(),
            pending,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Correlation IDs stay unique across interpreter restarts: a process
    /// counter plus the wall clock.
    pub fn next_request_id(&self) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("req-{}-{seq}", unix_ms_now())
    }

    /// Send one request and block for its response. Holds the write lock for
    /// the full exchange; `on_acquired` runs once the turn starts.
    pub fn send_with(
        &self,
        writer: &StdinWriter,
        request: Request,
        timeout: Duration,
        on_acquired: impl FnOnce(),
    ) -> Result<Response, SessionError> {
        let _turn = self.write_lock.acquire();
        on_acquired();

        let id = request.id.clone();
        let (reply_tx, reply_rx) = mpsc::channel();
        self.pending
            .register(id.clone(), reply_tx, Instant::now() + timeout);

        let payload = match framing::encode_request(&request) {
            Ok(payload) => payload,
            Err(err) => {
                self.pending.discard(&id);
                return Err(SessionError::Protocol(format!(
                    "failed to encode request: {err}"
                )));
            }
        };
        event_log::log_lazy("request", || {
            json!({ "id": id, "command": request.command.as_str() })
        });
        if let Err(err) = writer.write(payload, STDIN_WRITE_TIMEOUT) {
            self.pending.discard(&id);
            return Err(err);
        }

        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => match self.pending.settle_timeout(&id) {
                SettleOutcome::TimedOut => {
                    diagnostics::trace(format!("request timed out: id={id}"));
                    event_log::log("request_timeout", json!({ "id": id }));
                    Err(SessionError::ResponseTimeout(timeout))
                }
                SettleOutcome::AlreadySettled => reply_rx
                    .try_recv()
                    .unwrap_or(Err(SessionError::ResponseTimeout(timeout))),
            },
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(SessionError::Protocol(
                "reply channel closed while waiting for response".to_string(),
            )),
        }
    }
}

fn unix_ms_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn response(id: &str) -> Response {
        Response {
            id: id.to_string(),
            success: true,
            stdout: None,
            stderr: None,
            error: None,
            variable_count: None,
            needs_more: None,
        }
    }

    #[test]
    fn deliver_routes_to_registered_waiter() {
        let pending = PendingTable::new();
        let (tx, rx) = mpsc::channel();
        pending.register(
            "req-1".to_string(),
            tx,
            Instant::now() + Duration::from_secs(1),
        );
        assert!(pending.deliver(response("req-1")));
        let result = rx.recv().expect("reply delivered");
        assert_eq!(result.expect("response").id, "req-1");
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn unknown_id_is_an_orphan_not_a_panic() {
        let pending = PendingTable::new();
        assert!(!pending.deliver(response("nobody-asked")));
    }

    #[test]
    fn second_delivery_is_ignored() {
        let pending = PendingTable::new();
        let (tx, rx) = mpsc::channel();
        pending.register(
            "req-2".to_string(),
            tx,
            Instant::now() + Duration::from_secs(1),
        );
        assert!(pending.deliver(response("req-2")));
        assert!(!pending.deliver(response("req-2")));
        rx.recv().expect("first reply").expect("response");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn settle_timeout_removes_the_entry_once() {
        let pending = PendingTable::new();
        let (tx, _rx) = mpsc::channel();
        pending.register(
            "req-3".to_string(),
            tx,
            Instant::now() + Duration::from_millis(1),
        );
        assert!(matches!(
            pending.settle_timeout("req-3"),
            SettleOutcome::TimedOut
        ));
        assert!(matches!(
            pending.settle_timeout("req-3"),
            SettleOutcome::AlreadySettled
        ));
        // A response arriving after the timeout is an orphan.
        assert!(!pending.deliver(response("req-3")));
    }

    #[test]
    fn fail_all_rejects_every_waiter_with_unexpected_exit() {
        let pending = PendingTable::new();
        let mut receivers = Vec::new();
        for index in 0..3 {
            let (tx, rx) = mpsc::channel();
            pending.register(
                format!("req-{index}"),
                tx,
                Instant::now() + Duration::from_secs(1),
            );
            receivers.push(rx);
        }
        pending.fail_all();
        for rx in receivers {
            let result = rx.recv().expect("rejection delivered");
            assert!(matches!(result, Err(SessionError::UnexpectedExit)));
        }
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn malformed_frame_rejects_the_single_in_flight_request() {
        let pending = PendingTable::new();
        let (tx, rx) = mpsc::channel();
        pending.register(
            "req-4".to_string(),
            tx,
            Instant::now() + Duration::from_secs(1),
        );
        pending.fail_in_flight("not json".to_string());
        let result = rx.recv().expect("rejection delivered");
        match result {
            Err(SessionError::Malformed { fragment }) => assert_eq!(fragment, "not json"),
            other => panic!("expected malformed rejection, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frame_with_no_waiter_is_only_logged() {
        let pending = PendingTable::new();
        pending.fail_in_flight("stray".to_string());
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn write_lock_tickets_serve_in_order() {
        let lock = Arc::new(WriteLock::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let guard = lock.acquire();
        let mut handles = Vec::new();
        for index in 0..4 {
            let lock = lock.clone();
            let order = order.clone();
            handles.push(thread::spawn(move || {
                let _guard = lock.acquire();
                order.lock().unwrap().push(index);
            }));
            // Let each waiter queue before the next takes a ticket.
            thread::sleep(Duration::from_millis(30));
        }
        drop(guard);
        for handle in handles {
            handle.join().expect("waiter thread");
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn request_ids_are_unique_and_monotonic() {
        let dispatcher = RequestDispatcher::new(PendingTable::new());
        let first = dispatcher.next_request_id();
        let second = dispatcher.next_request_id();
        assert_ne!(first, second);
        assert!(first.starts_with("req-"));
        let seq = |id: &str| -> u64 {
            id.rsplit('-')
                .next()
                .and_then(|raw| raw.parse().ok())
                .expect("trailing sequence number")
        };
        assert!(seq(&second) > seq(&first));
    }
}
