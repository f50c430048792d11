//! Hand-off of freshly created sessions from the loader to the emulation
//! thread.
//!
//! Producers push fully built sessions; the emulation thread pops them at a
//! frame boundary and takes ownership. A session is dequeued at most once.

use crate::error::{QueueError, SessionError};
use crate::session::SessionContext;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Default)]
struct QueueState {
    sessions: VecDeque<SessionContext>,
    closed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
}

/// Thread-safe FIFO of pending sessions.
#[derive(Clone)]
pub struct PendingSessionQueue {
    shared: Arc<Shared>,
}

impl Default for PendingSessionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingSessionQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                available: Condvar::new(),
            }),
        }
    }

    /// Enqueue a session. Rejected sessions are shut down on return.
    pub fn push(&self, session: SessionContext) -> crate::Result<()> {
        if session.was_dequeued() {
            let id = session.id();
            warn!(session_id = id.0, "refusing to queue a dequeued session");
            return Err(SessionError::AlreadyDequeued(id).into());
        }
        let mut state = self.shared.state.lock();
        if state.closed {
            drop(state);
            warn!(session_id = session.id().0, "pending-session queue is closed");
            return Err(QueueError::Closed.into());
        }
        debug!(
            session_id = session.id().0,
            script = session.source_filename(),
            pending = state.sessions.len() + 1,
            "session queued"
        );
        state.sessions.push_back(session);
        drop(state);
        self.shared.available.notify_one();
        Ok(())
    }

    fn take(state: &mut QueueState) -> Option<SessionContext> {
        let mut session = state.sessions.pop_front()?;
        session.mark_dequeued();
        Some(session)
    }

    /// Block until a session is available.
    ///
    /// After [`close`](Self::close) the remaining sessions are still handed
    /// out; `Closed` is returned once the queue is drained.
    pub fn pop(&self) -> Result<SessionContext, QueueError> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(session) = Self::take(&mut state) {
                return Ok(session);
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            self.shared.available.wait(&mut state);
        }
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Result<SessionContext, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(session) = Self::take(&mut state) {
                return Ok(session);
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            if self
                .shared
                .available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Self::take(&mut state).ok_or(QueueError::Timeout);
            }
        }
    }

    /// Remove every queued session without blocking.
    pub fn drain(&self) -> Vec<SessionContext> {
        let mut state = self.shared.state.lock();
        std::iter::from_fn(|| Self::take(&mut state)).collect()
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().sessions.is_empty()
    }

    /// Refuse further pushes and wake every waiter.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.available.notify_all();
    }
}

impl std::fmt::Debug for PendingSessionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("PendingSessionQueue")
            .field("pending", &state.sessions.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{ABI_VERSION, AbiVersion, ScriptBackend};
    use crate::error::Error;
    use crate::session::{SessionCore, SessionId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct Null;

    impl ScriptBackend for Null {
        fn abi_version(&self) -> AbiVersion {
            ABI_VERSION
        }

        fn language(&self) -> &str {
            "null"
        }

        fn destroy(&mut self, _core: &mut SessionCore) {}
    }

    fn session(id: u64) -> SessionContext {
        SessionContext::builder(SessionId(id), format!("{id}.lua"))
            .backend(Null)
            .build()
            .unwrap()
    }

    #[test]
    fn fifo_order() {
        let queue = PendingSessionQueue::new();
        for id in 1..=3 {
            queue.push(session(id)).unwrap();
        }
        assert_eq!(queue.len(), 3);
        let ids: Vec<_> = queue.drain().iter().map(|s| s.id().0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn dequeued_session_cannot_be_requeued() {
        let queue = PendingSessionQueue::new();
        queue.push(session(1)).unwrap();
        let popped = queue.pop().unwrap();
        let err = queue.push(popped).unwrap_err();
        assert!(matches!(
            err,
            Error::Session(SessionError::AlreadyDequeued(SessionId(1)))
        ));
    }

    #[test]
    fn closed_queue_drains_then_reports_closed() {
        let queue = PendingSessionQueue::new();
        queue.push(session(1)).unwrap();
        queue.close();
        assert!(matches!(
            queue.push(session(2)),
            Err(Error::Queue(QueueError::Closed))
        ));
        assert_eq!(queue.pop().unwrap().id(), SessionId(1));
        assert_eq!(queue.pop().unwrap_err(), QueueError::Closed);
    }

    #[test]
    fn rejected_session_is_shut_down() {
        let ended = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ended);
        let queue = PendingSessionQueue::new();
        queue.close();
        let rejected = SessionContext::builder(SessionId(5), "late.lua")
            .backend(Null)
            .on_end(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();
        assert!(queue.push(rejected).is_err());
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pop_timeout_expires() {
        let queue = PendingSessionQueue::new();
        assert_eq!(
            queue.pop_timeout(Duration::from_millis(10)).unwrap_err(),
            QueueError::Timeout
        );
    }

    #[test]
    fn blocking_pop_wakes_on_push() {
        let queue = PendingSessionQueue::new();
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop().map(|s| s.id()))
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(session(42)).unwrap();
        assert_eq!(consumer.join().unwrap(), Ok(SessionId(42)));
    }

    #[test]
    fn close_wakes_waiters() {
        let queue = PendingSessionQueue::new();
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop().map(|s| s.id()))
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), Err(QueueError::Closed));
    }

    #[test]
    fn producers_on_many_threads() {
        let queue = PendingSessionQueue::new();
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        queue.push(session(t * 100 + i)).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        assert_eq!(queue.drain().len(), 100);
    }
}
