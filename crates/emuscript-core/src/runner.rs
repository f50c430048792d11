//! Drives admitted sessions through their state machine.
//!
//! The runner lives on the emulation thread. Once per frame it admits new
//! sessions from the [`PendingSessionQueue`], reaps the ones that were
//! deactivated, resumes yielding global code and runs frame callbacks.
//! Breakpoint and controller hooks are forwarded as the emulator reports
//! them.

use crate::breakpoints::MemoryAccess;
use crate::error::{QueueError, SessionError};
use crate::queue::PendingSessionQueue;
use crate::session::{SessionContext, SessionId};
use crate::session_span;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Runner behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Deactivate a session after its first script error.
    pub stop_on_script_error: bool,
}

/// What happened during one [`ScriptRunner::run_frame`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub frame: u64,
    pub admitted: usize,
    pub reaped: Vec<SessionId>,
    pub errors: Vec<SessionError>,
    pub active: usize,
}

impl FrameReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct ScriptRunner {
    queue: PendingSessionQueue,
    config: RunnerConfig,
    sessions: Vec<SessionContext>,
    frame: u64,
    admitted: usize,
    errors: Vec<SessionError>,
}

impl ScriptRunner {
    pub fn new(queue: PendingSessionQueue, config: RunnerConfig) -> Self {
        Self {
            queue,
            config,
            sessions: Vec::new(),
            frame: 0,
            admitted: 0,
            errors: Vec::new(),
        }
    }

    pub fn queue(&self) -> &PendingSessionQueue {
        &self.queue
    }

    pub fn config(&self) -> RunnerConfig {
        self.config
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_ids(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.sessions.iter().map(SessionContext::id)
    }

    pub fn session(&self, id: SessionId) -> Option<&SessionContext> {
        self.sessions.iter().find(|s| s.id() == id)
    }

    /// Errors recorded since the last frame report.
    pub fn take_errors(&mut self) -> Vec<SessionError> {
        std::mem::take(&mut self.errors)
    }

    /// Take ownership of every queued session and run its startup code.
    pub fn admit_pending(&mut self) -> usize {
        let pending = self.queue.drain();
        let count = pending.len();
        for session in pending {
            self.admit(session);
        }
        count
    }

    /// Block up to `timeout` for one session and admit it.
    ///
    /// Returns `Ok(false)` on timeout and `Closed` once the queue is closed
    /// and drained.
    pub fn wait_for_session(&mut self, timeout: Duration) -> Result<bool, QueueError> {
        match self.queue.pop_timeout(timeout) {
            Ok(session) => {
                self.admit(session);
                Ok(true)
            }
            Err(QueueError::Timeout) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn admit(&mut self, mut session: SessionContext) {
        let span = session_span!(
            "admit",
            session_id = session.id().0,
            script = session.source_filename()
        );
        let _guard = span.enter();
        info!(language = session.language(), "session admitted");
        self.admitted += 1;
        self.run_global(&mut session);
        self.sessions.push(session);
    }

    fn run_global(&mut self, session: &mut SessionContext) {
        let result = session.run_global_code();
        let core = session.core_mut();
        if result.is_err() || !core.called_yielding_function_in_last_global_script_resume {
            core.finished_global_code = true;
        }
        if let Err(err) = result {
            self.record(session, err);
        }
    }

    fn record(&mut self, session: &SessionContext, err: SessionError) {
        if matches!(err, SessionError::Inactive(_)) {
            return;
        }
        warn!(
            session_id = session.id().0,
            script = session.source_filename(),
            error = %err,
            "script call failed"
        );
        if self.config.stop_on_script_error {
            session.deactivate();
        }
        self.errors.push(err);
    }

    /// Shut down every session that is no longer active.
    fn reap(&mut self) -> Vec<SessionId> {
        let mut reaped = Vec::new();
        self.sessions.retain_mut(|session| {
            if session.is_active() {
                return true;
            }
            session.shutdown();
            reaped.push(session.id());
            false
        });
        reaped
    }

    /// Run one frame's worth of script work.
    pub fn run_frame(&mut self) -> FrameReport {
        self.frame += 1;
        let span = session_span!("frame", frame = self.frame);
        let _guard = span.enter();

        self.admit_pending();
        let mut reaped = self.reap();

        let mut sessions = std::mem::take(&mut self.sessions);
        for session in &mut sessions {
            if !session.is_active() {
                continue;
            }
            let core = session.core();
            if !core.finished_global_code
                && core.called_yielding_function_in_last_global_script_resume
            {
                self.run_global(session);
            }
            if let Err(err) = session.run_frame_callbacks() {
                self.record(session, err);
            }
        }
        self.sessions = sessions;

        reaped.extend(self.reap());
        let report = FrameReport {
            frame: self.frame,
            admitted: std::mem::take(&mut self.admitted),
            reaped,
            errors: self.take_errors(),
            active: self.sessions.len(),
        };
        debug!(
            frame = report.frame,
            admitted = report.admitted,
            reaped = report.reaped.len(),
            errors = report.errors.len(),
            active = report.active,
            "frame complete"
        );
        report
    }

    fn dispatch(
        &mut self,
        mut wants: impl FnMut(&SessionContext) -> bool,
        mut call: impl FnMut(&mut SessionContext) -> Result<(), SessionError>,
    ) -> usize {
        let mut sessions = std::mem::take(&mut self.sessions);
        let mut invoked = 0;
        for session in &mut sessions {
            if !session.is_active() || !wants(session) {
                continue;
            }
            invoked += 1;
            if let Err(err) = call(session) {
                self.record(session, err);
            }
        }
        self.sessions = sessions;
        invoked
    }

    /// The emulated CPU reached `address`. Returns how many sessions ran.
    pub fn instruction_hit(&mut self, address: u32) -> usize {
        let invoked = self.dispatch(
            |s| s.core().instruction_breakpoints.contains(address),
            |s| s.run_instruction_breakpoint(address),
        );
        if invoked > 0 {
            debug!(address, invoked, "instruction breakpoint");
        }
        invoked
    }

    /// An access of `width` bytes touched `address`.
    pub fn memory_accessed(&mut self, address: u32, width: u32, access: MemoryAccess) -> usize {
        let invoked = self.dispatch(
            |s| s.core().memory_breakpoints.matches(address, width, access),
            |s| s.run_memory_breakpoint(address, width, access),
        );
        if invoked > 0 {
            debug!(
                address,
                width,
                access = %access,
                invoked,
                "memory breakpoint"
            );
        }
        invoked
    }

    /// The emulator polled controller `port` (0-based).
    pub fn controller_polled(&mut self, port: usize) -> usize {
        self.dispatch(|_| true, |s| s.run_controller_polled(port))
    }

    /// Shut down one session. Returns false if it was not running here.
    pub fn shutdown_session(&mut self, id: SessionId) -> bool {
        let Some(index) = self.sessions.iter().position(|s| s.id() == id) else {
            return false;
        };
        self.sessions.remove(index).destroy();
        true
    }

    /// Shut down every admitted and queued session.
    pub fn shutdown_all(&mut self) {
        let count = self.sessions.len();
        for session in self.sessions.drain(..) {
            session.destroy();
        }
        for session in self.queue.drain() {
            session.destroy();
        }
        if count > 0 {
            info!(sessions = count, "all sessions shut down");
        }
    }
}

impl Drop for ScriptRunner {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

impl std::fmt::Debug for ScriptRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRunner")
            .field("frame", &self.frame)
            .field("sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
