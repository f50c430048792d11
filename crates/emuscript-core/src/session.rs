//! Per-script session context and its lifecycle.
//!
//! One [`SessionContext`] exists for every loaded script. It owns the
//! backend's ABI object, the breakpoint registries and the callbacks, and it
//! guarantees the teardown order: backend destructor, then release of owned
//! resources, then `on_end`. Shutdown runs at most once, either explicitly
//! or on drop.

use crate::abi::{ABI_VERSION, BackendHandle, ScriptBackend};
use crate::breakpoints::{InstructionBreakpoints, MemoryAccess, MemoryBreakpoints};
use crate::error::{AbiError, ScriptError, SessionError};
use crate::logging::SCRIPT_TARGET;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

/// Unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    /// A process-unique id.
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where in the state machine a session's current call runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallLocation {
    Startup,
    FrameCallback,
    InstructionBreakpointCallback,
    MemoryBreakpointCallback,
    ControllerInputPolledCallback,
    Shutdown,
}

impl CallLocation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::FrameCallback => "frame_callback",
            Self::InstructionBreakpointCallback => "instruction_breakpoint_callback",
            Self::MemoryBreakpointCallback => "memory_breakpoint_callback",
            Self::ControllerInputPolledCallback => "controller_input_polled_callback",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CallLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives script `print` output.
pub type PrintCallback = Arc<dyn Fn(SessionId, &str) + Send + Sync>;

/// Invoked once after a session has been torn down.
pub type EndCallback = Arc<dyn Fn(SessionId) + Send + Sync>;

fn default_print() -> PrintCallback {
    Arc::new(|id, text| {
        info!(target: SCRIPT_TARGET, session_id = id.0, "{text}");
    })
}

fn default_on_end() -> EndCallback {
    Arc::new(|id| debug!(session_id = id.0, "session ended"))
}

/// Cooperative cancellation for one session.
///
/// Cancelling only clears the active flag; a call already running finishes
/// and the runner shuts the session down at its next decision point.
#[derive(Clone)]
pub struct CancelHandle {
    id: SessionId,
    active: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            debug!(session_id = self.id.0, "session cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        !self.active.load(Ordering::Acquire)
    }

    pub fn session_id(&self) -> SessionId {
        self.id
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Prints on behalf of one session; cheap to clone into engine closures.
#[derive(Clone)]
pub struct Printer {
    id: SessionId,
    callback: PrintCallback,
}

impl Printer {
    pub fn print(&self, text: &str) {
        (self.callback)(self.id, text);
    }
}

/// Session state visible to backend entry points.
pub struct SessionCore {
    id: SessionId,
    source_filename: String,
    active: Arc<AtomicBool>,
    call_location: CallLocation,
    pub finished_global_code: bool,
    pub called_yielding_function_in_last_global_script_resume: bool,
    pub called_yielding_function_in_last_frame_callback_script_resume: bool,
    pub instruction_breakpoints: InstructionBreakpoints,
    pub memory_breakpoints: MemoryBreakpoints,
    print_callback: PrintCallback,
    on_end: EndCallback,
    backend_handle: Option<BackendHandle>,
}

impl SessionCore {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn source_filename(&self) -> &str {
        &self.source_filename
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn call_location(&self) -> CallLocation {
        self.call_location
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            id: self.id,
            active: Arc::clone(&self.active),
        }
    }

    pub fn printer(&self) -> Printer {
        Printer {
            id: self.id,
            callback: Arc::clone(&self.print_callback),
        }
    }

    pub fn print(&self, text: &str) {
        (self.print_callback)(self.id, text);
    }

    pub fn backend_handle<T: 'static>(&self) -> Option<&T> {
        self.backend_handle.as_ref()?.downcast_ref()
    }

    fn release(&mut self) {
        self.instruction_breakpoints.clear();
        self.memory_breakpoints.clear();
        self.backend_handle = None;
    }
}

/// Builder for [`SessionContext`].
pub struct SessionBuilder {
    id: SessionId,
    source_filename: String,
    print_callback: PrintCallback,
    on_end: EndCallback,
    backend: Option<Box<dyn ScriptBackend>>,
    backend_handle: Option<BackendHandle>,
}

impl SessionBuilder {
    pub fn print_callback(mut self, callback: impl Fn(SessionId, &str) + Send + Sync + 'static) -> Self {
        self.print_callback = Arc::new(callback);
        self
    }

    pub fn on_end(mut self, callback: impl Fn(SessionId) + Send + Sync + 'static) -> Self {
        self.on_end = Arc::new(callback);
        self
    }

    pub fn backend(mut self, backend: impl ScriptBackend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    pub fn boxed_backend(mut self, backend: Box<dyn ScriptBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn backend_handle(mut self, handle: BackendHandle) -> Self {
        self.backend_handle = Some(handle);
        self
    }

    /// Validate the backend and produce an active session.
    pub fn build(self) -> Result<SessionContext, AbiError> {
        let Some(backend) = self.backend else {
            return Err(AbiError::MissingBackend {
                id: self.id,
                filename: self.source_filename,
            });
        };
        let found = backend.abi_version();
        if !found.is_compatible_with(ABI_VERSION) {
            return Err(AbiError::VersionMismatch {
                language: backend.language().to_string(),
                found,
                required: ABI_VERSION,
            });
        }

        debug!(
            session_id = self.id.0,
            script = %self.source_filename,
            language = backend.language(),
            abi = %found,
            "session created"
        );
        Ok(SessionContext {
            core: SessionCore {
                id: self.id,
                source_filename: self.source_filename,
                active: Arc::new(AtomicBool::new(true)),
                call_location: CallLocation::Startup,
                finished_global_code: false,
                called_yielding_function_in_last_global_script_resume: false,
                called_yielding_function_in_last_frame_callback_script_resume: false,
                instruction_breakpoints: InstructionBreakpoints::default(),
                memory_breakpoints: MemoryBreakpoints::default(),
                print_callback: self.print_callback,
                on_end: self.on_end,
                backend_handle: self.backend_handle,
            },
            backend,
            dequeued: false,
            shut_down: false,
        })
    }
}

/// A loaded script and everything it owns.
pub struct SessionContext {
    core: SessionCore,
    backend: Box<dyn ScriptBackend>,
    dequeued: bool,
    shut_down: bool,
}

impl SessionContext {
    pub fn builder(id: SessionId, source_filename: impl Into<String>) -> SessionBuilder {
        SessionBuilder {
            id,
            source_filename: source_filename.into(),
            print_callback: default_print(),
            on_end: default_on_end(),
            backend: None,
            backend_handle: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.core.id
    }

    pub fn source_filename(&self) -> &str {
        &self.core.source_filename
    }

    pub fn language(&self) -> &str {
        self.backend.language()
    }

    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn core(&self) -> &SessionCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut SessionCore {
        &mut self.core
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.core.cancel_handle()
    }

    /// Stop running script code; shutdown follows at the runner's next check.
    pub fn deactivate(&self) {
        self.core.cancel_handle().cancel();
    }

    pub(crate) fn was_dequeued(&self) -> bool {
        self.dequeued
    }

    pub(crate) fn mark_dequeued(&mut self) {
        self.dequeued = true;
    }

    fn enter(
        &mut self,
        location: CallLocation,
        call: impl FnOnce(&mut dyn ScriptBackend, &mut SessionCore) -> Result<(), ScriptError>,
    ) -> Result<(), SessionError> {
        if self.shut_down || !self.core.is_active() {
            return Err(SessionError::Inactive(self.core.id));
        }
        self.core.call_location = location;
        call(self.backend.as_mut(), &mut self.core).map_err(|err| SessionError::Script {
            id: self.core.id,
            location,
            message: err.message,
        })
    }

    /// Run or resume the script's top-level code.
    pub fn run_global_code(&mut self) -> Result<(), SessionError> {
        self.enter(CallLocation::Startup, |backend, core| {
            backend.run_global_code(core)
        })
    }

    pub fn run_frame_callbacks(&mut self) -> Result<(), SessionError> {
        self.enter(CallLocation::FrameCallback, |backend, core| {
            backend.run_frame_callbacks(core)
        })
    }

    pub fn run_instruction_breakpoint(&mut self, address: u32) -> Result<(), SessionError> {
        self.enter(CallLocation::InstructionBreakpointCallback, |backend, core| {
            backend.run_instruction_breakpoint(core, address)
        })
    }

    pub fn run_memory_breakpoint(
        &mut self,
        address: u32,
        width: u32,
        access: MemoryAccess,
    ) -> Result<(), SessionError> {
        self.enter(CallLocation::MemoryBreakpointCallback, |backend, core| {
            backend.run_memory_breakpoint(core, address, width, access)
        })
    }

    pub fn run_controller_polled(&mut self, port: usize) -> Result<(), SessionError> {
        self.enter(CallLocation::ControllerInputPolledCallback, |backend, core| {
            backend.run_controller_polled(core, port)
        })
    }

    /// Tear the session down. Returns false when it had already happened.
    pub fn shutdown(&mut self) -> bool {
        if self.shut_down {
            return false;
        }
        self.shut_down = true;
        self.core.active.store(false, Ordering::Release);
        self.core.call_location = CallLocation::Shutdown;

        self.backend.destroy(&mut self.core);
        self.core.release();
        (self.core.on_end)(self.core.id);

        info!(
            session_id = self.core.id.0,
            script = %self.core.source_filename,
            "session shut down"
        );
        true
    }

    /// Shut down and drop.
    pub fn destroy(mut self) {
        self.shutdown();
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.core.id)
            .field("source_filename", &self.core.source_filename)
            .field("active", &self.core.is_active())
            .field("call_location", &self.core.call_location)
            .field("finished_global_code", &self.core.finished_global_code)
            .finish_non_exhaustive()
    }
}
