//! emuscript-lua: Lua 5.4 backend for emuscript
//!
//! Each script gets its own Lua state. The `memory` and `controller` objects
//! are installed as globals and forward to the host APIs; top-level code runs
//! inside a coroutine so `coroutine.yield()` suspends it until the next frame.
//!
//! Globals available to scripts:
//!
//! - `memory`, `controller`: host API objects, called with `:`
//! - `ByteWrapper.new(value[, size])`
//! - `print(...)`: routed to the session's print callback
//! - `on_frame(fn)`, `on_controller_polled(fn)`
//! - `add_instruction_breakpoint(address, fn)`, `remove_instruction_breakpoint(address)`
//! - `add_memory_watch(address, length, access, fn)`, `remove_memory_watch(address, length, access)`
//! - `shutdown_script()`

#![forbid(unsafe_code)]

mod backend;
pub mod convert;

pub use backend::LuaBackend;

use emuscript_core::api::ScriptApi;
use emuscript_core::bridge::BridgeLimits;
use emuscript_core::controller::{ControllerApi, SharedOverrides};
use emuscript_core::error::AbiError;
use emuscript_core::memory::SharedMemory;
use emuscript_core::memory_api::MemoryApi;
use emuscript_core::session::{SessionBuilder, SessionContext, SessionId};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Error type for loading Lua scripts
#[derive(Debug, thiserror::Error)]
pub enum LuaError {
    #[error("failed to read script {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("lua error: {0}")]
    Lua(#[from] mlua::Error),

    #[error(transparent)]
    Abi(#[from] AbiError),
}

/// Creates Lua sessions wired to one emulated machine.
#[derive(Clone)]
pub struct LuaLoader {
    apis: Vec<Arc<dyn ScriptApi>>,
}

impl LuaLoader {
    pub fn new(memory: SharedMemory, overrides: SharedOverrides, limits: BridgeLimits) -> Self {
        Self {
            apis: vec![
                Arc::new(MemoryApi::new(memory, limits)),
                Arc::new(ControllerApi::new(overrides)),
            ],
        }
    }

    pub fn backend(&self, chunk_name: &str, source: &str) -> Result<LuaBackend, LuaError> {
        Ok(LuaBackend::new(chunk_name, source, &self.apis)?)
    }

    /// A session builder with a compiled backend, ready for callbacks.
    pub fn builder(
        &self,
        id: SessionId,
        chunk_name: &str,
        source: &str,
    ) -> Result<SessionBuilder, LuaError> {
        let backend = self.backend(chunk_name, source)?;
        Ok(SessionContext::builder(id, chunk_name).backend(backend))
    }

    /// Compile `source` into a session with default callbacks.
    pub fn load_source(&self, chunk_name: &str, source: &str) -> Result<SessionContext, LuaError> {
        Ok(self.builder(SessionId::next(), chunk_name, source)?.build()?)
    }

    pub fn load_file(&self, path: &Path) -> Result<SessionContext, LuaError> {
        let source = std::fs::read_to_string(path).map_err(|source| LuaError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let session = self.load_source(&path.display().to_string(), &source)?;
        info!(session_id = session.id().0, script = %path.display(), "lua script loaded");
        Ok(session)
    }
}

impl std::fmt::Debug for LuaLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaLoader")
            .field(
                "apis",
                &self.apis.iter().map(|api| api.class_name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
