//! emuscript-core: Core library for emuscript
//!
//! This crate bridges scripts running inside an emulator to the emulated
//! machine: typed memory access, controller input overrides and a lifecycle
//! for each loaded script, independent of the script language.
//!
//! # Architecture
//!
//! ```text
//! loader thread → PendingSessionQueue → ScriptRunner (emulation thread)
//!                                            ↓
//!                      ScriptBackend entry points (Lua, ...)
//!                                            ↓
//!                     memory / controller APIs → EmulatedMemory, overrides
//! ```
//!
//! # Modules
//!
//! - `value`: Tagged fixed-width values, byte wrappers and type names
//! - `script_value`: Language-neutral dynamic values crossing into host APIs
//! - `memory`: The memory collaborator trait and a region-mapped reference store
//! - `bridge`: Typed, bounds-checked memory operations
//! - `api`: Script API surface metadata and argument decoding
//! - `memory_api`: The `memory` object exposed to scripts
//! - `controller`: Controller input overrides and the `controller` object
//! - `breakpoints`: Per-session instruction and memory breakpoint registries
//! - `abi`: The backend plugin trait and its version
//! - `session`: Session context and lifecycle
//! - `queue`: Pending-session hand-off between threads
//! - `runner`: Per-frame scheduling of admitted sessions
//! - `config`: TOML configuration
//! - `logging`: Structured logging setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod abi;
pub mod api;
pub mod breakpoints;
pub mod bridge;
pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod memory;
pub mod memory_api;
pub mod queue;
pub mod runner;
pub mod script_value;
pub mod session;
pub mod value;

pub use abi::{ABI_VERSION, AbiVersion, BackendHandle, ScriptBackend};
pub use api::{Args, ScriptApi};
pub use bridge::{BridgeLimits, MemoryBridge};
pub use config::BridgeConfig;
pub use controller::{ControllerApi, ControllerOverrides, SharedOverrides};
pub use error::{
    AbiError, ApiCallError, BridgeError, ConfigError, Error, QueueError, Result, ScriptError,
    SessionError,
};
pub use memory::{EmulatedMemory, FlatMemory, SharedMemory};
pub use memory_api::MemoryApi;
pub use queue::PendingSessionQueue;
pub use runner::{FrameReport, RunnerConfig, ScriptRunner};
pub use script_value::ScriptValue;
pub use session::{CallLocation, SessionContext, SessionCore, SessionId};
pub use value::{ByteWrapper, NumericKind, TaggedValue, TypeName, parse_type_name};
