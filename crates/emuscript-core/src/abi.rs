//! The plugin ABI between the host and script-language backends.
//!
//! A backend is an independently built crate that implements
//! [`ScriptBackend`]. The host never looks inside it: it checks the ABI
//! version once when a session is built, then only invokes entry points and
//! finally the destructor.

use crate::breakpoints::MemoryAccess;
use crate::error::ScriptError;
use crate::session::SessionCore;
use std::any::Any;
use std::fmt;

/// Opaque per-session state owned by a backend.
pub type BackendHandle = Box<dyn Any + Send>;

/// ABI version. Backends are accepted when the major numbers match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AbiVersion {
    pub major: u16,
    pub minor: u16,
}

impl AbiVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub const fn is_compatible_with(self, host: Self) -> bool {
        self.major == host.major
    }
}

impl fmt::Display for AbiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// ABI implemented by this host.
pub const ABI_VERSION: AbiVersion = AbiVersion::new(1, 0);

/// Entry points a backend exposes for one session.
///
/// Every entry point receives the session's [`SessionCore`] so the backend
/// can read its identity, set the yielding flags, register breakpoints and
/// print. Entry points the language does not support can be left at their
/// defaults.
pub trait ScriptBackend: Send {
    fn abi_version(&self) -> AbiVersion;

    /// Name of the script language, e.g. `"lua"`.
    fn language(&self) -> &str;

    /// Run (or resume) the script's top-level code.
    ///
    /// Backends whose global code suspends set
    /// [`SessionCore::called_yielding_function_in_last_global_script_resume`]
    /// so the runner resumes it next frame.
    fn run_global_code(&mut self, _core: &mut SessionCore) -> Result<(), ScriptError> {
        Ok(())
    }

    fn run_frame_callbacks(&mut self, _core: &mut SessionCore) -> Result<(), ScriptError> {
        Ok(())
    }

    fn run_instruction_breakpoint(
        &mut self,
        _core: &mut SessionCore,
        _address: u32,
    ) -> Result<(), ScriptError> {
        Ok(())
    }

    /// An access of `width` bytes at `address` touched a registered watch.
    fn run_memory_breakpoint(
        &mut self,
        _core: &mut SessionCore,
        _address: u32,
        _width: u32,
        _access: MemoryAccess,
    ) -> Result<(), ScriptError> {
        Ok(())
    }

    /// `port` is 0-based.
    fn run_controller_polled(
        &mut self,
        _core: &mut SessionCore,
        _port: usize,
    ) -> Result<(), ScriptError> {
        Ok(())
    }

    /// Tear down engine state. Called exactly once, at shutdown.
    fn destroy(&mut self, core: &mut SessionCore);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatibility_is_by_major_version() {
        assert!(AbiVersion::new(1, 7).is_compatible_with(ABI_VERSION));
        assert!(!AbiVersion::new(2, 0).is_compatible_with(ABI_VERSION));
        assert!(!AbiVersion::new(0, 9).is_compatible_with(ABI_VERSION));
    }

    #[test]
    fn display() {
        assert_eq!(ABI_VERSION.to_string(), "1.0");
        assert_eq!(AbiVersion::new(3, 12).to_string(), "3.12");
    }
}
