//! The Lua implementation of [`ScriptBackend`].

use crate::convert::{
    CLASS_KEY, LuaByteWrapper, lua_value_to_script, new_byte_wrapper, script_to_lua_value,
};
use emuscript_core::abi::{ABI_VERSION, AbiVersion, ScriptBackend};
use emuscript_core::api::ScriptApi;
use emuscript_core::breakpoints::{MemoryAccess, MemoryWatch};
use emuscript_core::error::ScriptError;
use emuscript_core::session::{Printer, SessionCore};
use mlua::{Function, IntoLuaMulti, Lua, MultiValue, RegistryKey, Thread, ThreadStatus, Value};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

/// Change to a session breakpoint registry requested from Lua.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistryChange {
    AddInstruction(u32),
    RemoveInstruction(u32),
    AddWatch(MemoryWatch),
    RemoveWatch(MemoryWatch),
}

/// Callbacks registered by the script, held in the Lua registry.
///
/// Lua-side registration functions only have access to this table; the
/// backend folds `changes` into the session's registries after every entry
/// point.
#[derive(Default)]
struct Hooks {
    frame: Vec<RegistryKey>,
    controller: Vec<RegistryKey>,
    instruction: Vec<(u32, RegistryKey)>,
    memory: Vec<(MemoryWatch, RegistryKey)>,
    changes: Vec<RegistryChange>,
    stop_requested: bool,
}

type SharedHooks = Arc<Mutex<Hooks>>;

fn script_error(err: &mlua::Error) -> ScriptError {
    ScriptError::new(err.to_string())
}

/// One Lua state running one script.
pub struct LuaBackend {
    lua: Lua,
    chunk_name: String,
    global_thread: Option<RegistryKey>,
    hooks: SharedHooks,
    printer: Arc<Mutex<Option<Printer>>>,
}

impl LuaBackend {
    /// Create a Lua state, install `apis` as global objects and compile
    /// `source`. Nothing in the script runs until the first
    /// [`run_global_code`](ScriptBackend::run_global_code).
    pub fn new(
        chunk_name: &str,
        source: &str,
        apis: &[Arc<dyn ScriptApi>],
    ) -> mlua::Result<Self> {
        let lua = Lua::new();
        let hooks = SharedHooks::default();
        let printer = Arc::new(Mutex::new(None));

        for api in apis {
            install_api(&lua, Arc::clone(api))?;
        }
        install_print(&lua, Arc::clone(&printer))?;
        install_byte_wrapper(&lua)?;
        install_hooks(&lua, &hooks)?;

        let global_thread = {
            let chunk = lua
                .load(source.trim_start_matches('\u{FEFF}'))
                .set_name(format!("@{chunk_name}"))
                .into_function()?;
            let thread = lua.create_thread(chunk)?;
            lua.create_registry_value(thread)?
        };
        debug!(script = chunk_name, apis = apis.len(), "lua state created");

        Ok(Self {
            lua,
            chunk_name: chunk_name.to_string(),
            global_thread: Some(global_thread),
            hooks,
            printer,
        })
    }

    pub fn chunk_name(&self) -> &str {
        &self.chunk_name
    }

    /// Access the Lua state, e.g. to install extra globals.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    fn enter(&self, core: &SessionCore) {
        let mut printer = self.printer.lock();
        if printer.is_none() {
            *printer = Some(core.printer());
        }
    }

    /// Apply registrations made by the script during the last call.
    fn sync(&self, core: &mut SessionCore) {
        let mut hooks = self.hooks.lock();
        for change in hooks.changes.drain(..) {
            match change {
                RegistryChange::AddInstruction(address) => {
                    core.instruction_breakpoints.add(address);
                }
                RegistryChange::RemoveInstruction(address) => {
                    core.instruction_breakpoints.remove(address);
                }
                RegistryChange::AddWatch(watch) => core.memory_breakpoints.add(watch),
                RegistryChange::RemoveWatch(watch) => {
                    core.memory_breakpoints.remove(&watch);
                }
            }
        }
        if std::mem::take(&mut hooks.stop_requested) {
            debug!(session_id = core.id().0, script = %self.chunk_name, "script requested shutdown");
            core.cancel_handle().cancel();
        }
    }

    /// Call each callback selected by `select` with `args`.
    ///
    /// Callbacks are resolved before any runs, so a callback registering
    /// another hook does not see it until the next call. Every callback runs;
    /// the first error is reported.
    fn call_hooks<'a>(
        &'a self,
        select: impl Fn(&'a Lua, &Hooks) -> mlua::Result<Vec<Function<'a>>>,
        args: impl Fn(&'a Lua) -> mlua::Result<MultiValue<'a>>,
    ) -> Result<(), ScriptError> {
        let callbacks = {
            let hooks = self.hooks.lock();
            select(&self.lua, &*hooks).map_err(|err| script_error(&err))?
        };
        let mut first_error = None;
        for callback in callbacks {
            let result = args(&self.lua).and_then(|values| callback.call::<_, ()>(values));
            if let Err(err) = result {
                first_error.get_or_insert_with(|| script_error(&err));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn finish(&self, core: &mut SessionCore, result: Result<(), ScriptError>) -> Result<(), ScriptError> {
        self.sync(core);
        result
    }
}

fn resolve<'lua, 'k>(
    lua: &'lua Lua,
    keys: impl IntoIterator<Item = &'k RegistryKey>,
) -> mlua::Result<Vec<Function<'lua>>> {
    keys.into_iter().map(|key| lua.registry_value(key)).collect()
}

impl ScriptBackend for LuaBackend {
    fn abi_version(&self) -> AbiVersion {
        ABI_VERSION
    }

    fn language(&self) -> &str {
        "lua"
    }

    fn run_global_code(&mut self, core: &mut SessionCore) -> Result<(), ScriptError> {
        self.enter(core);
        let Some(key) = &self.global_thread else {
            core.called_yielding_function_in_last_global_script_resume = false;
            return Ok(());
        };

        let (yielded, result) = match self.lua.registry_value::<Thread>(key) {
            Ok(thread) => {
                let result = thread.resume::<_, MultiValue>(()).map(drop);
                (
                    result.is_ok() && thread.status() == ThreadStatus::Resumable,
                    result.map_err(|err| script_error(&err)),
                )
            }
            Err(err) => (false, Err(script_error(&err))),
        };
        core.called_yielding_function_in_last_global_script_resume = yielded;
        if !yielded {
            if let Some(key) = self.global_thread.take() {
                self.lua.remove_registry_value(key).ok();
            }
            trace!(script = %self.chunk_name, "global code finished");
        }
        self.finish(core, result)
    }

    fn run_frame_callbacks(&mut self, core: &mut SessionCore) -> Result<(), ScriptError> {
        self.enter(core);
        core.called_yielding_function_in_last_frame_callback_script_resume = false;
        let result = self.call_hooks(
            |lua, hooks| resolve(lua, hooks.frame.iter()),
            |_| Ok(MultiValue::new()),
        );
        self.finish(core, result)
    }

    fn run_instruction_breakpoint(
        &mut self,
        core: &mut SessionCore,
        address: u32,
    ) -> Result<(), ScriptError> {
        self.enter(core);
        let result = self.call_hooks(
            |lua, hooks| {
                resolve(
                    lua,
                    hooks
                        .instruction
                        .iter()
                        .filter(|(hook, _)| *hook == address)
                        .map(|(_, key)| key),
                )
            },
            |lua| (address,).into_lua_multi(lua),
        );
        self.finish(core, result)
    }

    fn run_memory_breakpoint(
        &mut self,
        core: &mut SessionCore,
        address: u32,
        width: u32,
        access: MemoryAccess,
    ) -> Result<(), ScriptError> {
        self.enter(core);
        let result = self.call_hooks(
            |lua, hooks| {
                resolve(
                    lua,
                    hooks
                        .memory
                        .iter()
                        .filter(|(watch, _)| watch.matches(address, width, access))
                        .map(|(_, key)| key),
                )
            },
            |lua| (address, access.to_string()).into_lua_multi(lua),
        );
        self.finish(core, result)
    }

    fn run_controller_polled(
        &mut self,
        core: &mut SessionCore,
        port: usize,
    ) -> Result<(), ScriptError> {
        self.enter(core);
        let result = self.call_hooks(
            |lua, hooks| resolve(lua, hooks.controller.iter()),
            |lua| (port + 1,).into_lua_multi(lua),
        );
        self.finish(core, result)
    }

    fn destroy(&mut self, core: &mut SessionCore) {
        let hooks = std::mem::take(&mut *self.hooks.lock());
        let keys = hooks
            .frame
            .into_iter()
            .chain(hooks.controller)
            .chain(hooks.instruction.into_iter().map(|(_, key)| key))
            .chain(hooks.memory.into_iter().map(|(_, key)| key))
            .chain(self.global_thread.take());
        for key in keys {
            self.lua.remove_registry_value(key).ok();
        }
        self.lua.expire_registry_values();
        self.printer.lock().take();
        debug!(session_id = core.id().0, script = %self.chunk_name, "lua state destroyed");
    }
}

fn runtime_error(err: impl std::fmt::Display) -> mlua::Error {
    mlua::Error::RuntimeError(err.to_string())
}

/// Expose `api` as a global object whose methods forward to
/// [`ScriptApi::call`].
fn install_api(lua: &Lua, api: Arc<dyn ScriptApi>) -> mlua::Result<()> {
    let object = lua.create_table()?;
    object.raw_set(CLASS_KEY, api.class_name())?;
    for meta in api.functions() {
        let api = Arc::clone(&api);
        let name = meta.name;
        let function = lua.create_function(move |lua, args: MultiValue| {
            let values = args
                .into_iter()
                .map(|value| lua_value_to_script(&value))
                .collect::<mlua::Result<Vec<_>>>()?;
            let result = api.call(name, &values).map_err(runtime_error)?;
            script_to_lua_value(lua, &result)
        })?;
        object.raw_set(name, function)?;
    }
    lua.globals().raw_set(api.class_name(), object)
}

/// Route `print` to the session's print callback.
fn install_print(lua: &Lua, printer: Arc<Mutex<Option<Printer>>>) -> mlua::Result<()> {
    let print = lua.create_function(move |lua, args: MultiValue| {
        let tostring: Function = lua.globals().get("tostring")?;
        let mut line = String::new();
        for (i, value) in args.into_iter().enumerate() {
            if i > 0 {
                line.push('\t');
            }
            let text: mlua::String = tostring.call(value)?;
            line.push_str(&text.to_string_lossy());
        }
        if let Some(printer) = printer.lock().as_ref() {
            printer.print(&line);
        }
        Ok(())
    })?;
    lua.globals().set("print", print)
}

fn install_byte_wrapper(lua: &Lua) -> mlua::Result<()> {
    let class = lua.create_table()?;
    class.set(
        "new",
        lua.create_function(|lua, (value, size): (Value, Option<i64>)| {
            let wrapper = new_byte_wrapper(&lua_value_to_script(&value)?, size)?;
            lua.create_userdata(LuaByteWrapper(wrapper))
        })?,
    )?;
    lua.globals().set("ByteWrapper", class)
}

fn parse_access(name: &str) -> mlua::Result<MemoryAccess> {
    MemoryAccess::parse(name).ok_or_else(|| {
        runtime_error(format!(
            "unknown memory access \"{name}\"; expected \"read\", \"write\" or \"read_write\""
        ))
    })
}

/// Registration functions: `on_frame`, `on_controller_polled`,
/// `add_instruction_breakpoint`, `remove_instruction_breakpoint`,
/// `add_memory_watch`, `remove_memory_watch` and `shutdown_script`.
fn install_hooks(lua: &Lua, hooks: &SharedHooks) -> mlua::Result<()> {
    let globals = lua.globals();

    let shared = Arc::clone(hooks);
    globals.set(
        "on_frame",
        lua.create_function(move |lua, callback: Function| {
            let key = lua.create_registry_value(callback)?;
            shared.lock().frame.push(key);
            Ok(())
        })?,
    )?;

    let shared = Arc::clone(hooks);
    globals.set(
        "on_controller_polled",
        lua.create_function(move |lua, callback: Function| {
            let key = lua.create_registry_value(callback)?;
            shared.lock().controller.push(key);
            Ok(())
        })?,
    )?;

    let shared = Arc::clone(hooks);
    globals.set(
        "add_instruction_breakpoint",
        lua.create_function(move |lua, (address, callback): (u32, Function)| {
            let key = lua.create_registry_value(callback)?;
            let mut hooks = shared.lock();
            hooks.instruction.push((address, key));
            hooks.changes.push(RegistryChange::AddInstruction(address));
            Ok(())
        })?,
    )?;

    let shared = Arc::clone(hooks);
    globals.set(
        "remove_instruction_breakpoint",
        lua.create_function(move |lua, address: u32| {
            let mut hooks = shared.lock();
            let Some(index) = hooks.instruction.iter().rposition(|(a, _)| *a == address) else {
                return Ok(false);
            };
            let (_, key) = hooks.instruction.remove(index);
            hooks.changes.push(RegistryChange::RemoveInstruction(address));
            drop(hooks);
            lua.remove_registry_value(key)?;
            Ok(true)
        })?,
    )?;

    let shared = Arc::clone(hooks);
    globals.set(
        "add_memory_watch",
        lua.create_function(
            move |lua, (address, len, access, callback): (u32, u32, String, Function)| {
                let watch = MemoryWatch::new(address, len, parse_access(&access)?);
                let key = lua.create_registry_value(callback)?;
                let mut hooks = shared.lock();
                hooks.memory.push((watch, key));
                hooks.changes.push(RegistryChange::AddWatch(watch));
                Ok(())
            },
        )?,
    )?;

    let shared = Arc::clone(hooks);
    globals.set(
        "remove_memory_watch",
        lua.create_function(move |lua, (address, len, access): (u32, u32, String)| {
            let watch = MemoryWatch::new(address, len, parse_access(&access)?);
            let mut hooks = shared.lock();
            let Some(index) = hooks.memory.iter().rposition(|(w, _)| *w == watch) else {
                return Ok(false);
            };
            let (_, key) = hooks.memory.remove(index);
            hooks.changes.push(RegistryChange::RemoveWatch(watch));
            drop(hooks);
            lua.remove_registry_value(key)?;
            Ok(true)
        })?,
    )?;

    let shared = Arc::clone(hooks);
    globals.set(
        "shutdown_script",
        lua.create_function(move |_, ()| {
            shared.lock().stop_requested = true;
            Ok(())
        })?,
    )?;

    Ok(())
}
