//! Host-side facade over one Lua runtime

use std::borrow::Cow;
use std::os::raw::c_int;
use std::path::Path;

use mlua_sys as ffi;

use crate::bind::Bindable;
use crate::config::{BridgeConfig, UnknownFieldPolicy};
use crate::error::{BindError, CallStatus, Result};
use crate::handle::{tag_of, Handle};
use crate::marshal::{FromReturns, FromSlot, IntoArgs, Push};
use crate::registry::TypeRegistry;
use crate::stack::{kind_name, to_cstring, traceback_handler, LuaState, Stack, StackGuard};

/// One Lua runtime plus the types bound into it
///
/// Every call restores the stack height it found, whether it succeeds or
/// fails. Failures come back as [`BindError`]; nothing here aborts the
/// process on a script error.
pub struct LuaBridge {
    // registry is dropped before the state it describes
    registry: TypeRegistry,
    config: BridgeConfig,
    last_error: Option<String>,
    state: LuaState,
}

impl LuaBridge {
    /// Create a bridge with the default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(BridgeConfig::default())
    }

    /// Create a bridge and run the configured preload scripts
    pub fn with_config(config: BridgeConfig) -> Result<Self> {
        let state = LuaState::new(config.open_stdlibs)?;
        let mut bridge = Self {
            registry: TypeRegistry::new(),
            config,
            last_error: None,
            state,
        };
        let preload = bridge.config.preload.clone();
        for path in &preload {
            bridge.load_file(path)?;
        }
        Ok(bridge)
    }

    /// Create a bridge with default settings and load `paths` in order
    pub fn from_files<I, P>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut config = BridgeConfig::default();
        config.preload = paths.into_iter().map(|p| p.as_ref().to_path_buf()).collect();
        Self::with_config(config)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Diagnostic of the most recent failed call or load
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Borrow the raw value stack
    pub fn stack(&self) -> Stack<'_> {
        self.state.stack()
    }

    /// Number of values currently on the stack
    pub fn top(&self) -> c_int {
        self.stack().top()
    }

    // ========== Types ==========

    /// Register `T`; repeated calls are no-ops
    pub fn register<T: Bindable>(&mut self) -> Result<()> {
        let stack = self.state.stack();
        self.registry.register::<T>(stack, self.config.unknown_fields)
    }

    pub fn is_registered<T: Bindable>(&self) -> bool {
        self.registry.is_registered::<T>()
    }

    // ========== Scripts ==========

    /// Run a script file
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let source = match std::fs::read(path) {
            Ok(source) => source,
            Err(e) => {
                log::error!("Error when loading lua file {}: {}", path.display(), e);
                self.last_error = Some(e.to_string());
                return Err(e.into());
            }
        };
        let chunk = format!("@{}", path.display());
        self.run_chunk(&chunk, &source)?;
        log::info!("Loaded lua file {}", path.display());
        Ok(())
    }

    /// Run a chunk of source
    pub fn exec(&mut self, source: &str) -> Result<()> {
        self.run_chunk("=exec", source.as_bytes())
    }

    /// Run a chunk of source under a given chunk name
    pub fn exec_named(&mut self, chunk: &str, source: &str) -> Result<()> {
        self.run_chunk(&format!("={chunk}"), source.as_bytes())
    }

    fn run_chunk(&mut self, chunk: &str, source: &[u8]) -> Result<()> {
        let stack = self.state.stack();
        let _guard = StackGuard::new(stack);
        let handler = self.push_handler(stack)?;

        let outcome = stack.load_chunk(chunk, source).and_then(|()| {
            let status = stack.pcall(0, 0, handler);
            if status.is_ok() {
                Ok(())
            } else {
                Err(BindError::Load {
                    chunk: chunk.to_string(),
                    status,
                    message: stack.take_error(),
                })
            }
        });

        if let Err(err) = &outcome {
            log::error!("Error when loading lua chunk {}: {}", chunk, err);
        }
        record(&mut self.last_error, outcome)
    }

    // ========== Calls ==========

    /// Call global function `name` with `args`, expecting `R`
    ///
    /// A missing or non-callable global is reported as
    /// [`BindError::FunctionNotFound`] with the runtime-error status.
    pub fn call<R, A>(&mut self, name: &str, args: A) -> Result<R>
    where
        R: FromReturns,
        A: IntoArgs,
    {
        let stack = self.state.stack();
        let _guard = StackGuard::new(stack);
        let outcome = self
            .push_global_callee(stack, name)
            .and_then(|handler| Self::invoke::<R, A>(stack, name, handler, args));
        report_call(&mut self.last_error, self.config.log_call_errors, outcome)
    }

    /// Call `table.name` with `args`, expecting `R`
    pub fn call_in_table<R, A>(&mut self, table: &str, name: &str, args: A) -> Result<R>
    where
        R: FromReturns,
        A: IntoArgs,
    {
        let stack = self.state.stack();
        let _guard = StackGuard::new(stack);
        let qualified = format!("{table}.{name}");
        let outcome = self
            .push_table_callee(stack, table, name)
            .and_then(|handler| Self::invoke::<R, A>(stack, &qualified, handler, args));
        report_call(&mut self.last_error, self.config.log_call_errors, outcome)
    }

    /// Push the message handler, if configured, and return its slot
    fn push_handler(&self, stack: Stack<'_>) -> Result<c_int> {
        if !self.config.traceback {
            return Ok(0);
        }
        stack.reserve(1)?;
        unsafe { ffi::lua_pushcfunction(stack.as_ptr(), traceback_handler) };
        Ok(stack.top())
    }

    fn push_global_callee(&self, stack: Stack<'_>, name: &str) -> Result<c_int> {
        let handler = self.push_handler(stack)?;
        let cname = to_cstring(name)?;
        stack.reserve(1)?;
        let kind = unsafe { ffi::lua_getglobal(stack.as_ptr(), cname.as_ptr()) };
        ensure_callable(stack, name, kind)?;
        Ok(handler)
    }

    fn push_table_callee(&self, stack: Stack<'_>, table: &str, name: &str) -> Result<c_int> {
        let handler = self.push_handler(stack)?;
        let ctable = to_cstring(table)?;
        let cname = to_cstring(name)?;
        stack.reserve(2)?;
        let state = stack.as_ptr();
        let table_kind = unsafe { ffi::lua_getglobal(state, ctable.as_ptr()) };
        if table_kind != ffi::LUA_TTABLE {
            return Err(BindError::TableNotFound {
                name: table.to_string(),
                found: kind_name(state, table_kind),
            });
        }
        let kind = unsafe { ffi::lua_getfield(state, -1, cname.as_ptr()) };
        ensure_callable(stack, &format!("{table}.{name}"), kind)?;
        Ok(handler)
    }

    fn invoke<R, A>(stack: Stack<'_>, name: &str, handler: c_int, args: A) -> Result<R>
    where
        R: FromReturns,
        A: IntoArgs,
    {
        args.push_args(stack)?;
        let status = stack.pcall(A::COUNT, R::COUNT, handler);
        if !status.is_ok() {
            let message = stack.take_error();
            return Err(BindError::Call {
                function: name.to_string(),
                status,
                message,
            });
        }
        R::extract(stack)
    }

    // ========== Values ==========

    /// Push a value onto the stack; it stays there until popped
    pub fn push<T: Push>(&mut self, value: T) -> Result<()> {
        self.stack().push(value)
    }

    /// Pop the top value
    pub fn pop<T: FromSlot>(&mut self) -> Result<T> {
        self.stack().pop()
    }

    /// Assign a global
    pub fn set_global<T: Push>(&mut self, name: &str, value: T) -> Result<()> {
        let stack = self.stack();
        let _guard = StackGuard::new(stack);
        let cname = to_cstring(name)?;
        value.push(stack)?;
        unsafe { ffi::lua_setglobal(stack.as_ptr(), cname.as_ptr()) };
        Ok(())
    }

    /// Read a global
    pub fn global<T: FromSlot>(&mut self, name: &str) -> Result<T> {
        let stack = self.stack();
        let _guard = StackGuard::new(stack);
        let cname = to_cstring(name)?;
        stack.reserve(1)?;
        unsafe { ffi::lua_getglobal(stack.as_ptr(), cname.as_ptr()) };
        stack.read(-1)
    }

    // ========== Reflective field access ==========

    /// Read field `name` of `object` through its registered getter
    pub fn field<T: Bindable, V: FromSlot>(&mut self, object: &mut T, name: &str) -> Result<V> {
        let getter = self.accessor::<T>(name, false)?;
        let stack = self.state.stack();
        let _guard = StackGuard::new(stack);
        stack.reserve(2)?;
        unsafe { ffi::lua_pushcfunction(stack.as_ptr(), getter) };
        // SAFETY: `object` is borrowed for the whole call and the handle
        // does not outlive it; the trampoline only sees it during pcall.
        stack.push(unsafe { Handle::from_mut(object) })?;
        run_accessor::<T>(stack, &mut self.last_error, name, 1, 1)?;
        stack.read(-1)
    }

    /// Write field `name` of `object` through its registered setter
    ///
    /// Unknown names follow the configured [`UnknownFieldPolicy`].
    pub fn set_field<T: Bindable, V: Push>(&mut self, object: &mut T, name: &str, value: V) -> Result<()> {
        let setter = match self.accessor::<T>(name, true) {
            Ok(setter) => setter,
            Err(BindError::UnknownField { .. })
                if self.config.unknown_fields == UnknownFieldPolicy::Ignore =>
            {
                log::trace!("ignored write to unknown field '{}' on {}", name, tag_of::<T>().name());
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let stack = self.state.stack();
        let _guard = StackGuard::new(stack);
        stack.reserve(3)?;
        unsafe { ffi::lua_pushcfunction(stack.as_ptr(), setter) };
        // SAFETY: as in `field`
        stack.push(unsafe { Handle::from_mut(object) })?;
        value.push(stack)?;
        run_accessor::<T>(stack, &mut self.last_error, name, 2, 0)
    }

    fn accessor<T: Bindable>(&self, name: &str, write: bool) -> Result<ffi::lua_CFunction> {
        let binding = self
            .registry
            .binding::<T>()
            .filter(|b| b.is_registered())
            .ok_or_else(|| BindError::UnregisteredType(tag_of::<T>().name().to_string()))?;
        let found = if write { binding.setter(name) } else { binding.getter(name) };
        found.ok_or_else(|| BindError::UnknownField {
            type_name: binding.name().to_string(),
            field: name.to_string(),
        })
    }
}

fn record<R>(last_error: &mut Option<String>, outcome: Result<R>) -> Result<R> {
    if let Err(err) = &outcome {
        *last_error = Some(err.diagnostic().map_or_else(|| err.to_string(), Cow::into_owned));
    }
    outcome
}

/// Log a failed host-to-script call, then record it
fn report_call<R>(last_error: &mut Option<String>, log_errors: bool, outcome: Result<R>) -> Result<R> {
    if let Err(err) = &outcome {
        if log_errors {
            let diagnostic = err.diagnostic().map_or_else(|| err.to_string(), Cow::into_owned);
            log::error!("call error: {}", diagnostic);
        }
    }
    record(last_error, outcome)
}

/// Run a pushed getter or setter trampoline in protected mode
fn run_accessor<T: Bindable>(
    stack: Stack<'_>,
    last_error: &mut Option<String>,
    name: &str,
    nargs: c_int,
    nresults: c_int,
) -> Result<()> {
    let status = stack.pcall(nargs, nresults, 0);
    if status != CallStatus::Ok {
        let message = stack.take_error();
        *last_error = Some(message.clone());
        return Err(BindError::Call {
            function: format!("{}.{}", tag_of::<T>().name(), name),
            status,
            message,
        });
    }
    Ok(())
}

fn ensure_callable(stack: Stack<'_>, name: &str, kind: c_int) -> Result<()> {
    if kind == ffi::LUA_TFUNCTION {
        return Ok(());
    }
    let state = stack.as_ptr();
    if kind == ffi::LUA_TTABLE || kind == ffi::LUA_TUSERDATA {
        let call_kind = unsafe { ffi::luaL_getmetafield(state, -1, c"__call".as_ptr()) };
        if call_kind != ffi::LUA_TNIL {
            stack.pop_n(1);
            return Ok(());
        }
    }
    Err(BindError::FunctionNotFound {
        name: name.to_string(),
        found: kind_name(state, kind),
    })
}
