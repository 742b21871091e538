//! Owned Lua runtime and a borrowed view of its value stack

use std::ffi::{CStr, CString};
use std::marker::PhantomData;
use std::os::raw::c_int;
use std::ptr::NonNull;

use mlua_sys as ffi;

use crate::error::{BindError, CallStatus, Result};
use crate::marshal::{FromSlot, Push};

/// Owns a `lua_State` and closes it on drop
pub struct LuaState {
    raw: NonNull<ffi::lua_State>,
}

impl LuaState {
    /// Create a fresh runtime, optionally with the standard libraries
    pub fn new(open_stdlibs: bool) -> Result<Self> {
        // SAFETY: luaL_newstate has no preconditions; null means allocation failure.
        let raw = unsafe { ffi::luaL_newstate() };
        let raw = NonNull::new(raw).ok_or(BindError::StateAllocation)?;
        if open_stdlibs {
            unsafe { ffi::luaL_openlibs(raw.as_ptr()) };
        }
        Ok(Self { raw })
    }

    pub fn as_ptr(&self) -> *mut ffi::lua_State {
        self.raw.as_ptr()
    }

    /// Borrow the value stack
    pub fn stack(&self) -> Stack<'_> {
        Stack {
            state: self.raw,
            _marker: PhantomData,
        }
    }
}

impl Drop for LuaState {
    fn drop(&mut self) {
        unsafe { ffi::lua_close(self.raw.as_ptr()) };
    }
}

/// A view of a live Lua stack
///
/// Copies share the same state. The lifetime ties the view to the owning
/// [`LuaState`]; trampolines build one from the raw pointer Lua hands them.
#[derive(Clone, Copy)]
pub struct Stack<'a> {
    state: NonNull<ffi::lua_State>,
    _marker: PhantomData<&'a LuaState>,
}

impl<'a> Stack<'a> {
    /// Wrap a raw state pointer
    ///
    /// # Safety
    ///
    /// `state` must be a valid Lua state for the whole of `'a`.
    pub unsafe fn from_raw(state: *mut ffi::lua_State) -> Self {
        Self {
            state: NonNull::new_unchecked(state),
            _marker: PhantomData,
        }
    }

    pub fn as_ptr(&self) -> *mut ffi::lua_State {
        self.state.as_ptr()
    }

    /// Number of values on the stack
    pub fn top(&self) -> c_int {
        unsafe { ffi::lua_gettop(self.as_ptr()) }
    }

    /// Callers only restore heights they read from `top` themselves
    pub(crate) fn set_top(&self, top: c_int) {
        unsafe { ffi::lua_settop(self.as_ptr(), top) }
    }

    /// Drop up to `n` values from the top
    pub fn pop_n(&self, n: c_int) {
        let n = n.min(self.top());
        if n > 0 {
            unsafe { ffi::lua_pop(self.as_ptr(), n) }
        }
    }

    /// Whether `idx` names a value currently on the stack
    ///
    /// The registry pseudo-index always counts as valid; other
    /// pseudo-indices never do.
    pub fn is_valid(&self, idx: c_int) -> bool {
        if idx == ffi::LUA_REGISTRYINDEX {
            return true;
        }
        if idx < ffi::LUA_REGISTRYINDEX {
            return false;
        }
        let top = self.top();
        if idx > 0 {
            idx <= top
        } else {
            idx < 0 && -idx <= top
        }
    }

    /// Fail with "no value" unless `idx` is on the stack
    pub fn check_slot(&self, idx: c_int) -> Result<()> {
        if self.is_valid(idx) {
            Ok(())
        } else {
            Err(BindError::type_mismatch(idx, "value", "no value"))
        }
    }

    /// Make sure `n` more values fit on the stack
    pub fn reserve(&self, n: c_int) -> Result<()> {
        if unsafe { ffi::lua_checkstack(self.as_ptr(), n) } == 0 {
            return Err(BindError::StackOverflow(n));
        }
        Ok(())
    }

    /// Convert a relative index into an absolute one
    pub fn absolute(&self, idx: c_int) -> c_int {
        unsafe { ffi::lua_absindex(self.as_ptr(), idx) }
    }

    /// Raw Lua type tag at `idx`; `LUA_TNONE` past either end
    pub fn kind(&self, idx: c_int) -> c_int {
        if !self.is_valid(idx) {
            return ffi::LUA_TNONE;
        }
        unsafe { ffi::lua_type(self.as_ptr(), idx) }
    }

    /// Readable type name at `idx`, using `__name` for typed userdata
    pub fn type_name_at(&self, idx: c_int) -> String {
        let state = self.as_ptr();
        let kind = self.kind(idx);
        if kind == ffi::LUA_TUSERDATA {
            unsafe {
                if ffi::luaL_getmetafield(state, idx, c"__name".as_ptr()) == ffi::LUA_TSTRING {
                    let name = CStr::from_ptr(ffi::lua_tostring(state, -1))
                        .to_string_lossy()
                        .into_owned();
                    ffi::lua_pop(state, 1);
                    return name;
                }
                // luaL_getmetafield pushes nothing when the field is absent
            }
        }
        kind_name(state, kind).to_string()
    }

    /// Push a value
    pub fn push<T: Push>(&self, value: T) -> Result<()> {
        value.push(*self)
    }

    /// Read the top value and remove it
    pub fn pop<T: FromSlot>(&self) -> Result<T> {
        self.check_slot(-1)?;
        let value = T::from_slot(*self, -1);
        self.pop_n(1);
        value
    }

    /// Read a value in place
    pub fn read<T: FromSlot>(&self, idx: c_int) -> Result<T> {
        self.check_slot(idx)?;
        T::from_slot(*self, idx)
    }

    /// Copy the value at the top as an error message and pop it
    pub fn take_error(&self) -> String {
        if !self.is_valid(-1) {
            return "(no error object)".to_string();
        }
        let state = self.as_ptr();
        let kind = self.kind(-1);
        let message = if kind == ffi::LUA_TSTRING || kind == ffi::LUA_TNUMBER {
            unsafe {
                let mut len = 0usize;
                let ptr = ffi::lua_tolstring(state, -1, &mut len);
                let bytes = std::slice::from_raw_parts(ptr as *const u8, len);
                String::from_utf8_lossy(bytes).into_owned()
            }
        } else {
            format!("(error object is a {} value)", self.type_name_at(-1))
        };
        self.pop_n(1);
        message
    }

    /// Load a chunk from memory and leave the compiled function on the stack
    pub fn load_chunk(&self, chunk: &str, source: &[u8]) -> Result<()> {
        let name = to_cstring(chunk)?;
        let status = unsafe {
            ffi::luaL_loadbufferx(
                self.as_ptr(),
                source.as_ptr() as *const _,
                source.len(),
                name.as_ptr(),
                std::ptr::null(),
            )
        };
        if status != ffi::LUA_OK {
            return Err(BindError::Load {
                chunk: chunk.to_string(),
                status: CallStatus::from_code(status),
                message: self.take_error(),
            });
        }
        Ok(())
    }

    /// Run the function below `nargs` arguments in protected mode
    pub fn pcall(&self, nargs: c_int, nresults: c_int, handler: c_int) -> CallStatus {
        let status = unsafe { ffi::lua_pcall(self.as_ptr(), nargs, nresults, handler) };
        CallStatus::from_code(status)
    }
}

/// Restores the stack height when dropped
pub(crate) struct StackGuard<'a> {
    stack: Stack<'a>,
    top: c_int,
}

impl<'a> StackGuard<'a> {
    pub(crate) fn new(stack: Stack<'a>) -> Self {
        Self {
            stack,
            top: stack.top(),
        }
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        self.stack.set_top(self.top);
    }
}

/// Name of a Lua type tag
pub(crate) fn kind_name(state: *mut ffi::lua_State, kind: c_int) -> &'static str {
    if kind == ffi::LUA_TNONE {
        return "no value";
    }
    // lua_typename returns static strings owned by the Lua library
    unsafe { CStr::from_ptr(ffi::lua_typename(state, kind)) }
        .to_str()
        .unwrap_or("?")
}

/// `registry[key]` without metamethods; returns the pushed value's type
///
/// Host code runs these lookups outside any protected call, so nothing a
/// script installs on the registry may run here.
pub(crate) unsafe fn raw_registry_get(state: *mut ffi::lua_State, key: &CStr) -> c_int {
    ffi::lua_pushstring(state, key.as_ptr());
    ffi::lua_rawget(state, ffi::LUA_REGISTRYINDEX)
}

/// `registry[key] = nil` without metamethods
pub(crate) unsafe fn raw_registry_clear(state: *mut ffi::lua_State, key: &CStr) {
    ffi::lua_pushstring(state, key.as_ptr());
    ffi::lua_pushnil(state);
    ffi::lua_rawset(state, ffi::LUA_REGISTRYINDEX);
}

pub(crate) fn to_cstring(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| BindError::InteriorNul(name.to_string()))
}

/// Message handler that appends a traceback to string errors
pub(crate) unsafe extern "C-unwind" fn traceback_handler(state: *mut ffi::lua_State) -> c_int {
    let msg = ffi::lua_tostring(state, 1);
    if msg.is_null() {
        if ffi::luaL_callmeta(state, 1, c"__tostring".as_ptr()) != 0
            && ffi::lua_type(state, -1) == ffi::LUA_TSTRING
        {
            return 1;
        }
        ffi::lua_pushstring(state, c"(error object is not a string)".as_ptr());
        let fallback = ffi::lua_tostring(state, -1);
        ffi::luaL_traceback(state, state, fallback, 1);
        return 1;
    }
    ffi::luaL_traceback(state, state, msg, 1);
    1
}
