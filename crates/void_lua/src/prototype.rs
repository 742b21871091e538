//! Prototype and metatable construction
//!
//! For every registered type the runtime holds two registry entries:
//!
//! ```text
//! registry[<Name>PtrPrototype] = { __methods = {...}, __getters = {...},
//!                                  __setters = {...}, __strict_writes = bool }
//! registry[<Name>PtrMetatable] = { __index = index_resolver,
//!                                  __newindex = newindex_resolver,
//!                                  __prototype = <prototype>, __tag = <tag>,
//!                                  __name = "<Name>PtrMetatable" }
//! ```
//!
//! Both are built with the C API inside a protected call, so an allocation
//! failure halfway through becomes an error instead of a panic of the runtime.

use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_int;
use std::panic::{catch_unwind, AssertUnwindSafe};

use mlua_sys as ffi;

use crate::config::UnknownFieldPolicy;
use crate::error::{BindError, Result};
use crate::handle::{TypeTag, TAG_KEY};
use crate::registry::TypeBinding;
use crate::stack::{raw_registry_clear, raw_registry_get, to_cstring, Stack, StackGuard};

const METHODS_KEY: &CStr = c"__methods";
const GETTERS_KEY: &CStr = c"__getters";
const SETTERS_KEY: &CStr = c"__setters";
const STRICT_KEY: &CStr = c"__strict_writes";
const PROTOTYPE_KEY: &CStr = c"__prototype";

type MemberTable = Vec<(CString, ffi::lua_CFunction)>;

/// Everything `build_prototype` needs, prepared before entering Lua
struct PrototypeLayout<'a> {
    prototype: &'a CStr,
    metatable: &'a CStr,
    tag: *mut c_void,
    methods: MemberTable,
    getters: MemberTable,
    setters: MemberTable,
    strict: bool,
}

fn member_table(
    members: &std::collections::BTreeMap<String, ffi::lua_CFunction>,
) -> Result<MemberTable> {
    members
        .iter()
        .map(|(name, f)| Ok((to_cstring(name)?, *f)))
        .collect()
}

/// Install the prototype and metatable of `binding`
///
/// Fails without touching the runtime when either registry key is taken.
/// On any later failure the partial entries are removed again.
pub(crate) fn install(
    stack: Stack<'_>,
    binding: &TypeBinding,
    policy: UnknownFieldPolicy,
) -> Result<()> {
    let tag = binding.tag();
    let state = stack.as_ptr();
    let _guard = StackGuard::new(stack);
    stack.reserve(4)?;

    let (metatable_kind, prototype_kind) = unsafe {
        let metatable_kind = raw_registry_get(state, tag.metatable_cstr());
        let prototype_kind = raw_registry_get(state, tag.prototype_cstr());
        ffi::lua_pop(state, 2);
        (metatable_kind, prototype_kind)
    };
    if metatable_kind != ffi::LUA_TNIL || prototype_kind != ffi::LUA_TNIL {
        return Err(BindError::MetatableCollision {
            type_name: tag.name().to_string(),
            metatable: tag.metatable_name().to_string(),
        });
    }

    let layout = PrototypeLayout {
        prototype: tag.prototype_cstr(),
        metatable: tag.metatable_cstr(),
        tag: tag.as_light_ptr(),
        methods: member_table(&binding.methods)?,
        getters: member_table(&binding.getters)?,
        setters: member_table(&binding.setters)?,
        strict: policy == UnknownFieldPolicy::Error,
    };

    unsafe {
        ffi::lua_pushcfunction(state, build_prototype);
        ffi::lua_pushlightuserdata(state, &layout as *const PrototypeLayout<'_> as *mut c_void);
    }
    let status = stack.pcall(1, 0, 0);
    if !status.is_ok() {
        let message = stack.take_error();
        remove_entries(stack, tag);
        return Err(BindError::prototype(tag.name(), format!("{status}: {message}")));
    }
    Ok(())
}

/// Clear both registry entries of `tag`
fn remove_entries(stack: Stack<'_>, tag: &TypeTag) {
    let state = stack.as_ptr();
    unsafe {
        raw_registry_clear(state, tag.metatable_cstr());
        raw_registry_clear(state, tag.prototype_cstr());
    }
}

unsafe fn push_member_table(state: *mut ffi::lua_State, members: &MemberTable) {
    ffi::lua_createtable(state, 0, members.len() as c_int);
    for (name, f) in members.iter() {
        ffi::lua_pushcfunction(state, *f);
        ffi::lua_setfield(state, -2, name.as_ptr());
    }
}

/// Protected builder: `(layout) -> ()`
unsafe extern "C-unwind" fn build_prototype(state: *mut ffi::lua_State) -> c_int {
    let layout = &*(ffi::lua_touserdata(state, 1) as *const PrototypeLayout<'_>);

    ffi::lua_createtable(state, 0, 4);
    let prototype = ffi::lua_gettop(state);
    push_member_table(state, &layout.methods);
    ffi::lua_setfield(state, prototype, METHODS_KEY.as_ptr());
    push_member_table(state, &layout.getters);
    ffi::lua_setfield(state, prototype, GETTERS_KEY.as_ptr());
    push_member_table(state, &layout.setters);
    ffi::lua_setfield(state, prototype, SETTERS_KEY.as_ptr());
    ffi::lua_pushboolean(state, layout.strict as c_int);
    ffi::lua_setfield(state, prototype, STRICT_KEY.as_ptr());

    ffi::lua_pushvalue(state, prototype);
    ffi::lua_setfield(state, ffi::LUA_REGISTRYINDEX, layout.prototype.as_ptr());

    if ffi::luaL_newmetatable(state, layout.metatable.as_ptr()) == 0 {
        ffi::lua_pushstring(state, c"metatable already exists".as_ptr());
        return ffi::lua_error(state);
    }
    let metatable = ffi::lua_gettop(state);
    ffi::lua_pushcfunction(state, index_resolver);
    ffi::lua_setfield(state, metatable, c"__index".as_ptr());
    ffi::lua_pushcfunction(state, newindex_resolver);
    ffi::lua_setfield(state, metatable, c"__newindex".as_ptr());
    ffi::lua_pushvalue(state, prototype);
    ffi::lua_setfield(state, metatable, PROTOTYPE_KEY.as_ptr());
    ffi::lua_pushlightuserdata(state, layout.tag);
    ffi::lua_setfield(state, metatable, TAG_KEY.as_ptr());
    0
}

/// Push `proto[table_key]` of the handle at slot 1 and return its kind
///
/// Leaves the metatable, the prototype and the member table on the stack.
unsafe fn push_member_table_of(state: *mut ffi::lua_State, table_key: &CStr) -> c_int {
    if ffi::lua_getmetatable(state, 1) == 0 {
        return ffi::LUA_TNIL;
    }
    if ffi::lua_getfield(state, -1, PROTOTYPE_KEY.as_ptr()) != ffi::LUA_TTABLE {
        return ffi::LUA_TNIL;
    }
    ffi::lua_getfield(state, -1, table_key.as_ptr())
}

/// `__index(self, key)`: methods first, then getters, else nil
unsafe extern "C-unwind" fn index_resolver(state: *mut ffi::lua_State) -> c_int {
    if push_member_table_of(state, METHODS_KEY) == ffi::LUA_TTABLE {
        ffi::lua_pushvalue(state, 2);
        if ffi::lua_rawget(state, -2) != ffi::LUA_TNIL {
            return 1;
        }
    }
    ffi::lua_settop(state, 2);

    if push_member_table_of(state, GETTERS_KEY) == ffi::LUA_TTABLE {
        ffi::lua_pushvalue(state, 2);
        if ffi::lua_rawget(state, -2) == ffi::LUA_TFUNCTION {
            ffi::lua_pushvalue(state, 1);
            ffi::lua_call(state, 1, 1);
            return 1;
        }
    }
    ffi::lua_pushnil(state);
    1
}

/// `__newindex(self, key, value)`: setter if declared, else the unknown-field policy
unsafe extern "C-unwind" fn newindex_resolver(state: *mut ffi::lua_State) -> c_int {
    if push_member_table_of(state, SETTERS_KEY) == ffi::LUA_TTABLE {
        ffi::lua_pushvalue(state, 2);
        if ffi::lua_rawget(state, -2) == ffi::LUA_TFUNCTION {
            ffi::lua_pushvalue(state, 1);
            ffi::lua_pushvalue(state, 3);
            ffi::lua_call(state, 2, 0);
            return 0;
        }
    }
    ffi::lua_settop(state, 3);

    let strict = ffi::lua_getmetatable(state, 1) != 0
        && ffi::lua_getfield(state, -1, PROTOTYPE_KEY.as_ptr()) == ffi::LUA_TTABLE
        && ffi::lua_getfield(state, -1, STRICT_KEY.as_ptr()) == ffi::LUA_TBOOLEAN
        && ffi::lua_toboolean(state, -1) != 0;
    ffi::lua_settop(state, 3);

    if !strict {
        trace_ignored_write(state);
        return 0;
    }

    ffi::lua_pushstring(state, c"cannot assign unknown field '".as_ptr());
    ffi::luaL_tolstring(state, 2, std::ptr::null_mut());
    ffi::lua_pushstring(state, c"' on ".as_ptr());
    ffi::luaL_tolstring(state, 1, std::ptr::null_mut());
    ffi::lua_concat(state, 4);
    ffi::lua_error(state)
}

fn trace_ignored_write(state: *mut ffi::lua_State) {
    if !log::log_enabled!(log::Level::Trace) {
        return;
    }
    // a misbehaving logger must not unwind into Lua
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let stack = unsafe { Stack::from_raw(state) };
        let key = if stack.kind(2) == ffi::LUA_TSTRING {
            stack.read::<String>(2).unwrap_or_default()
        } else {
            stack.type_name_at(2)
        };
        log::trace!("ignored write to unknown field '{}' on {}", key, stack.type_name_at(1));
    }));
}
