//! Tagged, non-owning handles to host objects
//!
//! A handle is a full userdata holding a [`HandleCell`]: the object pointer
//! and the address of the type's interned [`TypeTag`]. The userdata carries
//! the type's metatable, so both the metatable name and the tag address must
//! match before a handle is turned back into a pointer.

use std::any::TypeId;
use std::collections::BTreeMap;
use std::ffi::{c_void, CString};
use std::fmt;
use std::marker::PhantomData;
use std::os::raw::c_int;
use std::ptr::NonNull;

use mlua_sys as ffi;
use parking_lot::{const_rwlock, RwLock};

use crate::bind::Bindable;
use crate::error::{BindError, Result};
use crate::stack::{raw_registry_get, Stack};

/// Metatable field holding the owning tag as light userdata
pub(crate) const TAG_KEY: &std::ffi::CStr = c"__tag";

/// Immutable per-type identity, interned once per process
pub struct TypeTag {
    name: String,
    prototype: CString,
    metatable: CString,
}

impl TypeTag {
    /// Bound type name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registry key of the prototype table
    pub fn prototype_name(&self) -> &str {
        self.prototype.to_str().unwrap_or_default()
    }

    /// Registry key of the metatable
    pub fn metatable_name(&self) -> &str {
        self.metatable.to_str().unwrap_or_default()
    }

    pub(crate) fn prototype_cstr(&self) -> &std::ffi::CStr {
        &self.prototype
    }

    pub(crate) fn metatable_cstr(&self) -> &std::ffi::CStr {
        &self.metatable
    }

    pub(crate) fn as_light_ptr(&'static self) -> *mut c_void {
        self as *const TypeTag as *mut c_void
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeTag")
            .field("name", &self.name)
            .field("metatable", &self.metatable)
            .finish()
    }
}

static TAGS: RwLock<BTreeMap<TypeId, &'static TypeTag>> = const_rwlock(BTreeMap::new());

/// Interned tag for `T`
///
/// Tags only hold names derived from the type, so sharing them between
/// runtimes is harmless. Registration state lives in each runtime's registry.
pub fn tag_of<T: Bindable>() -> &'static TypeTag {
    let id = TypeId::of::<T>();
    if let Some(tag) = TAGS.read().get(&id).copied() {
        return tag;
    }
    let mut tags = TAGS.write();
    *tags.entry(id).or_insert_with(|| {
        let name = T::type_name().into_owned();
        // NUL cannot be part of a Lua registry key we hand to C
        let clean: String = name.chars().filter(|c| *c != '\0').collect();
        Box::leak(Box::new(TypeTag {
            prototype: CString::new(format!("{clean}PtrPrototype")).unwrap_or_default(),
            metatable: CString::new(format!("{clean}PtrMetatable")).unwrap_or_default(),
            name: clean,
        }))
    })
}

/// Userdata payload of a handle
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct HandleCell {
    pub ptr: *mut c_void,
    pub tag: *const TypeTag,
}

/// Non-owning reference to a host object of type `T`
///
/// The bridge never frees or tracks the object. Whoever creates the handle
/// promises the object outlives every script-side use of it.
pub struct Handle<T> {
    ptr: NonNull<T>,
    _marker: PhantomData<*mut T>,
}

impl<T> Handle<T> {
    /// Handle to a live host object
    ///
    /// # Safety
    ///
    /// `object` must stay alive, and must not be moved, for as long as the
    /// script can reach the handle. While script code runs, no other Rust
    /// reference to `object` may be in use.
    pub unsafe fn from_mut(object: &mut T) -> Self {
        Self {
            ptr: NonNull::from(object),
            _marker: PhantomData,
        }
    }

    /// Handle from a raw pointer
    ///
    /// # Safety
    ///
    /// Same contract as [`Handle::from_mut`].
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// # Safety
    ///
    /// The object must still be alive and not mutably borrowed elsewhere.
    pub unsafe fn as_ref<'a>(&self) -> &'a T {
        &*self.ptr.as_ptr()
    }

    /// # Safety
    ///
    /// The object must still be alive and not borrowed elsewhere.
    pub unsafe fn as_mut<'a>(&mut self) -> &'a mut T {
        &mut *self.ptr.as_ptr()
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.ptr).finish()
    }
}

/// Type-erased handle read through [`crate::Value`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHandle {
    pub ptr: *mut c_void,
    pub type_name: String,
}

/// Push a handle userdata for `ptr` tagged as `T`
pub(crate) fn push_handle<T: Bindable>(stack: Stack<'_>, ptr: NonNull<T>) -> Result<()> {
    let tag = tag_of::<T>();
    let state = stack.as_ptr();
    stack.reserve(3)?;
    unsafe {
        if raw_registry_get(state, &tag.metatable) != ffi::LUA_TTABLE {
            ffi::lua_pop(state, 1);
            log::warn!("refusing to push handle of unregistered type '{}'", tag.name);
            return Err(BindError::UnregisteredType(tag.name.clone()));
        }
        ffi::lua_pushstring(state, TAG_KEY.as_ptr());
        ffi::lua_rawget(state, -2);
        let owner = ffi::lua_touserdata(state, -1);
        // the metatable stays below the new userdata
        ffi::lua_pop(state, 1);
        if owner != tag.as_light_ptr() {
            ffi::lua_pop(state, 1);
            // metatable name belongs to a different type
            return Err(BindError::UnregisteredType(tag.name.clone()));
        }

        let cell = ffi::lua_newuserdata(state, std::mem::size_of::<HandleCell>()) as *mut HandleCell;
        cell.write(HandleCell {
            ptr: ptr.as_ptr() as *mut c_void,
            tag: tag as *const TypeTag,
        });
        ffi::lua_rotate(state, -2, 1);
        ffi::lua_setmetatable(state, -2);
    }
    Ok(())
}

/// Validate the handle at `slot` and return its object pointer
pub(crate) fn check_handle<T: Bindable>(stack: Stack<'_>, slot: c_int) -> Result<NonNull<T>> {
    let tag = tag_of::<T>();
    let mismatch = || BindError::HandleMismatch {
        slot,
        expected: tag.name.clone(),
        got: stack.type_name_at(slot),
    };
    if stack.kind(slot) != ffi::LUA_TUSERDATA {
        return Err(mismatch());
    }
    stack.reserve(2)?;
    let state = stack.as_ptr();
    let cell = unsafe {
        if ffi::lua_getmetatable(state, slot) == 0 {
            return Err(mismatch());
        }
        raw_registry_get(state, &tag.metatable);
        let same = ffi::lua_rawequal(state, -1, -2) != 0;
        ffi::lua_pop(state, 2);
        if !same || ffi::lua_rawlen(state, slot) as usize != std::mem::size_of::<HandleCell>() {
            return Err(mismatch());
        }
        *(ffi::lua_touserdata(state, slot) as *const HandleCell)
    };
    if !std::ptr::eq(cell.tag, tag) {
        return Err(mismatch());
    }
    NonNull::new(cell.ptr as *mut T).ok_or_else(mismatch)
}

/// Read any bridge handle at `slot` without knowing its type
pub(crate) fn raw_handle_at(stack: Stack<'_>, slot: c_int) -> Option<RawHandle> {
    let state = stack.as_ptr();
    if stack.kind(slot) != ffi::LUA_TUSERDATA || stack.reserve(1).is_err() {
        return None;
    }
    unsafe {
        if ffi::luaL_getmetafield(state, slot, TAG_KEY.as_ptr()) == ffi::LUA_TNIL {
            return None;
        }
        let tag = ffi::lua_touserdata(state, -1) as *const TypeTag;
        ffi::lua_pop(state, 1);
        let cell = ffi::lua_touserdata(state, slot) as *const HandleCell;
        if tag.is_null() || cell.is_null() || !std::ptr::eq((*cell).tag, tag) {
            return None;
        }
        Some(RawHandle {
            ptr: (*cell).ptr,
            type_name: (*tag).name.clone(),
        })
    }
}

/// Default binding name: the Rust path with separators flattened to `_`
pub fn sanitize_type_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            ':' | '<' | '>' | ',' | ' ' => '_',
            other => other,
        })
        .collect()
}
