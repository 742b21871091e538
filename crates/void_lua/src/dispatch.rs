//! Trampolines that let Lua call into bound host members
//!
//! Every trampoline is a plain `extern "C-unwind"` function. It captures
//! nothing: the bound type and the member are generic parameters, so each
//! (type, member) pair gets its own monomorphized function pointer.
//!
//! Host work runs inside [`guarded`]. That converts errors and panics into a
//! [`BindError`]. The error is turned into a Lua error only after every Rust
//! value has been dropped, because `lua_error` does not unwind Rust frames.

use std::any::Any;
use std::os::raw::c_int;
use std::panic::{catch_unwind, AssertUnwindSafe};

use mlua_sys as ffi;

use crate::bind::{Bindable, Field, Method};
use crate::error::{BindError, Result};
use crate::handle::{check_handle, tag_of};
use crate::marshal::{FromArg, FromSlot, Push};
use crate::stack::Stack;

/// Sequential reader over the arguments of one trampoline call
///
/// Slot 1 holds the receiver. Arguments start at slot 2 and are read once,
/// in declaration order. Handle arguments are recorded so that the same
/// object cannot show up twice in one call.
pub struct ArgCursor<'a> {
    stack: Stack<'a>,
    next: c_int,
    claimed: Vec<*const ()>,
}

impl<'a> ArgCursor<'a> {
    pub(crate) fn new(stack: Stack<'a>, receiver: *const ()) -> Self {
        Self {
            stack,
            next: 2,
            claimed: vec![receiver],
        }
    }

    pub fn stack(&self) -> Stack<'a> {
        self.stack
    }

    /// Read the next argument
    ///
    /// # Safety
    ///
    /// See [`FromArg::from_arg`].
    pub unsafe fn next<A: FromArg>(&mut self) -> Result<A> {
        let slot = self.next;
        self.next += 1;
        A::from_arg(self, slot)
    }

    /// Record a handle argument, rejecting aliases
    pub(crate) fn claim(&mut self, ptr: *const (), slot: c_int) -> Result<()> {
        if self.claimed.contains(&ptr) {
            return Err(BindError::AliasedHandle { slot });
        }
        self.claimed.push(ptr);
        Ok(())
    }
}

/// Run `body`, turning panics into errors
pub(crate) fn guarded<F>(body: F) -> Result<c_int>
where
    F: FnOnce() -> Result<c_int>,
{
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(outcome) => outcome,
        Err(payload) => Err(BindError::Panic(panic_message(payload))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Return the result count, or raise the error in Lua
///
/// # Safety
///
/// Must be the last thing a trampoline does. Nothing with a destructor may be
/// alive in the calling frame.
pub(crate) unsafe fn finish(state: *mut ffi::lua_State, outcome: Result<c_int>) -> c_int {
    match outcome {
        Ok(count) => count,
        Err(err) => {
            push_message(state, err);
            ffi::lua_error(state)
        }
    }
}

/// Push the error text and drop every owned value before returning
unsafe fn push_message(state: *mut ffi::lua_State, err: BindError) {
    let message = err.to_string();
    drop(err);
    ffi::lua_pushlstring(state, message.as_ptr() as *const _, message.len());
}

/// Calls method `M` of `T`: `(self, args...) -> results`
pub(crate) unsafe extern "C-unwind" fn method_trampoline<T, M>(state: *mut ffi::lua_State) -> c_int
where
    T: Bindable,
    M: Method<T>,
{
    let outcome = guarded(|| unsafe {
        let stack = Stack::from_raw(state);
        let this = check_handle::<T>(stack, 1)?;
        let mut args = ArgCursor::new(stack, this.as_ptr() as *const ());
        M::invoke(this.as_ptr(), &mut args)
    })
    .map_err(|err| err.in_member(tag_of::<T>().name(), M::NAME));
    finish(state, outcome)
}

/// Reads field `F` of `T`: `(self) -> value`
pub(crate) unsafe extern "C-unwind" fn getter_trampoline<T, F>(state: *mut ffi::lua_State) -> c_int
where
    T: Bindable,
    F: Field<T>,
{
    let outcome = guarded(|| unsafe {
        let stack = Stack::from_raw(state);
        let this = check_handle::<T>(stack, 1)?;
        F::get(&*this.as_ptr()).push(stack)?;
        Ok(1)
    })
    .map_err(|err| err.in_member(tag_of::<T>().name(), F::NAME));
    finish(state, outcome)
}

/// Writes field `F` of `T`: `(self, value)`
pub(crate) unsafe extern "C-unwind" fn setter_trampoline<T, F>(state: *mut ffi::lua_State) -> c_int
where
    T: Bindable,
    F: Field<T>,
{
    let outcome = guarded(|| unsafe {
        let stack = Stack::from_raw(state);
        let this = check_handle::<T>(stack, 1)?;
        let value = F::Value::from_slot(stack, 2)?;
        F::set(&mut *this.as_ptr(), value);
        Ok(0)
    })
    .map_err(|err| err.in_member(tag_of::<T>().name(), F::NAME));
    finish(state, outcome)
}
