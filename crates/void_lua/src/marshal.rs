//! Value marshalling between host types and the Lua stack
//!
//! Each direction has its own trait:
//!
//! - [`Push`] puts exactly one value on the stack.
//! - [`FromSlot`] reads one owned value from a slot.
//! - [`FromArg`] reads a trampoline argument. Borrowed handles (`&T`, `&mut T`) are allowed here.
//! - [`IntoArgs`] pushes an argument tuple for a host-to-script call.
//! - [`FromReturns`] extracts the results of a host-to-script call.
//! - [`IntoReturns`] pushes a bound method's result back to the script.

use std::fmt::Display;
use std::os::raw::c_int;
use std::ptr::NonNull;

use mlua_sys as ffi;

use crate::bind::Bindable;
use crate::dispatch::ArgCursor;
use crate::error::{BindError, Result};
use crate::handle::{check_handle, push_handle, raw_handle_at, Handle};
use crate::stack::Stack;
use crate::value::Value;

/// Places one value on top of the stack
pub trait Push {
    fn push(self, stack: Stack<'_>) -> Result<()>;
}

/// Reads one owned value from a stack slot without removing it
pub trait FromSlot: Sized {
    fn from_slot(stack: Stack<'_>, slot: c_int) -> Result<Self>;
}

/// Reads one argument of a bound method
pub trait FromArg: Sized {
    /// # Safety
    ///
    /// Borrowed handle arguments get an unbounded lifetime. The caller must
    /// not let them escape the current trampoline invocation.
    unsafe fn from_arg(args: &mut ArgCursor<'_>, slot: c_int) -> Result<Self>;
}

/// Arguments of a host-to-script call, pushed left to right
pub trait IntoArgs {
    const COUNT: c_int;
    fn push_args(self, stack: Stack<'_>) -> Result<()>;
}

/// Results of a host-to-script call
pub trait FromReturns: Sized {
    /// Number of values the call is asked to produce
    const COUNT: c_int;
    fn extract(stack: Stack<'_>) -> Result<Self>;
}

/// Result of a bound method, pushed for the script
pub trait IntoReturns {
    /// Push the values and report how many were pushed
    fn push_returns(self, stack: Stack<'_>) -> Result<c_int>;
}

/// Marker for "no result"; pops nothing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ignored;

// ========== Numbers ==========

fn number_at(stack: Stack<'_>, slot: c_int) -> Result<f64> {
    if !stack.is_valid(slot) {
        return Err(BindError::type_mismatch(slot, "number", "no value"));
    }
    let mut isnum: c_int = 0;
    let n = unsafe { ffi::lua_tonumberx(stack.as_ptr(), slot, &mut isnum) };
    if isnum == 0 {
        return Err(BindError::type_mismatch(slot, "number", stack.type_name_at(slot)));
    }
    Ok(n)
}

/// Integer at `slot`, widened so every Rust integer target can range-check it
///
/// Lua integers convert exactly. Floats truncate toward zero, which also
/// covers unsigned values above `i64::MAX` that were pushed as floats.
fn integer_at(stack: Stack<'_>, slot: c_int, target: &'static str) -> Result<i128> {
    if !stack.is_valid(slot) {
        return Err(BindError::type_mismatch(slot, "number", "no value"));
    }
    let mut isint: c_int = 0;
    let n = unsafe { ffi::lua_tointegerx(stack.as_ptr(), slot, &mut isint) };
    if isint != 0 {
        return Ok(i128::from(n));
    }
    let float = number_at(stack, slot)?;
    let truncated = float.trunc();
    // every integer target fits well inside +-2^127
    if !truncated.is_finite() || truncated.abs() >= 2f64.powi(127) {
        return Err(BindError::OutOfRange {
            value: float.to_string(),
            target,
        });
    }
    Ok(truncated as i128)
}

macro_rules! impl_float {
    ($($ty:ty),*) => {
        $(
            impl Push for $ty {
                fn push(self, stack: Stack<'_>) -> Result<()> {
                    stack.reserve(1)?;
                    unsafe { ffi::lua_pushnumber(stack.as_ptr(), self as ffi::lua_Number) };
                    Ok(())
                }
            }

            impl FromSlot for $ty {
                fn from_slot(stack: Stack<'_>, slot: c_int) -> Result<Self> {
                    Ok(number_at(stack, slot)? as $ty)
                }
            }
        )*
    };
}

macro_rules! impl_integer {
    ($($ty:ty),*) => {
        $(
            impl Push for $ty {
                #[allow(irrefutable_let_patterns)]
                fn push(self, stack: Stack<'_>) -> Result<()> {
                    stack.reserve(1)?;
                    unsafe {
                        if let Ok(n) = ffi::lua_Integer::try_from(self) {
                            ffi::lua_pushinteger(stack.as_ptr(), n);
                        } else {
                            ffi::lua_pushnumber(stack.as_ptr(), self as ffi::lua_Number);
                        }
                    }
                    Ok(())
                }
            }

            impl FromSlot for $ty {
                fn from_slot(stack: Stack<'_>, slot: c_int) -> Result<Self> {
                    let n = integer_at(stack, slot, stringify!($ty))?;
                    <$ty>::try_from(n).map_err(|_| BindError::OutOfRange {
                        value: n.to_string(),
                        target: stringify!($ty),
                    })
                }
            }
        )*
    };
}

impl_float!(f32, f64);
impl_integer!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

// ========== Booleans and strings ==========

impl Push for bool {
    fn push(self, stack: Stack<'_>) -> Result<()> {
        stack.reserve(1)?;
        unsafe { ffi::lua_pushboolean(stack.as_ptr(), self as c_int) };
        Ok(())
    }
}

impl FromSlot for bool {
    /// Lua truthiness: only `nil` and `false` are false; a missing slot reads as false
    fn from_slot(stack: Stack<'_>, slot: c_int) -> Result<Self> {
        if !stack.is_valid(slot) {
            return Ok(false);
        }
        Ok(unsafe { ffi::lua_toboolean(stack.as_ptr(), slot) } != 0)
    }
}

impl Push for &str {
    fn push(self, stack: Stack<'_>) -> Result<()> {
        stack.reserve(1)?;
        unsafe { ffi::lua_pushlstring(stack.as_ptr(), self.as_ptr() as *const _, self.len()) };
        Ok(())
    }
}

impl Push for String {
    fn push(self, stack: Stack<'_>) -> Result<()> {
        self.as_str().push(stack)
    }
}

impl Push for &String {
    fn push(self, stack: Stack<'_>) -> Result<()> {
        self.as_str().push(stack)
    }
}

impl FromSlot for String {
    fn from_slot(stack: Stack<'_>, slot: c_int) -> Result<Self> {
        let kind = stack.kind(slot);
        if kind != ffi::LUA_TSTRING && kind != ffi::LUA_TNUMBER {
            return Err(BindError::type_mismatch(slot, "string", stack.type_name_at(slot)));
        }
        // The bytes are copied before anything else can touch the stack.
        let bytes = unsafe {
            let mut len = 0usize;
            let ptr = ffi::lua_tolstring(stack.as_ptr(), slot, &mut len);
            std::slice::from_raw_parts(ptr as *const u8, len).to_vec()
        };
        String::from_utf8(bytes).map_err(|_| BindError::InvalidUtf8 { slot })
    }
}

// ========== Option, handles, dynamic values ==========

impl<T: Push> Push for Option<T> {
    fn push(self, stack: Stack<'_>) -> Result<()> {
        match self {
            Some(value) => value.push(stack),
            None => {
                stack.reserve(1)?;
                unsafe { ffi::lua_pushnil(stack.as_ptr()) };
                Ok(())
            }
        }
    }
}

impl<T: FromSlot> FromSlot for Option<T> {
    fn from_slot(stack: Stack<'_>, slot: c_int) -> Result<Self> {
        let kind = stack.kind(slot);
        if kind == ffi::LUA_TNIL || kind == ffi::LUA_TNONE {
            return Ok(None);
        }
        T::from_slot(stack, slot).map(Some)
    }
}

impl<T: Bindable> Push for Handle<T> {
    fn push(self, stack: Stack<'_>) -> Result<()> {
        // SAFETY: a Handle always holds a non-null pointer.
        push_handle::<T>(stack, unsafe { NonNull::new_unchecked(self.as_ptr()) })
    }
}

impl<T: Bindable> FromSlot for Handle<T> {
    fn from_slot(stack: Stack<'_>, slot: c_int) -> Result<Self> {
        let ptr = check_handle::<T>(stack, slot)?;
        Ok(unsafe { Handle::from_raw(ptr) })
    }
}

impl Push for Value {
    fn push(self, stack: Stack<'_>) -> Result<()> {
        stack.reserve(1)?;
        let state = stack.as_ptr();
        match self {
            Value::Ignored => unsafe { ffi::lua_pushnil(state) },
            Value::Bool(b) => return b.push(stack),
            Value::Number(n) => return n.push(stack),
            Value::String(s) => return s.push(stack),
            Value::Handle(handle) => {
                return Err(BindError::type_mismatch(
                    -1,
                    "pushable value",
                    format!("untyped handle of '{}'", handle.type_name),
                ))
            }
            Value::Tuple(values) => {
                return Err(BindError::type_mismatch(
                    -1,
                    "single value",
                    format!("tuple of {}", values.len()),
                ))
            }
        }
        Ok(())
    }
}

impl FromSlot for Value {
    fn from_slot(stack: Stack<'_>, slot: c_int) -> Result<Self> {
        let kind = stack.kind(slot);
        match kind {
            ffi::LUA_TNIL | ffi::LUA_TNONE => Ok(Value::Ignored),
            ffi::LUA_TBOOLEAN => bool::from_slot(stack, slot).map(Value::Bool),
            ffi::LUA_TNUMBER => f64::from_slot(stack, slot).map(Value::Number),
            ffi::LUA_TSTRING => String::from_slot(stack, slot).map(Value::String),
            ffi::LUA_TUSERDATA => raw_handle_at(stack, slot)
                .map(Value::Handle)
                .ok_or_else(|| BindError::type_mismatch(slot, "bridge handle", stack.type_name_at(slot))),
            _ => Err(BindError::type_mismatch(slot, "scalar value", stack.type_name_at(slot))),
        }
    }
}

// ========== Arguments, results ==========

macro_rules! impl_single_value {
    ($($ty:ty),*) => {
        $(
            impl FromArg for $ty {
                unsafe fn from_arg(args: &mut ArgCursor<'_>, slot: c_int) -> Result<Self> {
                    <$ty as FromSlot>::from_slot(args.stack(), slot)
                }
            }

            impl FromReturns for $ty {
                const COUNT: c_int = 1;
                fn extract(stack: Stack<'_>) -> Result<Self> {
                    stack.pop::<$ty>()
                }
            }

            impl IntoReturns for $ty {
                fn push_returns(self, stack: Stack<'_>) -> Result<c_int> {
                    self.push(stack)?;
                    Ok(1)
                }
            }
        )*
    };
}

impl_single_value!(f32, f64, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, bool, String, Value);

impl<T: FromSlot> FromArg for Option<T> {
    unsafe fn from_arg(args: &mut ArgCursor<'_>, slot: c_int) -> Result<Self> {
        Option::<T>::from_slot(args.stack(), slot)
    }
}

impl<T: FromSlot> FromReturns for Option<T> {
    const COUNT: c_int = 1;
    fn extract(stack: Stack<'_>) -> Result<Self> {
        stack.pop::<Option<T>>()
    }
}

impl<T: Push> IntoReturns for Option<T> {
    fn push_returns(self, stack: Stack<'_>) -> Result<c_int> {
        self.push(stack)?;
        Ok(1)
    }
}

impl<T: Bindable> FromArg for Handle<T> {
    unsafe fn from_arg(args: &mut ArgCursor<'_>, slot: c_int) -> Result<Self> {
        Handle::<T>::from_slot(args.stack(), slot)
    }
}

impl<T: Bindable> FromReturns for Handle<T> {
    const COUNT: c_int = 1;
    fn extract(stack: Stack<'_>) -> Result<Self> {
        stack.pop::<Handle<T>>()
    }
}

impl<T: Bindable> IntoReturns for Handle<T> {
    fn push_returns(self, stack: Stack<'_>) -> Result<c_int> {
        self.push(stack)?;
        Ok(1)
    }
}

impl<'a, T: Bindable> FromArg for &'a T {
    unsafe fn from_arg(args: &mut ArgCursor<'_>, slot: c_int) -> Result<Self> {
        let ptr = check_handle::<T>(args.stack(), slot)?;
        args.claim(ptr.as_ptr() as *const (), slot)?;
        Ok(&*ptr.as_ptr())
    }
}

impl<'a, T: Bindable> FromArg for &'a mut T {
    unsafe fn from_arg(args: &mut ArgCursor<'_>, slot: c_int) -> Result<Self> {
        let ptr = check_handle::<T>(args.stack(), slot)?;
        args.claim(ptr.as_ptr() as *const (), slot)?;
        Ok(&mut *ptr.as_ptr())
    }
}

impl IntoReturns for &str {
    fn push_returns(self, stack: Stack<'_>) -> Result<c_int> {
        self.push(stack)?;
        Ok(1)
    }
}

impl IntoReturns for () {
    fn push_returns(self, _stack: Stack<'_>) -> Result<c_int> {
        Ok(0)
    }
}

impl<T: IntoReturns, E: Display> IntoReturns for std::result::Result<T, E> {
    fn push_returns(self, stack: Stack<'_>) -> Result<c_int> {
        match self {
            Ok(value) => value.push_returns(stack),
            Err(err) => Err(BindError::Host(err.to_string())),
        }
    }
}

impl FromReturns for () {
    const COUNT: c_int = 0;
    fn extract(_stack: Stack<'_>) -> Result<Self> {
        Ok(())
    }
}

impl FromReturns for Ignored {
    const COUNT: c_int = 0;
    fn extract(_stack: Stack<'_>) -> Result<Self> {
        Ok(Ignored)
    }
}

impl<A: FromSlot, B: FromSlot> FromReturns for (A, B) {
    const COUNT: c_int = 2;
    /// The last result sits on top, so B comes off first.
    fn extract(stack: Stack<'_>) -> Result<Self> {
        let b = stack.pop::<B>()?;
        let a = stack.pop::<A>()?;
        Ok((a, b))
    }
}

impl<A: FromSlot, B: FromSlot, C: FromSlot> FromReturns for (A, B, C) {
    const COUNT: c_int = 3;
    fn extract(stack: Stack<'_>) -> Result<Self> {
        let c = stack.pop::<C>()?;
        let b = stack.pop::<B>()?;
        let a = stack.pop::<A>()?;
        Ok((a, b, c))
    }
}

impl<A: Push, B: Push> IntoReturns for (A, B) {
    fn push_returns(self, stack: Stack<'_>) -> Result<c_int> {
        stack.reserve(2)?;
        self.0.push(stack)?;
        self.1.push(stack)?;
        Ok(2)
    }
}

impl<A: Push, B: Push, C: Push> IntoReturns for (A, B, C) {
    fn push_returns(self, stack: Stack<'_>) -> Result<c_int> {
        stack.reserve(3)?;
        self.0.push(stack)?;
        self.1.push(stack)?;
        self.2.push(stack)?;
        Ok(3)
    }
}

impl IntoArgs for () {
    const COUNT: c_int = 0;
    fn push_args(self, _stack: Stack<'_>) -> Result<()> {
        Ok(())
    }
}

macro_rules! impl_into_args {
    ($count:literal => $($name:ident),+) => {
        #[allow(non_snake_case)]
        impl<$($name: Push),+> IntoArgs for ($($name,)+) {
            const COUNT: c_int = $count;
            fn push_args(self, stack: Stack<'_>) -> Result<()> {
                stack.reserve($count)?;
                let ($($name,)+) = self;
                $($name.push(stack)?;)+
                Ok(())
            }
        }
    };
}

impl_into_args!(1 => A);
impl_into_args!(2 => A, B);
impl_into_args!(3 => A, B, C);
impl_into_args!(4 => A, B, C, D);
impl_into_args!(5 => A, B, C, D, E);
impl_into_args!(6 => A, B, C, D, E, F);
impl_into_args!(7 => A, B, C, D, E, F, G);
impl_into_args!(8 => A, B, C, D, E, F, G, H);
