//! # void_lua - Reflection-Driven Lua Bindings
//!
//! Exposes host types to an embedded Lua 5.4 runtime without per-type glue.
//! A type declares its fields and methods once; on first registration the
//! bridge builds a prototype, a metatable and one trampoline per member.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │   bind_type!    │────▶│    Bindable     │
//! │ (fields/methods)│     │  (Members<T>)   │
//! └─────────────────┘     └────────┬────────┘
//!                                  │ register::<T>()
//!                                  ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │  TypeRegistry   │────▶│   prototype +   │
//! │ (per LuaBridge) │     │   metatable     │
//! └────────┬────────┘     └────────┬────────┘
//!          │                       │ __index / __newindex
//!          ▼                       ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │   LuaBridge     │     │  trampolines    │ ◀── Lua calls obj:method()
//! │ call / fields   │     │ (ArgCursor)     │
//! └────────┬────────┘     └────────┬────────┘
//!          │                       │
//!          ▼                       ▼
//! ┌─────────────────────────────────────────┐
//! │   marshal: Push / FromSlot / FromArg    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use void_lua::prelude::*;
//!
//! struct Record { a: f64, b: f64 }
//!
//! impl Record {
//!     fn sum(&self) -> f64 { self.a + self.b }
//! }
//!
//! bind_type! {
//!     Record {
//!         fields { a: f64, b: f64 }
//!         methods { fn sum(&self) -> f64; }
//!     }
//! }
//!
//! let mut lua = LuaBridge::new()?;
//! lua.register::<Record>()?;
//! lua.exec("function bump(r) r.a = r.a + 1; return r:sum() end")?;
//!
//! let mut record = Record { a: 1.0, b: 2.0 };
//! let handle = unsafe { Handle::from_mut(&mut record) };
//! let sum: f64 = lua.call("bump", (handle,))?;
//! assert_eq!(sum, 4.0);
//! ```
//!
//! ## Script Side
//!
//! ```lua
//! function bump(r)
//!     r.a = r.a + 1       -- setter trampoline
//!     r.unknown = 5       -- ignored (or an error, see UnknownFieldPolicy)
//!     return r:sum()      -- method trampoline
//! end
//! ```

mod bind;
mod bridge;
mod config;
mod dispatch;
mod error;
mod handle;
mod marshal;
mod prototype;
mod registry;
mod stack;
mod value;

pub use bind::{Bindable, Field, MapAt, Members, Method};
pub use bridge::LuaBridge;
pub use config::{BridgeConfig, UnknownFieldPolicy};
pub use dispatch::ArgCursor;
pub use error::{BindError, CallStatus, Result};
pub use handle::{sanitize_type_name, tag_of, Handle, RawHandle, TypeTag};
pub use marshal::{FromArg, FromReturns, FromSlot, Ignored, IntoArgs, IntoReturns, Push};
pub use registry::{BindingState, TypeBinding, TypeRegistry};
pub use stack::{LuaState, Stack};
pub use value::Value;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bind::{Bindable, Members};
    pub use crate::bind_type;
    pub use crate::bridge::LuaBridge;
    pub use crate::config::{BridgeConfig, UnknownFieldPolicy};
    pub use crate::error::{BindError, CallStatus, Result};
    pub use crate::handle::Handle;
    pub use crate::marshal::Ignored;
    pub use crate::value::Value;
}
