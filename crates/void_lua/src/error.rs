//! Error types for the Lua binding bridge

use std::borrow::Cow;
use std::fmt;
use std::os::raw::c_int;
use thiserror::Error;

use mlua_sys as ffi;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BindError>;

/// Status codes reported by the Lua runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallStatus {
    Ok,
    Yield,
    Runtime,
    Syntax,
    Memory,
    MessageHandler,
    File,
    Unknown(c_int),
}

/// `LUA_ERRFILE` lives in lauxlib as `LUA_ERRERR + 1`
const LUA_ERRFILE: c_int = ffi::LUA_ERRERR + 1;

impl CallStatus {
    /// Map a raw status returned by `lua_pcall` or a loader
    pub fn from_code(code: c_int) -> Self {
        match code {
            ffi::LUA_OK => CallStatus::Ok,
            ffi::LUA_YIELD => CallStatus::Yield,
            ffi::LUA_ERRRUN => CallStatus::Runtime,
            ffi::LUA_ERRSYNTAX => CallStatus::Syntax,
            ffi::LUA_ERRMEM => CallStatus::Memory,
            ffi::LUA_ERRERR => CallStatus::MessageHandler,
            LUA_ERRFILE => CallStatus::File,
            other => CallStatus::Unknown(other),
        }
    }

    /// The raw status code
    pub fn code(self) -> c_int {
        match self {
            CallStatus::Ok => ffi::LUA_OK,
            CallStatus::Yield => ffi::LUA_YIELD,
            CallStatus::Runtime => ffi::LUA_ERRRUN,
            CallStatus::Syntax => ffi::LUA_ERRSYNTAX,
            CallStatus::Memory => ffi::LUA_ERRMEM,
            CallStatus::MessageHandler => ffi::LUA_ERRERR,
            CallStatus::File => LUA_ERRFILE,
            CallStatus::Unknown(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == CallStatus::Ok
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStatus::Ok => write!(f, "ok"),
            CallStatus::Yield => write!(f, "coroutine yielded"),
            CallStatus::Runtime => write!(f, "runtime error"),
            CallStatus::Syntax => write!(f, "syntax error"),
            CallStatus::Memory => write!(f, "memory allocation error"),
            CallStatus::MessageHandler => write!(f, "error while running the message handler"),
            CallStatus::File => write!(f, "file error"),
            CallStatus::Unknown(code) => write!(f, "unknown status {code}"),
        }
    }
}

/// Errors that can occur while binding, marshalling or calling
#[derive(Debug, Error)]
pub enum BindError {
    /// Building the prototype or metatable failed
    #[error("Failed to build prototype for '{type_name}': {message}")]
    PrototypeConstruction {
        type_name: String,
        message: String,
    },

    /// The metatable name is already taken by something else
    #[error("Metatable '{metatable}' for '{type_name}' is already in use")]
    MetatableCollision {
        type_name: String,
        metatable: String,
    },

    /// Two members of one kind share a name
    #[error("Type '{type_name}' declares {kind} '{member}' more than once")]
    DuplicateMember {
        type_name: String,
        kind: &'static str,
        member: String,
    },

    /// A handle was pushed for a type that was never registered
    #[error("Type '{0}' is not registered")]
    UnregisteredType(String),

    /// Host-side field access with a name the type does not declare
    #[error("Type '{type_name}' has no field '{field}'")]
    UnknownField {
        type_name: String,
        field: String,
    },

    /// Global is missing or cannot be called
    #[error("Function '{name}' is not callable (found {found})")]
    FunctionNotFound {
        name: String,
        found: &'static str,
    },

    /// Global table is missing
    #[error("Table '{name}' not found (found {found})")]
    TableNotFound {
        name: String,
        found: &'static str,
    },

    /// A protected call returned a nonzero status
    #[error("Call to '{function}' failed ({status}): {message}")]
    Call {
        function: String,
        status: CallStatus,
        message: String,
    },

    /// Loading or running a chunk failed
    #[error("Failed to load '{chunk}' ({status}): {message}")]
    Load {
        chunk: String,
        status: CallStatus,
        message: String,
    },

    /// Stack slot holds the wrong kind of value
    #[error("Bad value at slot {slot}: expected {expected}, got {got}")]
    TypeMismatch {
        slot: c_int,
        expected: &'static str,
        got: String,
    },

    /// Userdata at a slot is not a handle of the expected type
    #[error("Bad handle at slot {slot}: expected {expected}, got {got}")]
    HandleMismatch {
        slot: c_int,
        expected: String,
        got: String,
    },

    /// The same object was passed twice where exclusive access is required
    #[error("Handle at slot {slot} aliases another argument of the same call")]
    AliasedHandle { slot: c_int },

    /// Number does not fit the requested integer type
    #[error("Value {value} out of range for {target}")]
    OutOfRange {
        value: String,
        target: &'static str,
    },

    /// String slot does not hold UTF-8
    #[error("String at slot {slot} is not valid UTF-8")]
    InvalidUtf8 { slot: c_int },

    /// Map lookup through the restricted view missed
    #[error("Key {0} not found")]
    KeyNotFound(String),

    /// Names handed to the runtime cannot contain NUL bytes
    #[error("Name '{0}' contains a NUL byte")]
    InteriorNul(String),

    /// `luaL_newstate` returned null
    #[error("Lua state could not be allocated")]
    StateAllocation,

    /// Lua could not grow its stack
    #[error("Stack overflow: cannot reserve {0} slots")]
    StackOverflow(c_int),

    /// A bound method or accessor failed
    #[error("{member}: {message}")]
    Member { member: String, message: String },

    /// A bound method returned an error
    #[error("{0}")]
    Host(String),

    /// A bound method panicked
    #[error("Panic in bound method: {0}")]
    Panic(String),

    /// Configuration could not be read
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BindError {
    /// Create a type mismatch error
    pub fn type_mismatch(slot: c_int, expected: &'static str, got: impl Into<String>) -> Self {
        BindError::TypeMismatch {
            slot,
            expected,
            got: got.into(),
        }
    }

    /// Create a prototype construction error
    pub fn prototype(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        BindError::PrototypeConstruction {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// Attach the owning member to an error raised inside a trampoline
    pub fn in_member(self, type_name: &str, member: &str) -> Self {
        match self {
            err @ BindError::Member { .. } => err,
            other => BindError::Member {
                member: format!("{type_name}.{member}"),
                message: other.to_string(),
            },
        }
    }

    /// The nonzero engine status this error reports
    pub fn status(&self) -> c_int {
        match self {
            BindError::Call { status, .. } | BindError::Load { status, .. } => status.code(),
            BindError::Io(_) => LUA_ERRFILE,
            BindError::StackOverflow(_) | BindError::StateAllocation => ffi::LUA_ERRMEM,
            _ => ffi::LUA_ERRRUN,
        }
    }

    /// Diagnostic text of a failed call or load
    ///
    /// Script-side failures report the engine's message; a missing callee
    /// reports the lookup failure itself.
    pub fn diagnostic(&self) -> Option<Cow<'_, str>> {
        match self {
            BindError::Call { message, .. } | BindError::Load { message, .. } => {
                Some(Cow::Borrowed(message))
            }
            BindError::FunctionNotFound { .. } | BindError::TableNotFound { .. } => {
                Some(Cow::Owned(self.to_string()))
            }
            _ => None,
        }
    }
}
