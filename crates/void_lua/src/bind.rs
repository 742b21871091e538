//! Declaring what a type exposes to scripts
//!
//! A [`Bindable`] type lists its members once, through [`Members`]. Each
//! member is a zero-sized marker type implementing [`Field`] or [`Method`].
//! [`bind_type!`](crate::bind_type) generates the markers and the
//! `Bindable` impl; hand-written impls work the same way.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;
use std::os::raw::c_int;

use mlua_sys as ffi;

use crate::dispatch::{getter_trampoline, method_trampoline, setter_trampoline, ArgCursor};
use crate::error::{BindError, Result};
use crate::handle::sanitize_type_name;
use crate::marshal::{FromArg, FromSlot, Push};

/// A host type that can be exposed to scripts through handles
pub trait Bindable: Sized + 'static {
    /// Name used to derive the prototype and metatable names
    fn type_name() -> Cow<'static, str> {
        Cow::Owned(sanitize_type_name(std::any::type_name::<Self>()))
    }

    /// Declare fields and methods
    fn describe(members: &mut Members<Self>);
}

/// A data member readable (and, unless declared read-only, writable) from scripts
pub trait Field<T>: 'static {
    const NAME: &'static str;
    type Value: Push + FromSlot;

    fn get(this: &T) -> Self::Value;
    fn set(this: &mut T, value: Self::Value);
}

/// A method callable from scripts as `obj:name(...)`
pub trait Method<T>: 'static {
    const NAME: &'static str;

    /// Read the arguments, call the method, push the results
    ///
    /// # Safety
    ///
    /// `this` points to a live `T` that nothing else borrows for the
    /// duration of the call.
    unsafe fn invoke(this: *mut T, args: &mut ArgCursor<'_>) -> Result<c_int>;
}

/// Member tables collected from [`Bindable::describe`]
pub struct Members<T> {
    pub(crate) methods: Vec<(&'static str, ffi::lua_CFunction)>,
    pub(crate) getters: Vec<(&'static str, ffi::lua_CFunction)>,
    pub(crate) setters: Vec<(&'static str, ffi::lua_CFunction)>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Bindable> Members<T> {
    pub(crate) fn collect() -> Self {
        let mut members = Self {
            methods: Vec::new(),
            getters: Vec::new(),
            setters: Vec::new(),
            _marker: PhantomData,
        };
        T::describe(&mut members);
        members
    }

    /// Field with a getter and a setter
    pub fn field<F: Field<T>>(&mut self) -> &mut Self {
        self.getters.push((F::NAME, getter_trampoline::<T, F>));
        self.setters.push((F::NAME, setter_trampoline::<T, F>));
        self
    }

    /// Field with a getter only; script writes follow the unknown-field policy
    pub fn readonly<F: Field<T>>(&mut self) -> &mut Self {
        self.getters.push((F::NAME, getter_trampoline::<T, F>));
        self
    }

    pub fn method<M: Method<T>>(&mut self) -> &mut Self {
        self.methods.push((M::NAME, method_trampoline::<T, M>));
        self
    }
}

/// Restricted map view: only `at(key)` is exposed
pub struct MapAt;

impl<K, V> Method<HashMap<K, V>> for MapAt
where
    K: FromArg + Eq + Hash + Debug + 'static,
    V: Push + Clone + 'static,
{
    const NAME: &'static str = "at";

    unsafe fn invoke(this: *mut HashMap<K, V>, args: &mut ArgCursor<'_>) -> Result<c_int> {
        let key = args.next::<K>()?;
        let stack = args.stack();
        match (*this).get(&key) {
            Some(value) => {
                value.clone().push(stack)?;
                Ok(1)
            }
            None => Err(BindError::KeyNotFound(format!("{key:?}"))),
        }
    }
}

impl<K, V> Method<BTreeMap<K, V>> for MapAt
where
    K: FromArg + Ord + Debug + 'static,
    V: Push + Clone + 'static,
{
    const NAME: &'static str = "at";

    unsafe fn invoke(this: *mut BTreeMap<K, V>, args: &mut ArgCursor<'_>) -> Result<c_int> {
        let key = args.next::<K>()?;
        let stack = args.stack();
        match (*this).get(&key) {
            Some(value) => {
                value.clone().push(stack)?;
                Ok(1)
            }
            None => Err(BindError::KeyNotFound(format!("{key:?}"))),
        }
    }
}

impl<K, V> Bindable for HashMap<K, V>
where
    K: FromArg + Eq + Hash + Debug + 'static,
    V: Push + Clone + 'static,
{
    fn describe(members: &mut Members<Self>) {
        members.method::<MapAt>();
    }
}

impl<K, V> Bindable for BTreeMap<K, V>
where
    K: FromArg + Ord + Debug + 'static,
    V: Push + Clone + 'static,
{
    fn describe(members: &mut Members<Self>) {
        members.method::<MapAt>();
    }
}

/// Expose a struct's fields and methods to scripts
///
/// ```ignore
/// bind_type! {
///     Record {
///         fields { a: f64, label: String }
///         readonly { id: u32 }
///         methods {
///             fn scale(&mut self, factor: f64);
///             fn describe(&self) -> String;
///         }
///     }
/// }
///
/// // generic or renamed types
/// bind_type! { Wrapper<f64> as "WrapperF64" => { fields { inner: f64 } } }
/// ```
///
/// Every section is optional; sections must appear in the order shown.
/// Field types need [`Push`] + [`FromSlot`] and `Clone`. Method arguments
/// need [`FromArg`](crate::FromArg), which includes `&T`/`&mut T` of bound
/// types. Results need [`IntoReturns`](crate::IntoReturns).
#[macro_export]
macro_rules! bind_type {
    ($ty:ident { $($body:tt)* }) => {
        $crate::__bind_type_impl! { [$ty] [stringify!($ty)] $($body)* }
    };
    ($ty:ty as $name:expr => { $($body:tt)* }) => {
        $crate::__bind_type_impl! { [$ty] [$name] $($body)* }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __bind_type_impl {
    (
        [$ty:ty] [$name:expr]
        $(fields { $($field:ident : $fty:ty),* $(,)? })?
        $(readonly { $($ro:ident : $roty:ty),* $(,)? })?
        $(methods {
            $(fn $method:ident (& $(mut)? self $(, $arg:ident : $argty:ty)* $(,)?) $(-> $ret:ty)?;)*
        })?
    ) => {
        const _: () = {
            #[allow(non_camel_case_types, dead_code)]
            mod __fields {
                $($(pub struct $field;)*)?
                $($(pub struct $ro;)*)?
            }

            #[allow(non_camel_case_types, dead_code)]
            mod __methods {
                $($(pub struct $method;)*)?
            }

            $($(
                impl $crate::Field<$ty> for __fields::$field {
                    const NAME: &'static str = stringify!($field);
                    type Value = $fty;

                    fn get(this: &$ty) -> $fty {
                        ::core::clone::Clone::clone(&this.$field)
                    }

                    fn set(this: &mut $ty, value: $fty) {
                        this.$field = value;
                    }
                }
            )*)?

            $($(
                impl $crate::Field<$ty> for __fields::$ro {
                    const NAME: &'static str = stringify!($ro);
                    type Value = $roty;

                    fn get(this: &$ty) -> $roty {
                        ::core::clone::Clone::clone(&this.$ro)
                    }

                    fn set(this: &mut $ty, value: $roty) {
                        this.$ro = value;
                    }
                }
            )*)?

            $($(
                impl $crate::Method<$ty> for __methods::$method {
                    const NAME: &'static str = stringify!($method);

                    #[allow(clippy::let_unit_value, unused_variables)]
                    unsafe fn invoke(
                        this: *mut $ty,
                        args: &mut $crate::ArgCursor<'_>,
                    ) -> $crate::Result<::std::os::raw::c_int> {
                        $(let $arg = unsafe { args.next::<$argty>() }?;)*
                        let ret = unsafe { (*this).$method($($arg),*) };
                        $crate::IntoReturns::push_returns(ret, args.stack())
                    }
                }
            )*)?

            impl $crate::Bindable for $ty {
                fn type_name() -> ::std::borrow::Cow<'static, str> {
                    ::std::borrow::Cow::Borrowed($name)
                }

                fn describe(members: &mut $crate::Members<Self>) {
                    $($(members.field::<__fields::$field>();)*)?
                    $($(members.readonly::<__fields::$ro>();)*)?
                    $($(members.method::<__methods::$method>();)*)?
                }
            }
        };
    };
}
