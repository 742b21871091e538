//! Per-runtime registry of bound types
//!
//! Each [`crate::LuaBridge`] owns one `TypeRegistry`. A type gets at most one
//! [`TypeBinding`] per registry. Registering it again is a no-op once its
//! prototype and metatable are installed.

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use mlua_sys as ffi;

use crate::bind::{Bindable, Members};
use crate::config::UnknownFieldPolicy;
use crate::error::{BindError, Result};
use crate::handle::{tag_of, TypeTag};
use crate::prototype;
use crate::stack::Stack;

/// Where a binding is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Unregistered,
    Registering,
    Registered,
}

/// How one type is exposed to scripts
pub struct TypeBinding {
    type_id: TypeId,
    tag: &'static TypeTag,
    pub(crate) methods: BTreeMap<String, ffi::lua_CFunction>,
    pub(crate) getters: BTreeMap<String, ffi::lua_CFunction>,
    pub(crate) setters: BTreeMap<String, ffi::lua_CFunction>,
    state: BindingState,
}

impl TypeBinding {
    fn new(type_id: TypeId, tag: &'static TypeTag) -> Self {
        Self {
            type_id,
            tag,
            methods: BTreeMap::new(),
            getters: BTreeMap::new(),
            setters: BTreeMap::new(),
            state: BindingState::Unregistered,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn name(&self) -> &str {
        self.tag.name()
    }

    pub fn prototype_name(&self) -> &str {
        self.tag.prototype_name()
    }

    pub fn metatable_name(&self) -> &str {
        self.tag.metatable_name()
    }

    pub(crate) fn tag(&self) -> &'static TypeTag {
        self.tag
    }

    pub fn state(&self) -> BindingState {
        self.state
    }

    pub fn is_registered(&self) -> bool {
        self.state == BindingState::Registered
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn getter_names(&self) -> impl Iterator<Item = &str> {
        self.getters.keys().map(String::as_str)
    }

    pub fn setter_names(&self) -> impl Iterator<Item = &str> {
        self.setters.keys().map(String::as_str)
    }

    pub(crate) fn getter(&self, name: &str) -> Option<ffi::lua_CFunction> {
        self.getters.get(name).copied()
    }

    pub(crate) fn setter(&self, name: &str) -> Option<ffi::lua_CFunction> {
        self.setters.get(name).copied()
    }

    fn fill<T: Bindable>(&mut self, members: Members<T>) -> Result<()> {
        let name = self.tag.name();
        self.methods = member_map(name, "method", members.methods)?;
        self.getters = member_map(name, "field", members.getters)?;
        self.setters = member_map(name, "field", members.setters)?;
        Ok(())
    }

    fn clear(&mut self) {
        self.methods.clear();
        self.getters.clear();
        self.setters.clear();
    }
}

fn member_map(
    type_name: &str,
    kind: &'static str,
    members: Vec<(&'static str, ffi::lua_CFunction)>,
) -> Result<BTreeMap<String, ffi::lua_CFunction>> {
    let mut map = BTreeMap::new();
    for (member, f) in members {
        if map.insert(member.to_string(), f).is_some() {
            return Err(BindError::DuplicateMember {
                type_name: type_name.to_string(),
                kind,
                member: member.to_string(),
            });
        }
    }
    Ok(map)
}

impl fmt::Debug for TypeBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeBinding")
            .field("name", &self.name())
            .field("state", &self.state)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("getters", &self.getters.keys().collect::<Vec<_>>())
            .field("setters", &self.setters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Registry of bound types, keyed by `TypeId`
#[derive(Default)]
pub struct TypeRegistry {
    bindings: HashMap<TypeId, TypeBinding>,
    /// Bound name to owning type, for collision detection
    names: HashMap<String, TypeId>,
}

impl TypeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T`, installing its prototype and metatable on first use
    pub(crate) fn register<T: Bindable>(
        &mut self,
        stack: Stack<'_>,
        policy: UnknownFieldPolicy,
    ) -> Result<()> {
        let type_id = TypeId::of::<T>();
        let tag = tag_of::<T>();
        let binding = self
            .bindings
            .entry(type_id)
            .or_insert_with(|| TypeBinding::new(type_id, tag));

        if binding.is_registered() {
            return Ok(());
        }

        if let Some(owner) = self.names.get(tag.name()) {
            if *owner != type_id {
                log::error!(
                    "Cannot register '{}': name already bound by another type",
                    tag.name()
                );
                return Err(BindError::MetatableCollision {
                    type_name: tag.name().to_string(),
                    metatable: tag.metatable_name().to_string(),
                });
            }
        }

        binding.state = BindingState::Registering;
        let outcome = binding
            .fill(Members::<T>::collect())
            .and_then(|()| prototype::install(stack, binding, policy));

        match outcome {
            Ok(()) => {
                binding.state = BindingState::Registered;
                self.names.insert(tag.name().to_string(), type_id);
                log::debug!(
                    "Registered type '{}' ({} methods, {} getters, {} setters)",
                    tag.name(),
                    binding.methods.len(),
                    binding.getters.len(),
                    binding.setters.len()
                );
                Ok(())
            }
            Err(err) => {
                binding.clear();
                binding.state = BindingState::Unregistered;
                log::error!("Failed to register type '{}': {}", tag.name(), err);
                Err(err)
            }
        }
    }

    /// Whether `T` has a registered binding
    pub fn is_registered<T: Bindable>(&self) -> bool {
        self.bindings
            .get(&TypeId::of::<T>())
            .is_some_and(TypeBinding::is_registered)
    }

    /// Binding of `T`, if one was ever attempted
    pub fn binding<T: Bindable>(&self) -> Option<&TypeBinding> {
        self.bindings.get(&TypeId::of::<T>())
    }

    /// Registered binding by bound name
    pub fn binding_by_name(&self, name: &str) -> Option<&TypeBinding> {
        self.names.get(name).and_then(|id| self.bindings.get(id))
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.bindings.values().filter(|b| b.is_registered()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over registered bindings
    pub fn iter(&self) -> impl Iterator<Item = &TypeBinding> {
        self.bindings.values().filter(|b| b.is_registered())
    }
}
