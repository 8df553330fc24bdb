//! The type registry.
//!
//! A [`Registry`] maps a stable type name to a [`TypeDescriptor`]: how to build an instance
//! from a field map, how to flatten one back, and, for externalizable types, how to compute its
//! identity. The dehydrator looks descriptors up by runtime [`TypeId`]; the hydrator looks them
//! up by the `$type` name stored in the record.
//!
//! Types get into the registry through [`Serializable`] (usually derived) and
//! [`Registry::register`], or through a hand-assembled descriptor:
//!
//! ```rust
//! use rehydrate::{Registry, Serializable, TypeDescriptor};
//!
//! #[derive(Debug, Clone, Default, Serializable)]
//! struct Point {
//!     x: i64,
//!     y: i64,
//! }
//!
//! let registry = Registry::new();
//! registry.register_descriptor(
//!     TypeDescriptor::builder::<Point>()
//!         .construct_with(|_| Ok(Point { x: 0, y: 0 }))
//!         .build(),
//! );
//! assert!(registry.resolve("Point").is_ok());
//! assert!(registry.resolve("Pointer").is_err());
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, LazyLock, RwLock};

use tracing::{trace, warn};

use crate::error::{RehydrateError, Result};
use crate::metadata::{MetadataStore, Overrides, PropertyOverride};
use crate::value::{AnyBox, Fields, ObjectRef};

/// Type-erased constructor.
pub type ConstructFn = Arc<dyn Fn(&Fields) -> Result<AnyBox> + Send + Sync>;
/// Type-erased second pass run on a freshly constructed instance.
pub type FinishFn =
    Arc<dyn Fn(&mut (dyn Any + Send + Sync), &Fields) -> Result<()> + Send + Sync>;
/// Type-erased flattening of an instance into its fields.
pub type FlattenFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Result<Fields> + Send + Sync>;
/// Type-erased identity of an instance.
pub type IdentityFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Result<String> + Send + Sync>;

/// A type that can be flattened into a field map and rebuilt from one.
///
/// Implemented by `#[derive(Serializable)]`; a manual implementation is only needed for types
/// whose fields do not map one to one onto their stored properties.
pub trait Serializable: Any + Send + Sync + Sized {
    /// Stable name written into the `$type` key.
    const TYPE_NAME: &'static str;

    /// Shallow copy of the instance's persisted properties.
    fn flatten(&self) -> Result<Fields>;

    /// Builds an instance from a complete field map.
    fn construct(fields: &Fields) -> Result<Self>;

    /// Copies every property present in `fields` onto `self`.
    fn assign(&mut self, fields: &Fields) -> Result<()>;

    /// The descriptor registered by [`Registry::register`].
    fn describe() -> TypeDescriptor {
        TypeDescriptor::of::<Self>()
    }

    /// Property overrides declared on the type itself.
    fn property_overrides() -> Vec<(&'static str, PropertyOverride)> {
        Vec::new()
    }
}

/// A type whose instances carry a stable identity and are stored as standalone records.
pub trait Identified {
    /// Identity of this instance. Must not change while the instance is persisted.
    fn identity(&self) -> String;
}

/// Construction and flattening metadata of one registered type.
pub struct TypeDescriptor {
    name: String,
    type_id: TypeId,
    constructors: Vec<ConstructFn>,
    finish: Option<FinishFn>,
    flatten: FlattenFn,
    identity: Option<IdentityFn>,
    overrides: Vec<(String, PropertyOverride)>,
}

impl TypeDescriptor {
    /// Descriptor with the derived construction and flattening of `T`.
    pub fn of<T: Serializable>() -> Self {
        Self::builder::<T>().build()
    }

    /// Starts a descriptor for `T` whose hooks can be replaced.
    pub fn builder<T: Serializable>() -> DescriptorBuilder<T> {
        DescriptorBuilder {
            name: T::TYPE_NAME.to_owned(),
            construct: None,
            finish: None,
            flatten: erase_flatten(T::flatten),
            identity: None,
            _marker: PhantomData,
        }
    }

    /// Registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runtime type of the instances this descriptor builds.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Returns true if instances are stored as standalone records.
    pub fn is_externalizable(&self) -> bool {
        self.identity.is_some()
    }

    /// Builds an instance: first successful constructor, then the finish pass.
    pub fn instantiate(&self, fields: &Fields) -> Result<AnyBox> {
        let mut instance = self.construct(fields)?;
        if let Some(finish) = &self.finish {
            finish(&mut *instance, fields)?;
        }
        Ok(instance)
    }

    fn construct(&self, fields: &Fields) -> Result<AnyBox> {
        let mut last_error = None;
        for (index, constructor) in self.constructors.iter().enumerate() {
            match constructor(fields) {
                Ok(instance) => return Ok(instance),
                Err(err) if index + 1 < self.constructors.len() => {
                    warn!(
                        type_name = %self.name,
                        error = %err,
                        "custom constructor failed, falling back"
                    );
                    last_error = Some(err);
                }
                Err(err) => last_error = Some(err),
            }
        }
        Err(match last_error {
            Some(err @ RehydrateError::Construction { .. }) => err,
            Some(err) => RehydrateError::construction(&self.name, err),
            None => RehydrateError::construction(&self.name, "no constructor registered"),
        })
    }

    /// Flattens the instance stored in `object`.
    pub fn flatten(&self, object: &ObjectRef) -> Result<Fields> {
        object.with(|instance| (self.flatten)(instance))?
    }

    /// Identity of the instance stored in `object`; `None` for inline types.
    pub fn identity(&self, object: &ObjectRef) -> Result<Option<String>> {
        match &self.identity {
            Some(identity) => object.with(|instance| identity(instance))?.map(Some),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("constructors", &self.constructors.len())
            .field("finish", &self.finish.is_some())
            .field("externalizable", &self.is_externalizable())
            .finish_non_exhaustive()
    }
}

/// Builder for a [`TypeDescriptor`] of `T`.
///
/// A custom constructor is tried first and the derived one is kept as fallback. When a custom
/// constructor is given without a finish hook, the finish hook defaults to
/// [`Serializable::assign`], so properties the constructor ignored are still copied.
pub struct DescriptorBuilder<T> {
    name: String,
    construct: Option<ConstructFn>,
    finish: Option<FinishFn>,
    flatten: FlattenFn,
    identity: Option<IdentityFn>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serializable> DescriptorBuilder<T> {
    /// Registers the type under `name` instead of [`Serializable::TYPE_NAME`].
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Custom constructor, tried before the derived one.
    pub fn construct_with<F>(mut self, construct: F) -> Self
    where
        F: Fn(&Fields) -> Result<T> + Send + Sync + 'static,
    {
        self.construct = Some(Arc::new(move |fields: &Fields| {
            construct(fields).map(|instance| Box::new(instance) as AnyBox)
        }));
        self
    }

    /// Second pass run after construction.
    pub fn finish_with<F>(mut self, finish: F) -> Self
    where
        F: Fn(&mut T, &Fields) -> Result<()> + Send + Sync + 'static,
    {
        self.finish = Some(erase_finish(finish));
        self
    }

    /// Replaces the derived flattening.
    pub fn flatten_with<F>(mut self, flatten: F) -> Self
    where
        F: Fn(&T) -> Result<Fields> + Send + Sync + 'static,
    {
        self.flatten = erase_flatten(flatten);
        self
    }

    /// Makes the type externalizable with the given identity function.
    pub fn identity_with<F>(mut self, identity: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        self.identity = Some(Arc::new(move |instance: &(dyn Any + Send + Sync)| {
            instance
                .downcast_ref::<T>()
                .map(&identity)
                .ok_or_else(|| RehydrateError::mismatch(T::TYPE_NAME, "instance of another type"))
        }));
        self
    }

    /// Makes the type externalizable through its [`Identified`] implementation.
    pub fn identified(self) -> Self
    where
        T: Identified,
    {
        self.identity_with(T::identity)
    }

    /// Finishes the descriptor.
    pub fn build(self) -> TypeDescriptor {
        let derived: ConstructFn = Arc::new(|fields: &Fields| {
            T::construct(fields).map(|instance| Box::new(instance) as AnyBox)
        });
        let (constructors, finish) = match self.construct {
            Some(custom) => (
                vec![custom, derived],
                Some(self.finish.unwrap_or_else(|| erase_finish(T::assign))),
            ),
            None => (vec![derived], self.finish),
        };
        TypeDescriptor {
            name: self.name,
            type_id: TypeId::of::<T>(),
            constructors,
            finish,
            flatten: self.flatten,
            identity: self.identity,
            overrides: T::property_overrides()
                .into_iter()
                .map(|(key, partial)| (key.to_owned(), partial))
                .collect(),
        }
    }
}

fn erase_flatten<T, F>(flatten: F) -> FlattenFn
where
    T: Serializable,
    F: Fn(&T) -> Result<Fields> + Send + Sync + 'static,
{
    Arc::new(move |instance: &(dyn Any + Send + Sync)| match instance.downcast_ref::<T>() {
        Some(instance) => flatten(instance),
        None => Err(RehydrateError::mismatch(T::TYPE_NAME, "instance of another type")),
    })
}

fn erase_finish<T, F>(finish: F) -> FinishFn
where
    T: Serializable,
    F: Fn(&mut T, &Fields) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(
        move |instance: &mut (dyn Any + Send + Sync), fields: &Fields| match instance
            .downcast_mut::<T>()
        {
            Some(instance) => finish(instance, fields),
            None => Err(RehydrateError::mismatch(T::TYPE_NAME, "instance of another type")),
        },
    )
}

/// Name and runtime-type index of registered descriptors, plus their property overrides.
///
/// Registration is write-rarely; lookups happen once per traversed object and only take read
/// locks. Lock poisoning is recovered from: a panic in another thread never leaves a map
/// half-updated because every write is a single insert or remove.
#[derive(Debug, Default)]
pub struct Registry {
    by_name: RwLock<HashMap<String, Arc<TypeDescriptor>>>,
    by_type: RwLock<HashMap<TypeId, Arc<TypeDescriptor>>>,
    metadata: MetadataStore,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` with its own descriptor and property overrides.
    pub fn register<T: Serializable>(&self) -> &Self {
        self.register_descriptor(T::describe())
    }

    /// Adds or replaces a descriptor. The last registration of a name wins.
    pub fn register_descriptor(&self, mut descriptor: TypeDescriptor) -> &Self {
        let overrides = std::mem::take(&mut descriptor.overrides);
        let descriptor = Arc::new(descriptor);
        let name = descriptor.name.clone();

        let replaced = {
            let mut by_name = self.by_name.write().unwrap_or_else(|p| p.into_inner());
            by_name.insert(name.clone(), Arc::clone(&descriptor))
        };
        {
            let mut by_type = self.by_type.write().unwrap_or_else(|p| p.into_inner());
            if let Some(old) = &replaced
                && old.type_id != descriptor.type_id
                && by_type.get(&old.type_id).is_some_and(|d| d.name == name)
            {
                by_type.remove(&old.type_id);
            }
            by_type.insert(descriptor.type_id, Arc::clone(&descriptor));
        }

        if replaced.is_some() {
            warn!(type_name = %name, "type registered twice, previous descriptor replaced");
            self.metadata.forget(&name);
        } else {
            trace!(type_name = %name, "type registered");
        }
        for (key, partial) in overrides {
            self.metadata.override_property(&name, &key, partial);
        }
        self
    }

    /// Descriptor registered under `name`.
    ///
    /// # Errors
    /// [`RehydrateError::UnknownType`] if no type was registered under that name.
    pub fn resolve(&self, name: &str) -> Result<Arc<TypeDescriptor>> {
        let by_name = self.by_name.read().unwrap_or_else(|p| p.into_inner());
        by_name
            .get(name)
            .cloned()
            .ok_or_else(|| RehydrateError::UnknownType {
                name: name.to_owned(),
            })
    }

    /// Descriptor of the runtime type `type_id`, if registered.
    pub fn identify(&self, type_id: TypeId) -> Option<Arc<TypeDescriptor>> {
        let by_type = self.by_type.read().unwrap_or_else(|p| p.into_inner());
        by_type.get(&type_id).cloned()
    }

    /// Returns true if a type is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        let by_name = self.by_name.read().unwrap_or_else(|p| p.into_inner());
        by_name.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let by_name = self.by_name.read().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<String> = by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Merges a partial override into `type_name.key`.
    pub fn override_property(
        &self,
        type_name: &str,
        key: &str,
        partial: PropertyOverride,
    ) -> &Self {
        self.metadata.override_property(type_name, key, partial);
        self
    }

    /// The override of `type_name.key`, if any.
    pub fn property(&self, type_name: &str, key: &str) -> Option<PropertyOverride> {
        self.metadata.property(type_name, key)
    }

    /// Snapshot of every override of `type_name`.
    pub fn overrides_for(&self, type_name: &str) -> Arc<Overrides> {
        self.metadata.overrides_for(type_name)
    }

    /// Removes every type and override.
    pub fn reset(&self) {
        self.by_name.write().unwrap_or_else(|p| p.into_inner()).clear();
        self.by_type.write().unwrap_or_else(|p| p.into_inner()).clear();
        self.metadata.clear();
    }
}

static GLOBAL: LazyLock<Arc<Registry>> = LazyLock::new(|| Arc::new(Registry::new()));

/// The process-wide registry, used by [`Store`](crate::Store) unless another one is configured.
pub fn global() -> Arc<Registry> {
    Arc::clone(&GLOBAL)
}

/// Runs `setup` against the global registry and returns it.
///
/// ```rust
/// use rehydrate::registry;
///
/// let registry = registry::init(|r| {
///     r.override_property("Mod", "cache", rehydrate::PropertyOverride::ignore());
/// });
/// assert!(registry.property("Mod", "cache").is_some_and(|o| o.ignored));
/// ```
pub fn init(setup: impl FnOnce(&Registry)) -> Arc<Registry> {
    let registry = global();
    setup(&registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Serializable;

    #[derive(Debug, Clone, Default, Serializable)]
    #[serializable(name = "Shape")]
    struct Square {
        side: u32,
        #[serializable(ignore)]
        area: u32,
    }

    #[derive(Debug, Clone, Default, Serializable)]
    #[serializable(name = "Shape")]
    struct Circle {
        radius: u32,
    }

    #[derive(Debug, Clone, Default, Serializable)]
    #[serializable(name = "GlobalMarker")]
    struct Marker {
        on: bool,
    }

    #[test]
    fn last_registration_wins() -> Result<()> {
        let registry = Registry::new();
        registry.register::<Square>();
        assert!(registry.property("Shape", "area").is_some_and(|o| o.ignored));
        assert!(registry.identify(TypeId::of::<Square>()).is_some());

        registry.register::<Circle>();
        assert_eq!(registry.resolve("Shape")?.type_id(), TypeId::of::<Circle>());
        assert!(registry.identify(TypeId::of::<Square>()).is_none());
        assert!(
            registry
                .identify(TypeId::of::<Circle>())
                .is_some_and(|d| d.name() == "Shape")
        );
        // Overrides of the replaced descriptor do not leak into the new one.
        assert!(registry.property("Shape", "area").is_none());
        assert_eq!(registry.names(), vec!["Shape".to_owned()]);
        Ok(())
    }

    #[test]
    fn renamed_descriptor_keeps_type_lookup() {
        let registry = Registry::new();
        registry.register::<Circle>();
        registry.register_descriptor(TypeDescriptor::builder::<Circle>().named("Round").build());

        assert!(registry.contains("Shape"));
        assert!(registry.contains("Round"));
        assert_eq!(registry.names(), vec!["Round".to_owned(), "Shape".to_owned()]);
        assert!(
            registry
                .identify(TypeId::of::<Circle>())
                .is_some_and(|d| d.name() == "Round")
        );
    }

    #[test]
    fn reset_clears_types_and_overrides() {
        let registry = Registry::new();
        registry
            .register::<Square>()
            .override_property("Mod", "cache", PropertyOverride::ignore());

        registry.reset();
        assert!(registry.names().is_empty());
        assert!(!registry.contains("Shape"));
        assert!(registry.identify(TypeId::of::<Square>()).is_none());
        assert!(registry.property("Mod", "cache").is_none());
        assert!(matches!(
            registry.resolve("Shape"),
            Err(RehydrateError::UnknownType { .. })
        ));
    }

    #[test]
    fn init_configures_the_global_registry() {
        let registry = init(|r| {
            r.register::<Marker>();
        });
        assert!(Arc::ptr_eq(&registry, &global()));
        assert!(global().contains("GlobalMarker"));
        assert!(global().identify(TypeId::of::<Marker>()).is_some());
    }
}
