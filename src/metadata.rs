//! Per-type, per-property overrides.
//!
//! Every property of a registered type is walked generically unless an override says
//! otherwise. Overrides can drop a property ([`PropertyOverride::ignore`]), keep its references
//! lazy ([`PropertyOverride::soft_reference`]) or route it through a bidirectional
//! [`Transform`]. Overrides declared on a type through the derive macro are seeded when the
//! type is registered; further ones can be added at runtime through
//! [`Registry::override_property`](crate::Registry::override_property).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::{BoxError, RehydrateError};
use crate::value::{FromValue, ToValue, Value};

/// Signature of one direction of a [`Transform`].
pub type TransformFn = Arc<dyn Fn(Value) -> Result<Value, BoxError> + Send + Sync>;

/// Overrides of one type, keyed by property name.
pub type Overrides = BTreeMap<String, PropertyOverride>;

/// A pair of converters applied to one property.
///
/// `out` runs before the dehydrator walks the property; `into` runs after the hydrator has
/// rebuilt the raw property value. The two are expected to be inverses of each other.
#[derive(Clone)]
pub struct Transform {
    out: TransformFn,
    into: TransformFn,
}

impl Transform {
    /// Builds a transform from two untyped converters.
    pub fn new<O, I>(out: O, into: I) -> Self
    where
        O: Fn(Value) -> Result<Value, BoxError> + Send + Sync + 'static,
        I: Fn(Value) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        Self {
            out: Arc::new(out),
            into: Arc::new(into),
        }
    }

    /// Builds a transform between a domain type `A` and its stored form `B`.
    ///
    /// ```rust
    /// use rehydrate::{Transform, Value};
    ///
    /// let celsius = Transform::typed(
    ///     |c: f64| Ok(c * 9.0 / 5.0 + 32.0),
    ///     |f: f64| Ok((f - 32.0) * 5.0 / 9.0),
    /// );
    /// let stored = celsius.apply_out(Value::Float(100.0)).unwrap();
    /// assert_eq!(stored, Value::Float(212.0));
    /// ```
    pub fn typed<A, B, O, I>(out: O, into: I) -> Self
    where
        A: FromValue + ToValue + 'static,
        B: FromValue + ToValue + 'static,
        O: Fn(A) -> Result<B, BoxError> + Send + Sync + 'static,
        I: Fn(B) -> Result<A, BoxError> + Send + Sync + 'static,
    {
        Self::new(
            move |value| Ok(out(A::from_value(value)?)?.to_value()),
            move |value| Ok(into(B::from_value(value)?)?.to_value()),
        )
    }

    /// Converts a live property value into its stored form.
    pub fn apply_out(&self, value: Value) -> Result<Value, BoxError> {
        (self.out)(value)
    }

    /// Converts a stored property value back into its live form.
    pub fn apply_into(&self, value: Value) -> Result<Value, BoxError> {
        (self.into)(value)
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Transform { .. }")
    }
}

/// Partial override of one property.
#[derive(Debug, Clone, Default)]
pub struct PropertyOverride {
    /// The property is excluded from the flat record and from reconstruction.
    pub ignored: bool,
    /// References under this property stay unresolved until a [`Link`](crate::Link) asks.
    pub soft: bool,
    /// Converters applied around the generic walk.
    pub transform: Option<Transform>,
}

impl PropertyOverride {
    /// Override that excludes the property.
    pub fn ignore() -> Self {
        Self {
            ignored: true,
            ..Self::default()
        }
    }

    /// Override that keeps references under the property lazy.
    pub fn soft_reference() -> Self {
        Self {
            soft: true,
            ..Self::default()
        }
    }

    /// Override that routes the property through `transform`.
    pub fn transformed(transform: Transform) -> Self {
        Self {
            transform: Some(transform),
            ..Self::default()
        }
    }

    /// Folds `later` into `self`. Flags accumulate; a later transform replaces an earlier one.
    pub fn merge(&mut self, later: PropertyOverride) {
        self.ignored |= later.ignored;
        self.soft |= later.soft;
        if later.transform.is_some() {
            self.transform = later.transform;
        }
    }

    /// Runs the outbound converter, if any.
    pub(crate) fn outbound(
        &self,
        type_name: &str,
        property: &str,
        value: Value,
    ) -> crate::Result<Value> {
        match &self.transform {
            Some(t) => t
                .apply_out(value)
                .map_err(|e| RehydrateError::transform(type_name, property, e)),
            None => Ok(value),
        }
    }

    /// Runs the inbound converter, if any.
    pub(crate) fn inbound(
        &self,
        type_name: &str,
        property: &str,
        value: Value,
    ) -> crate::Result<Value> {
        match &self.transform {
            Some(t) => t
                .apply_into(value)
                .map_err(|e| RehydrateError::transform(type_name, property, e)),
            None => Ok(value),
        }
    }
}

/// Override table of every registered type.
///
/// Each type's table is kept behind an `Arc` so a traversal takes one cheap snapshot per
/// node instead of holding the lock.
#[derive(Debug, Default)]
pub struct MetadataStore {
    types: RwLock<HashMap<String, Arc<Overrides>>>,
}

impl MetadataStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `partial` into the override of `type_name.key`.
    pub fn override_property(&self, type_name: &str, key: &str, partial: PropertyOverride) {
        let mut types = self.types.write().unwrap_or_else(|p| p.into_inner());
        let table = types.entry(type_name.to_owned()).or_default();
        Arc::make_mut(table)
            .entry(key.to_owned())
            .or_default()
            .merge(partial);
    }

    /// The override of `type_name.key`, if one was declared.
    pub fn property(&self, type_name: &str, key: &str) -> Option<PropertyOverride> {
        let types = self.types.read().unwrap_or_else(|p| p.into_inner());
        types.get(type_name)?.get(key).cloned()
    }

    /// Snapshot of every override of `type_name`.
    pub fn overrides_for(&self, type_name: &str) -> Arc<Overrides> {
        let types = self.types.read().unwrap_or_else(|p| p.into_inner());
        types.get(type_name).cloned().unwrap_or_default()
    }

    /// Drops the overrides of one type.
    pub fn forget(&self, type_name: &str) {
        let mut types = self.types.write().unwrap_or_else(|p| p.into_inner());
        types.remove(type_name);
    }

    /// Drops every override.
    pub fn clear(&self) {
        let mut types = self.types.write().unwrap_or_else(|p| p.into_inner());
        types.clear();
    }
}
