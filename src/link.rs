//! Lazy references to externalizable entities.
//!
//! A [`Link<T>`] stores the identity of its target and, once resolved, a cached
//! [`Handle<T>`]. It never owns the target: dehydrating a link writes only a
//! `{ $type, $ref }` placeholder, so the target has to be saved on its own (or be reachable
//! through some other property).
//!
//! How a link comes back from storage depends on the property holding it. Under a regular
//! property the hydrator resolves the reference eagerly and the link arrives resolved, sharing
//! the cell of every other reference to the same identity in that call. Under a property marked
//! `soft` the reference is left alone and the link resolves on the first [`Link::get`].

use std::fmt;
use std::sync::RwLock;

use crate::api::Store;
use crate::error::{RehydrateError, Result};
use crate::registry::{Identified, Serializable};
use crate::value::{FromValue, Handle, Placeholder, ToValue, Value};

/// Identity-bearing, lazily resolved reference to a `T`.
pub struct Link<T> {
    target_id: String,
    cache: RwLock<Option<Handle<T>>>,
}

impl<T: Serializable + Identified> Link<T> {
    /// Unresolved link to the entity stored under `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            target_id: id.into(),
            cache: RwLock::new(None),
        }
    }

    /// Resolved link to `target`.
    pub fn to(target: &Handle<T>) -> Result<Self> {
        let id = target.read(Identified::identity)?;
        Ok(Self::resolved(id, target.clone()))
    }

    /// Link to `target` stored under `id`, already resolved.
    pub fn resolved(id: impl Into<String>, target: Handle<T>) -> Self {
        Self {
            target_id: id.into(),
            cache: RwLock::new(Some(target)),
        }
    }

    /// Identity of the target.
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// The target, loading it through `store` on first use.
    ///
    /// # Errors
    /// [`RehydrateError::NotFound`] if the store has no record under the target id.
    pub fn get(&self, store: &Store) -> Result<Handle<T>> {
        if let Some(handle) = self.cached() {
            return Ok(handle);
        }
        let handle = store.load_id::<Handle<T>>(&self.target_id)?;
        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        // A concurrent `get` may have won; keep its handle so callers share one instance.
        Ok(cache.get_or_insert(handle).clone())
    }

    /// The cached target, without touching storage.
    pub fn cached(&self) -> Option<Handle<T>> {
        self.cache.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Returns true once the target is cached.
    pub fn is_resolved(&self) -> bool {
        self.cache.read().is_ok_and(|c| c.is_some())
    }

    /// Drops the cached target; the next [`Link::get`] loads it again.
    pub fn invalidate(&self) {
        *self.cache.write().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

impl<T> Clone for Link<T> {
    fn clone(&self) -> Self {
        Self {
            target_id: self.target_id.clone(),
            cache: RwLock::new(self.cache.read().unwrap_or_else(|p| p.into_inner()).clone()),
        }
    }
}

impl<T> fmt::Debug for Link<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resolved = self.cache.read().is_ok_and(|c| c.is_some());
        f.debug_struct("Link")
            .field("target_id", &self.target_id)
            .field("resolved", &resolved)
            .finish()
    }
}

impl<T: Serializable> ToValue for Link<T> {
    fn to_value(&self) -> Value {
        Value::Ref(Placeholder::new(T::TYPE_NAME, self.target_id.clone()))
    }
}

impl<T: Serializable + Identified> FromValue for Link<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Ref(placeholder) => Ok(Self::new(placeholder.id)),
            Value::Object(object) => {
                let handle = Handle::<T>::from_object(object)?;
                let id = match handle.object().external_id() {
                    Some(id) => id.to_owned(),
                    None => handle.read(Identified::identity)?,
                };
                Ok(Self::resolved(id, handle))
            }
            other => Err(RehydrateError::mismatch(
                format!("link to `{}`", T::TYPE_NAME),
                other.kind(),
            )),
        }
    }
}
