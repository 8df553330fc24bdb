//! The dynamic value model every traversal dispatches on.
//!
//! A [`Value`] is decided once per node and then pattern matched: primitives, ordered
//! sequences, keyed structures, typed objects and unresolved references. Typed objects live
//! in shared [`ObjectRef`] cells so a graph can contain sharing and cycles; [`Handle<T>`] is
//! the typed view domain code works with.
//!
//! Conversion between domain types and [`Value`] goes through [`ToValue`] and [`FromValue`].
//! The derive macro implements both for structs; this module provides the implementations for
//! the standard library types.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use crate::error::{RehydrateError, Result};

/// The property map of one flattened object.
pub type Fields = BTreeMap<String, Value>;

/// A type-erased instance stored in an object cell.
pub type AnyBox = Box<dyn Any + Send + Sync>;

/// A dynamically typed node of an object graph.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Absent value (`null`).
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer that does not fit `i64`.
    UInt(u64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered sequence.
    Sequence(Vec<Value>),
    /// Keyed structure without a registered type.
    Keyed(BTreeMap<String, Value>),
    /// Instance of a registered type.
    Object(ObjectRef),
    /// Reference to an external record that has not been resolved.
    Ref(Placeholder),
}

impl Value {
    /// Wraps `value` into a fresh object cell.
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Self::Object(ObjectRef::new(value))
    }

    /// Short name of the variant, used in mismatch messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) | Self::UInt(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Sequence(_) => "sequence",
            Self::Keyed(_) => "keyed structure",
            Self::Object(_) => "object",
            Self::Ref(_) => "unresolved reference",
        }
    }

    /// Returns true for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the object cell, if this is an object.
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }
}

/// Structural equality; objects compare by cell identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::UInt(a), Self::UInt(b)) => a == b,
            (Self::Int(a), Self::UInt(b)) | (Self::UInt(b), Self::Int(a)) => {
                u64::try_from(*a).is_ok_and(|a| a == *b)
            }
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Sequence(a), Self::Sequence(b)) => a == b,
            (Self::Keyed(a), Self::Keyed(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a.ptr_eq(b),
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => false,
        }
    }
}

/// An unresolved `{ $type, $ref }` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Placeholder {
    /// Registered name of the referenced type.
    pub type_name: String,
    /// Identity of the referenced record.
    pub id: String,
}

impl Placeholder {
    /// Creates a placeholder.
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
        }
    }
}

// --- OBJECT CELLS ---

struct ObjectCell {
    type_id: TypeId,
    type_name: String,
    /// Identity the hydrator resolved this cell from, if any.
    external_id: Option<String>,
    slot: RwLock<Option<AnyBox>>,
}

/// A shared, identity-bearing cell holding one typed instance.
///
/// Cloning an `ObjectRef` clones the pointer, not the instance. Two `ObjectRef`s are the
/// same object when [`ObjectRef::ptr_eq`] holds.
///
/// A cell is *vacant* while the hydrator is still building its instance; reading a vacant
/// cell fails with [`RehydrateError::Vacant`].
#[derive(Clone)]
pub struct ObjectRef(Arc<ObjectCell>);

impl ObjectRef {
    /// Wraps `value` into a new cell.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_parts(
            TypeId::of::<T>(),
            std::any::type_name::<T>().to_owned(),
            None,
            Some(Box::new(value)),
        )
    }

    fn from_parts(
        type_id: TypeId,
        type_name: String,
        external_id: Option<String>,
        instance: Option<AnyBox>,
    ) -> Self {
        Self(Arc::new(ObjectCell {
            type_id,
            type_name,
            external_id,
            slot: RwLock::new(instance),
        }))
    }

    /// Reserves a cell whose instance is filled in later.
    pub(crate) fn vacant(type_id: TypeId, type_name: &str, external_id: Option<String>) -> Self {
        Self::from_parts(type_id, type_name.to_owned(), external_id, None)
    }

    /// Wraps an already built instance.
    pub(crate) fn filled(type_id: TypeId, type_name: &str, instance: AnyBox) -> Self {
        Self::from_parts(type_id, type_name.to_owned(), None, Some(instance))
    }

    /// Stores the instance of a vacant cell. Returns false, dropping `instance`, if the cell
    /// was filled in the meantime.
    pub(crate) fn fill(&self, instance: AnyBox) -> Result<bool> {
        if (*instance).type_id() != self.0.type_id {
            return Err(RehydrateError::Internal(format!(
                "constructor of `{}` produced an instance of another type",
                self.0.type_name
            )));
        }
        let mut slot = self.0.slot.write().map_err(|_| self.poisoned())?;
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(instance);
        Ok(true)
    }

    /// Runtime type of the stored instance.
    pub fn type_id(&self) -> TypeId {
        self.0.type_id
    }

    /// Diagnostic name of the stored type.
    pub fn type_name(&self) -> &str {
        &self.0.type_name
    }

    /// Identity this cell was resolved from, for cells produced by the hydrator.
    pub fn external_id(&self) -> Option<&str> {
        self.0.external_id.as_deref()
    }

    /// Returns true while the hydrator has not populated the cell.
    pub fn is_vacant(&self) -> bool {
        self.0.slot.read().map_or(true, |slot| slot.is_none())
    }

    /// Returns true if both refer to the same cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address of the cell, stable for its lifetime.
    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Runs `f` with shared access to the instance.
    pub fn with<R>(&self, f: impl FnOnce(&(dyn Any + Send + Sync)) -> R) -> Result<R> {
        let slot = self.0.slot.read().map_err(|_| self.poisoned())?;
        let instance = slot.as_deref().ok_or_else(|| self.vacant_error())?;
        Ok(f(instance))
    }

    /// Runs `f` with exclusive access to the instance.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut (dyn Any + Send + Sync)) -> R) -> Result<R> {
        let mut slot = self.0.slot.write().map_err(|_| self.poisoned())?;
        let instance = slot.as_deref_mut().ok_or_else(|| self.vacant_error())?;
        Ok(f(instance))
    }

    /// Typed view of this cell.
    pub fn downcast<T: Any + Send + Sync>(self) -> Result<Handle<T>> {
        Handle::from_object(self)
    }

    fn vacant_error(&self) -> RehydrateError {
        RehydrateError::Vacant {
            type_name: self.0.type_name.clone(),
        }
    }

    fn poisoned(&self) -> RehydrateError {
        RehydrateError::Internal(format!("lock of `{}` object poisoned", self.0.type_name))
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("type", &self.0.type_name)
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("external_id", &self.0.external_id)
            .field("vacant", &self.is_vacant())
            .finish()
    }
}

/// Typed handle to a shared object cell.
///
/// Fields of type `Handle<T>` are how domain types express sharing and cycles: two fields
/// holding clones of the same handle point at the same instance, and hydration restores that.
pub struct Handle<T> {
    object: ObjectRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> Handle<T> {
    /// Moves `value` into a new shared cell.
    pub fn new(value: T) -> Self {
        Self {
            object: ObjectRef::new(value),
            _marker: PhantomData,
        }
    }

    /// Typed view of an untyped cell.
    ///
    /// # Errors
    /// [`RehydrateError::Mismatch`] if the cell stores another type.
    pub fn from_object(object: ObjectRef) -> Result<Self> {
        if object.type_id() != TypeId::of::<T>() {
            return Err(RehydrateError::mismatch(
                std::any::type_name::<T>(),
                object.type_name(),
            ));
        }
        Ok(Self {
            object,
            _marker: PhantomData,
        })
    }

    /// Runs `f` with shared access to the instance.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        self.object
            .with(|any| any.downcast_ref::<T>().map(f))?
            .ok_or_else(|| self.mismatch())
    }

    /// Runs `f` with exclusive access to the instance.
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        self.object
            .with_mut(|any| any.downcast_mut::<T>().map(f))?
            .ok_or_else(|| self.mismatch())
    }

    /// Clones the instance out of the cell.
    pub fn cloned(&self) -> Result<T>
    where
        T: Clone,
    {
        self.read(T::clone)
    }

    fn mismatch(&self) -> RehydrateError {
        RehydrateError::mismatch(std::any::type_name::<T>(), self.object.type_name())
    }
}

impl<T> Handle<T> {
    /// The untyped cell.
    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    /// Consumes the handle, returning the untyped cell.
    pub fn into_object(self) -> ObjectRef {
        self.object
    }

    /// Returns true if both handles point at the same instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.object.ptr_eq(&other.object)
    }

    /// Returns true while the hydrator has not populated the cell.
    pub fn is_vacant(&self) -> bool {
        self.object.is_vacant()
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            object: self.object.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.object).finish()
    }
}

// --- CONVERSION TRAITS ---

/// Conversion of a domain value into the dynamic model.
pub trait ToValue {
    /// Produces the dynamic representation of `self`.
    fn to_value(&self) -> Value;
}

/// Conversion of a dynamic value back into a domain value.
pub trait FromValue: Sized {
    /// Rebuilds `Self` from `value`.
    fn from_value(value: Value) -> Result<Self>;

    /// Value used when a property is absent from the record. `None` makes absence an error.
    fn missing() -> Option<Self> {
        None
    }
}

impl ToValue for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }

    fn missing() -> Option<Self> {
        Some(Value::Null)
    }
}

impl ToValue for bool {
    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(RehydrateError::mismatch("bool", other.kind())),
        }
    }
}

macro_rules! impl_integer {
    ($variant:ident, $wide:ty: $($t:ty),*) => {
        $(
            impl ToValue for $t {
                fn to_value(&self) -> Value {
                    Value::$variant(<$wide>::from(*self))
                }
            }

            impl FromValue for $t {
                fn from_value(value: Value) -> Result<Self> {
                    let out_of_range = |n: &dyn fmt::Display| {
                        RehydrateError::mismatch(stringify!($t), format!("integer {n}"))
                    };
                    match value {
                        Value::Int(n) => <$t>::try_from(n).map_err(|_| out_of_range(&n)),
                        Value::UInt(n) => <$t>::try_from(n).map_err(|_| out_of_range(&n)),
                        other => Err(RehydrateError::mismatch(stringify!($t), other.kind())),
                    }
                }
            }
        )*
    };
}

impl_integer!(Int, i64: i8, i16, i32, i64);
impl_integer!(UInt, u64: u8, u16, u32, u64);

impl ToValue for usize {
    fn to_value(&self) -> Value {
        Value::UInt(*self as u64)
    }
}

impl FromValue for usize {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Int(n) => usize::try_from(n)
                .map_err(|_| RehydrateError::mismatch("usize", format!("integer {n}"))),
            Value::UInt(n) => usize::try_from(n)
                .map_err(|_| RehydrateError::mismatch("usize", format!("integer {n}"))),
            other => Err(RehydrateError::mismatch("usize", other.kind())),
        }
    }
}

impl ToValue for f64 {
    fn to_value(&self) -> Value {
        Value::Float(*self)
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Float(f) => Ok(f),
            Value::Int(n) => Ok(n as f64),
            Value::UInt(n) => Ok(n as f64),
            other => Err(RehydrateError::mismatch("f64", other.kind())),
        }
    }
}

impl ToValue for f32 {
    fn to_value(&self) -> Value {
        Value::Float(f64::from(*self))
    }
}

impl FromValue for f32 {
    fn from_value(value: Value) -> Result<Self> {
        f64::from_value(value).map(|f| f as f32)
    }
}

impl ToValue for str {
    fn to_value(&self) -> Value {
        Value::String(self.to_owned())
    }
}

impl ToValue for String {
    fn to_value(&self) -> Value {
        Value::String(self.clone())
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(RehydrateError::mismatch("string", other.kind())),
        }
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn to_value(&self) -> Value {
        self.as_ref().map_or(Value::Null, ToValue::to_value)
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }

    fn missing() -> Option<Self> {
        Some(None)
    }
}

impl<T: ToValue> ToValue for Vec<T> {
    fn to_value(&self) -> Value {
        Value::Sequence(self.iter().map(ToValue::to_value).collect())
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Sequence(items) => items.into_iter().map(T::from_value).collect(),
            other => Err(RehydrateError::mismatch("sequence", other.kind())),
        }
    }

    fn missing() -> Option<Self> {
        Some(Vec::new())
    }
}

impl<T: ToValue> ToValue for BTreeMap<String, T> {
    fn to_value(&self) -> Value {
        Value::Keyed(
            self.iter()
                .map(|(k, v)| (k.clone(), v.to_value()))
                .collect(),
        )
    }
}

impl<T: FromValue> FromValue for BTreeMap<String, T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Keyed(map) => map
                .into_iter()
                .map(|(k, v)| T::from_value(v).map(|v| (k, v)))
                .collect(),
            other => Err(RehydrateError::mismatch("keyed structure", other.kind())),
        }
    }

    fn missing() -> Option<Self> {
        Some(BTreeMap::new())
    }
}

impl<T: ToValue> ToValue for HashMap<String, T> {
    fn to_value(&self) -> Value {
        Value::Keyed(
            self.iter()
                .map(|(k, v)| (k.clone(), v.to_value()))
                .collect(),
        )
    }
}

impl<T: FromValue> FromValue for HashMap<String, T> {
    fn from_value(value: Value) -> Result<Self> {
        BTreeMap::<String, T>::from_value(value).map(|map| map.into_iter().collect())
    }

    fn missing() -> Option<Self> {
        Some(HashMap::new())
    }
}

impl ToValue for ObjectRef {
    fn to_value(&self) -> Value {
        Value::Object(self.clone())
    }
}

impl FromValue for ObjectRef {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(object) => Ok(object),
            other => Err(RehydrateError::mismatch("object", other.kind())),
        }
    }
}

impl<T> ToValue for Handle<T> {
    fn to_value(&self) -> Value {
        Value::Object(self.object.clone())
    }
}

impl<T: Any + Send + Sync> FromValue for Handle<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(object) => Handle::from_object(object),
            Value::Ref(placeholder) => Err(RehydrateError::mismatch(
                std::any::type_name::<T>(),
                format!("unresolved reference `{}` (use a Link for soft properties)", placeholder.id),
            )),
            other => Err(RehydrateError::mismatch(std::any::type_name::<T>(), other.kind())),
        }
    }
}
