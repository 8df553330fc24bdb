//! Centralized error handling for Rehydrate.
//!
//! Every failure inside the engine is reported through [`RehydrateError`] and propagated with
//! `?`. The engine performs no local recovery: a failing hook, a missing record or an unknown
//! type aborts the enclosing `dehydrate`/`hydrate` call as a whole.
//!
//! ## Error Categories
//!
//! - **Type resolution** ([`RehydrateError::UnknownType`]): a `$type` name or a runtime type
//!   that was never registered.
//! - **Storage** ([`RehydrateError::NotFound`], [`RehydrateError::DanglingReference`],
//!   [`RehydrateError::InvalidId`], [`RehydrateError::Io`], [`RehydrateError::Unsupported`]):
//!   data provider failures.
//! - **User hooks** ([`RehydrateError::Transform`], [`RehydrateError::Construction`]).
//! - **Graph shape** ([`RehydrateError::Cycle`], [`RehydrateError::Vacant`],
//!   [`RehydrateError::Mismatch`], [`RehydrateError::Format`]).
//! - **Internal** ([`RehydrateError::Internal`]): poisoned locks and other logic errors.
//!
//! ## Cloneability
//!
//! [`RehydrateError`] is `Clone` so the traversal engine can capture the first failure of a
//! parallel fan-out and hand it back after all branches joined. Foreign error sources are
//! wrapped in `Arc` for that reason.
//!
//! ```rust
//! use rehydrate::{MemoryProvider, RehydrateError, Store};
//!
//! let store = Store::builder().provider(MemoryProvider::new()).build();
//! match store.load_id::<rehydrate::Value>("missing") {
//!     Err(RehydrateError::NotFound { id }) => assert_eq!(id, "missing"),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use std::io;
use std::sync::Arc;

/// Boxed error type returned by user supplied hooks (transforms, constructors).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A specialized `Result` type for Rehydrate operations.
pub type Result<T> = std::result::Result<T, RehydrateError>;

/// The master error enum covering all failure domains of the engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RehydrateError {
    /// A `$type` name (hydrate) or a runtime type (dehydrate) is not in the registry.
    ///
    /// Fatal: a record is never reconstructed with a guessed type.
    #[error("unknown type `{name}`: it is not registered (was it renamed since the data was written?)")]
    UnknownType {
        /// The unresolved type name.
        name: String,
    },

    /// The data provider has no record stored under `id`.
    #[error("no record stored under `{id}`")]
    NotFound {
        /// The missing identity.
        id: String,
    },

    /// A `$ref` placeholder points to an identity the provider cannot produce.
    ///
    /// Callers may catch this to substitute a placeholder of their own.
    #[error("dangling reference to `{id}` (type `{type_name}`)")]
    DanglingReference {
        /// The referenced identity.
        id: String,
        /// The type named by the placeholder.
        type_name: String,
    },

    /// A property transform hook failed.
    #[error("transform of `{type_name}.{property}` failed: {source}")]
    Transform {
        /// Owning type.
        type_name: String,
        /// Transformed property.
        property: String,
        /// The hook's own error.
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// No constructor of the type could build an instance from the record.
    #[error("cannot construct `{type_name}`: {message}")]
    Construction {
        /// Type being constructed.
        type_name: String,
        /// Last constructor failure.
        message: String,
    },

    /// A value had a different shape than the field expecting it.
    #[error("expected {expected}, found {found}")]
    Mismatch {
        /// What the field expected.
        expected: String,
        /// What the record contained.
        found: String,
    },

    /// An inlined (non-externalizable) object contains itself.
    ///
    /// Inline records are trees; only externalizable types can close a cycle.
    #[error("inline object of type `{type_name}` is part of a cycle; give the type an identity")]
    Cycle {
        /// Type of the object reached twice on one path.
        type_name: String,
    },

    /// An object cell was read before the hydrator populated it.
    #[error("object of type `{type_name}` is not hydrated yet")]
    Vacant {
        /// Type reserved for the cell.
        type_name: String,
    },

    /// A record identity cannot be used as a storage key.
    #[error("invalid record id `{id}`: {reason}")]
    InvalidId {
        /// The rejected identity.
        id: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The operation is not implemented by this provider.
    #[error("operation `{0}` is not supported by this provider")]
    Unsupported(&'static str),

    /// The flat representation is malformed.
    #[error("format error: {0}")]
    Format(String),

    /// Low-level I/O failure of a provider.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// JSON encoding or decoding failure of a provider.
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// Logic error inside the engine (poisoned lock, missing result).
    #[error("internal logic error: {0}")]
    Internal(String),
}

impl RehydrateError {
    /// Builds a [`RehydrateError::Transform`] from a hook failure.
    pub fn transform(type_name: &str, property: &str, source: BoxError) -> Self {
        Self::Transform {
            type_name: type_name.to_owned(),
            property: property.to_owned(),
            source: Arc::from(source),
        }
    }

    /// Builds a [`RehydrateError::Construction`].
    pub fn construction(type_name: &str, message: impl ToString) -> Self {
        Self::Construction {
            type_name: type_name.to_owned(),
            message: message.to_string(),
        }
    }

    /// Builds a [`RehydrateError::Mismatch`].
    pub fn mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::Mismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }
}

impl From<io::Error> for RehydrateError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for RehydrateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}
