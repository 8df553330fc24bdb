//! # Rehydrate
//!
//! A typed object-graph persistence engine. Rehydrate converts in-memory object graphs into
//! flat, JSON-safe records ("dehydration") and rebuilds live, correctly typed graphs from them
//! ("hydration"), including graphs with shared objects and cycles.
//!
//! ## Overview
//!
//! Graphs are described through a small dynamic model, [`Value`], which every traversal
//! dispatches on. Domain types join that model by deriving [`Serializable`] and being
//! registered in a [`Registry`]. From there:
//!
//! *   **Type recovery:** every object is written as `{ "$type": name, "$value": fields }` and
//!     rebuilt through the constructor registered under that name. Unknown names are fatal,
//!     never guessed.
//! *   **Externalization:** types with an identity are stored as standalone records and
//!     referenced with `{ "$type": name, "$ref": id }`. One call writes at most one record per
//!     identity, which is also what makes cyclic graphs terminate.
//! *   **Cycle restoration:** while hydrating, a reference to an object that is still being
//!     built returns that same object, so `a.next.next` is `a` again after a round trip.
//! *   **Property overrides:** properties can be ignored, routed through a bidirectional
//!     transform, or marked soft so their references stay lazy ([`Link`]).
//! *   **Parallel traversal:** independent branches are walked on the rayon pool; the result
//!     is identical to a sequential walk.
//!
//! ## Architecture
//!
//! ```text
//!             ┌───────────── Store ─────────────┐
//!  domain ──► │ Dehydrator ──► externals ──► DataProvider
//!  values ◄── │ Hydrator   ◄── get(id)   ◄──┘   │
//!             └──────── Registry + metadata ────┘
//! ```
//!
//! *   [`registry`]: type name ↔ [`TypeDescriptor`] (construct, finish, flatten, identity).
//! *   [`metadata`]: per-property overrides.
//! *   [`dehydrate`] / [`hydrate`]: the two traversals.
//! *   [`provider`]: the [`DataProvider`] persistence boundary.
//! *   [`api`]: the [`Store`] facade.
//!
//! ## Usage
//!
//! ```rust
//! use rehydrate::{Handle, Registry, Serializable, Store};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Default, Serializable)]
//! #[serializable(identity = "id", no_inline)]
//! struct Node {
//!     id: String,
//!     next: Option<Handle<Node>>,
//! }
//!
//! # fn main() -> rehydrate::Result<()> {
//! let registry = Arc::new(Registry::new());
//! registry.register::<Node>();
//! let store = Store::builder().registry(registry).build();
//!
//! // a -> b -> a
//! let a = Handle::new(Node { id: "a".into(), next: None });
//! let b = Handle::new(Node { id: "b".into(), next: Some(a.clone()) });
//! a.write(|n| n.next = Some(b.clone()))?;
//!
//! store.save(&a)?;
//! let loaded: Handle<Node> = store.load_id("a")?;
//! let next = loaded.read(|n| n.next.clone())?.expect("b");
//! let back = next.read(|n| n.next.clone())?.expect("a");
//! assert!(back.ptr_eq(&loaded));
//! # Ok(())
//! # }
//! ```
//!
//! ### Safety and Error Handling
//!
//! * **No Unsafe:** the crate forbids `unsafe` code.
//! * **No Panics:** No `unwrap()` or `panic!()` calls in the library (enforced by clippy lints).
//! * **Comprehensive Errors:** All failures correspond to a [`RehydrateError`] variant, and the
//!   first failure aborts the whole call. A failed save writes nothing.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![warn(missing_docs)]

// Lets the derive macro's `rehydrate::` paths resolve inside this crate's own tests.
extern crate self as rehydrate;

// --- PUBLIC API MODULES ---
pub mod api;
pub mod dehydrate;
pub mod error;
pub mod format;
pub mod hydrate;
pub mod link;
pub mod metadata;
pub mod provider;
pub mod registry;
pub mod value;

// --- INTERNAL IMPLEMENTATION MODULES (Hidden from Docs) ---
#[doc(hidden)]
pub mod executor;

// --- MACRO SUPPORT MODULES ---

/// Runtime utilities used by the derived code.
#[doc(hidden)]
pub mod rt;

// --- RE-EXPORTS ---

pub use api::{Store, StoreBuilder, StoreOptions};
pub use dehydrate::{Dehydrated, Dehydrator};
pub use error::{BoxError, RehydrateError, Result};
pub use format::FlatRecord;
pub use hydrate::Hydrator;
pub use link::Link;
pub use metadata::{PropertyOverride, Transform};
pub use provider::{DataProvider, DirectoryProvider, MemoryProvider};
pub use registry::{Identified, Registry, Serializable, TypeDescriptor};
pub use value::{Fields, FromValue, Handle, ObjectRef, Placeholder, ToValue, Value};

// Re-export the derive macro so it is accessible as `rehydrate::Serializable`
pub use rehydrate_derive::Serializable;
