//! Public entry points.
//!
//! A [`Store`] ties a [`Registry`] to a [`DataProvider`] and exposes the round trip:
//!
//! ```rust
//! use rehydrate::{Handle, MemoryProvider, Registry, Serializable, Store};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Default, Serializable)]
//! #[serializable(identity = "id")]
//! struct Plan {
//!     id: String,
//!     title: String,
//! }
//!
//! # fn main() -> rehydrate::Result<()> {
//! let registry = Arc::new(Registry::new());
//! registry.register::<Plan>();
//! let store = Store::builder()
//!     .registry(registry)
//!     .provider(MemoryProvider::new())
//!     .build();
//!
//! let plan = Plan { id: "p1".into(), title: "Winter pack".into() };
//! let record = store.save(&plan)?;
//! assert_eq!(record.reference.as_deref(), Some("p1"));
//!
//! let loaded: Plan = store.load_id("p1")?;
//! assert_eq!(loaded.title, "Winter pack");
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::{debug, trace};

use crate::dehydrate::{Dehydrated, Dehydrator};
use crate::error::{RehydrateError, Result};
use crate::format::FlatRecord;
use crate::hydrate::Hydrator;
use crate::provider::{DataProvider, MemoryProvider};
use crate::registry::{self, Registry};
use crate::value::{FromValue, ToValue, Value};

/// Behavior switches of a [`Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Walk independent branches concurrently on the rayon pool.
    pub parallel: bool,
    /// Rewrite external records whose identity the provider already has. When false, such
    /// records are left as they are.
    pub overwrite: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            overwrite: true,
        }
    }
}

/// A registry and a provider, used together for saving and loading graphs.
#[derive(Debug, Clone)]
pub struct Store {
    registry: Arc<Registry>,
    provider: Arc<dyn DataProvider>,
    options: StoreOptions,
}

impl Store {
    /// Starts configuring a store.
    #[must_use]
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    /// The registry types are resolved through.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The provider external records are written to.
    pub fn provider(&self) -> &Arc<dyn DataProvider> {
        &self.provider
    }

    /// The active options.
    pub fn options(&self) -> StoreOptions {
        self.options
    }

    /// Dehydrates `root` without persisting anything.
    pub fn dehydrate<T: ToValue + ?Sized>(&self, root: &T) -> Result<Dehydrated> {
        Dehydrator::new(&self.registry)
            .parallel(self.options.parallel)
            .dehydrate(&root.to_value())
    }

    /// Dehydrates `root` and writes every external record to the provider.
    ///
    /// Nothing is written unless the whole graph dehydrated successfully and the provider
    /// [accepts](DataProvider::validate) every identity. Returns the root record: a placeholder
    /// when the root itself is externalizable, an inline record otherwise.
    ///
    /// Records are then written one at a time. A provider failing in the middle of that (a full
    /// disk, a lost connection) leaves the records written before it in place.
    ///
    /// # Errors
    /// [`RehydrateError::Format`] if `root` is not a typed object, and every error of
    /// [`Store::dehydrate`], [`DataProvider::validate`] and [`DataProvider::put`].
    pub fn save<T: ToValue + ?Sized>(&self, root: &T) -> Result<FlatRecord> {
        let dehydrated = self.dehydrate(root)?;
        let record = dehydrated.record()?;
        for id in dehydrated.externals.keys() {
            self.provider.validate(id)?;
        }

        let mut written = 0_usize;
        for (id, external) in &dehydrated.externals {
            if !self.options.overwrite && self.provider.has(id)? {
                trace!(%id, "record exists, overwrite disabled");
                continue;
            }
            self.provider.put(id, external)?;
            written += 1;
        }

        debug!(
            type_name = %record.type_name,
            externals = dehydrated.externals.len(),
            written,
            "graph saved"
        );
        Ok(record)
    }

    /// Rebuilds the graph rooted at `record`.
    pub fn hydrate(&self, record: &FlatRecord) -> Result<Value> {
        self.hydrator().hydrate(record)
    }

    /// Rebuilds the graph rooted at `record` as a `T`.
    pub fn load<T: FromValue>(&self, record: &FlatRecord) -> Result<T> {
        T::from_value(self.hydrate(record)?)
    }

    /// Loads the record stored under `id` as a `T`.
    ///
    /// # Errors
    /// [`RehydrateError::NotFound`] if the provider has no record under `id`.
    pub fn load_id<T: FromValue>(&self, id: &str) -> Result<T> {
        T::from_value(self.hydrator().hydrate_id(id)?)
    }

    /// Removes the record stored under `id`.
    pub fn delete(&self, id: &str) -> Result<bool> {
        self.provider.delete(id)
    }

    fn hydrator(&self) -> Hydrator<'_> {
        Hydrator::new(&self.registry, self.provider.as_ref()).parallel(self.options.parallel)
    }
}

/// Builder of a [`Store`].
///
/// Defaults: the [global registry](registry::global), an empty [`MemoryProvider`] and
/// [`StoreOptions::default`].
#[derive(Debug, Default)]
pub struct StoreBuilder {
    registry: Option<Arc<Registry>>,
    provider: Option<Arc<dyn DataProvider>>,
    options: StoreOptions,
}

impl StoreBuilder {
    /// Resolves types through `registry` instead of the global one.
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Persists records through `provider`.
    pub fn provider(mut self, provider: impl DataProvider + 'static) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    /// Persists records through an already shared provider.
    pub fn shared_provider(mut self, provider: Arc<dyn DataProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Enables or disables concurrent traversal.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.options.parallel = parallel;
        self
    }

    /// Chooses whether existing records are rewritten on save.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.options.overwrite = overwrite;
        self
    }

    /// Replaces every option at once.
    pub fn options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    /// Finishes the store.
    pub fn build(self) -> Store {
        Store {
            registry: self.registry.unwrap_or_else(registry::global),
            provider: self
                .provider
                .unwrap_or_else(|| Arc::new(MemoryProvider::new())),
            options: self.options,
        }
    }
}

impl From<StoreBuilder> for Store {
    fn from(builder: StoreBuilder) -> Self {
        builder.build()
    }
}
