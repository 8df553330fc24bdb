//! Flat JSON → graph.
//!
//! The hydrator is the inverse of the [dehydrator](crate::dehydrate). Every JSON node is
//! classified once through [`Shape::classify`] and rebuilt:
//!
//! * **Inline records** are rebuilt fresh at each occurrence.
//! * **References** are resolved through the [`DataProvider`] and deduplicated against the
//!   call's `seen` map. A vacant cell is registered *before* the referenced record is fetched, so
//!   a reference back to an object still under construction returns that same cell. This is how
//!   cycles are restored. Only references from inside that object's own subtree see the vacant
//!   cell: a parallel branch reaching the same identity from elsewhere builds the record too, and
//!   whichever fill lands first is kept.
//!
//! An object is built in two explicit phases. Phase one rebuilds the raw property map
//! (references under soft properties are left as [`Value::Ref`]). Phase two drops ignored
//! properties and passes transformed ones through `transform.into`. Only then is the
//! descriptor's constructor called, followed by its finish hook.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{Map, Value as JsonValue};
use tracing::{debug, trace};

use crate::error::{RehydrateError, Result};
use crate::executor::Executor;
use crate::format::{FlatRecord, Shape};
use crate::metadata::Overrides;
use crate::provider::DataProvider;
use crate::registry::{Registry, TypeDescriptor};
use crate::value::{AnyBox, Fields, ObjectRef, Placeholder, Value};

/// Rebuilds object graphs against a registry and a provider.
#[derive(Debug, Clone, Copy)]
pub struct Hydrator<'a> {
    registry: &'a Registry,
    provider: &'a dyn DataProvider,
    parallel: bool,
}

impl<'a> Hydrator<'a> {
    /// Creates a hydrator resolving types through `registry` and references through `provider`.
    pub fn new(registry: &'a Registry, provider: &'a dyn DataProvider) -> Self {
        Self {
            registry,
            provider,
            parallel: true,
        }
    }

    /// Enables or disables concurrent hydration of independent branches.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Rebuilds the graph rooted at `record`.
    pub fn hydrate(&self, record: &FlatRecord) -> Result<Value> {
        self.run(|ctx| match record.shape()? {
            Shape::Typed {
                type_name,
                value,
                reference,
            } => ctx.typed(type_name, value, reference, None),
            Shape::Reference { type_name, id } => ctx.reference(type_name, id, None),
            _ => Err(RehydrateError::Internal("record shape is not a record".into())),
        })
    }

    /// Rebuilds an arbitrary dehydrated JSON value.
    pub fn hydrate_json(&self, json: &JsonValue) -> Result<Value> {
        self.run(|ctx| ctx.node(json, false, None))
    }

    /// Fetches the record stored under `id` and rebuilds it.
    ///
    /// # Errors
    /// [`RehydrateError::NotFound`] if the provider has no such record.
    pub fn hydrate_id(&self, id: &str) -> Result<Value> {
        let record = self.provider.get(id)?;
        self.run(|ctx| ctx.adopt(id, &record))
    }

    fn run(&self, f: impl FnOnce(&Context<'_>) -> Result<Value>) -> Result<Value> {
        let ctx = Context {
            registry: self.registry,
            provider: self.provider,
            executor: Executor::new(self.parallel),
            seen: Mutex::new(HashMap::new()),
        };
        let result = f(&ctx);
        let value = ctx.executor.finish(result)?;
        debug!(
            resolved = ctx.lock_seen().len(),
            parallel = self.parallel,
            "hydrated object graph"
        );
        Ok(value)
    }
}

/// Identities being built on the path from the root to the current node.
#[derive(Clone, Copy)]
struct Lineage<'l> {
    id: &'l str,
    parent: Option<&'l Lineage<'l>>,
}

fn in_lineage(mut lineage: Option<&Lineage<'_>>, id: &str) -> bool {
    while let Some(step) = lineage {
        if step.id == id {
            return true;
        }
        lineage = step.parent;
    }
    false
}

struct Context<'a> {
    registry: &'a Registry,
    provider: &'a dyn DataProvider,
    executor: Executor,
    seen: Mutex<HashMap<String, ObjectRef>>,
}

impl Context<'_> {
    fn node(&self, json: &JsonValue, soft: bool, lineage: Option<&Lineage<'_>>) -> Result<Value> {
        self.executor.checkpoint()?;
        match Shape::classify(json)? {
            Shape::Primitive(json) => Ok(primitive(json)),
            Shape::Sequence(items) => self
                .executor
                .map(items, |item| self.node(item, soft, lineage))
                .map(Value::Sequence),
            Shape::Keyed(map) => {
                let entries: Vec<(&String, &JsonValue)> = map.iter().collect();
                let values = self
                    .executor
                    .map(&entries, |(_, v)| self.node(v, soft, lineage))?;
                Ok(Value::Keyed(
                    entries
                        .into_iter()
                        .map(|(k, _)| k.clone())
                        .zip(values)
                        .collect(),
                ))
            }
            Shape::Typed {
                type_name,
                value,
                reference,
            } => self.typed(type_name, value, reference, lineage),
            Shape::Reference { type_name, id } if soft => {
                Ok(Value::Ref(Placeholder::new(type_name, id)))
            }
            Shape::Reference { type_name, id } => self.reference(type_name, id, lineage),
        }
    }

    /// An inline record. One that also names its identity is registered under it, so later
    /// references to that identity reuse the instance.
    fn typed(
        &self,
        type_name: &str,
        value: &JsonValue,
        reference: Option<&str>,
        lineage: Option<&Lineage<'_>>,
    ) -> Result<Value> {
        let descriptor = self.registry.resolve(type_name)?;
        match reference {
            Some(id) => match self.reserve(&descriptor, id, lineage)? {
                Reserved::Ready(cell) => Ok(Value::Object(cell)),
                Reserved::Build(cell) | Reserved::Share(cell) => {
                    let step = Lineage {
                        id,
                        parent: lineage,
                    };
                    cell.fill(self.build(&descriptor, value, Some(&step))?)?;
                    Ok(Value::Object(cell))
                }
            },
            None => {
                let instance = self.build(&descriptor, value, lineage)?;
                Ok(Value::Object(ObjectRef::filled(
                    descriptor.type_id(),
                    descriptor.name(),
                    instance,
                )))
            }
        }
    }

    fn reference(
        &self,
        type_name: &str,
        id: &str,
        lineage: Option<&Lineage<'_>>,
    ) -> Result<Value> {
        let descriptor = self.registry.resolve(type_name)?;
        let (cell, shared) = match self.reserve(&descriptor, id, lineage)? {
            Reserved::Ready(cell) => return Ok(Value::Object(cell)),
            Reserved::Build(cell) => (cell, false),
            Reserved::Share(cell) => (cell, true),
        };

        trace!(type_name, id, "resolving reference");
        let record = match self.provider.get(id) {
            Ok(record) => record,
            // The other branch is building it from an inline `$value`.
            Err(RehydrateError::NotFound { .. }) if shared => return Ok(Value::Object(cell)),
            Err(RehydrateError::NotFound { .. }) => {
                return Err(RehydrateError::DanglingReference {
                    id: id.to_owned(),
                    type_name: type_name.to_owned(),
                });
            }
            Err(err) => return Err(err),
        };
        self.fill(&descriptor, &cell, id, &record, lineage)?;
        Ok(Value::Object(cell))
    }

    /// Rebuilds a record fetched by identity at the root of a call.
    fn adopt(&self, id: &str, record: &FlatRecord) -> Result<Value> {
        let descriptor = self.registry.resolve(&record.type_name)?;
        match self.reserve(&descriptor, id, None)? {
            Reserved::Ready(cell) => Ok(Value::Object(cell)),
            Reserved::Build(cell) | Reserved::Share(cell) => {
                self.fill(&descriptor, &cell, id, record, None)?;
                Ok(Value::Object(cell))
            }
        }
    }

    fn fill(
        &self,
        descriptor: &TypeDescriptor,
        cell: &ObjectRef,
        id: &str,
        record: &FlatRecord,
        lineage: Option<&Lineage<'_>>,
    ) -> Result<()> {
        if record.type_name != descriptor.name() {
            return Err(RehydrateError::Format(format!(
                "record `{id}` is a `{}` but is referenced as `{}`",
                record.type_name,
                descriptor.name()
            )));
        }
        let step = Lineage {
            id,
            parent: lineage,
        };
        match record.shape()? {
            Shape::Typed { value, .. } => {
                cell.fill(self.build(descriptor, value, Some(&step))?)?;
                Ok(())
            }
            _ => Err(RehydrateError::Format(format!(
                "record `{id}` is a placeholder, not a stored value"
            ))),
        }
    }

    /// Claims `id` in the seen map, or decides what to do with the cell already claimed for it.
    ///
    /// A claimed cell that is still vacant is returned as is only when `id` is one of the
    /// records being built above this node, which is a cycle. Otherwise another branch is
    /// building it concurrently; this branch builds the record as well and the first fill wins.
    fn reserve(
        &self,
        descriptor: &TypeDescriptor,
        id: &str,
        lineage: Option<&Lineage<'_>>,
    ) -> Result<Reserved> {
        let mut seen = self.lock_seen();
        if let Some(cell) = seen.get(id) {
            if cell.type_id() != descriptor.type_id() {
                return Err(RehydrateError::Format(format!(
                    "identity `{id}` is referenced as both `{}` and `{}`",
                    cell.type_name(),
                    descriptor.name()
                )));
            }
            if cell.is_vacant() && !in_lineage(lineage, id) {
                trace!(type_name = descriptor.name(), id, "record under construction elsewhere");
                return Ok(Reserved::Share(cell.clone()));
            }
            return Ok(Reserved::Ready(cell.clone()));
        }
        let cell = ObjectRef::vacant(descriptor.type_id(), descriptor.name(), Some(id.to_owned()));
        seen.insert(id.to_owned(), cell.clone());
        Ok(Reserved::Build(cell))
    }

    /// Phase one and two, then construction.
    fn build(
        &self,
        descriptor: &TypeDescriptor,
        value: &JsonValue,
        lineage: Option<&Lineage<'_>>,
    ) -> Result<AnyBox> {
        let type_name = descriptor.name();
        let props: &Map<String, JsonValue> = match value {
            JsonValue::Object(props) => props,
            _ => {
                return Err(RehydrateError::Format(format!(
                    "`$value` of `{type_name}` must be an object"
                )));
            }
        };
        let overrides = self.registry.overrides_for(type_name);

        let entries: Vec<(&String, &JsonValue)> = props.iter().collect();
        let values = self.executor.map(&entries, |(key, json)| {
            let soft = overrides.get(key.as_str()).is_some_and(|o| o.soft);
            self.node(json, soft, lineage)
        })?;
        let raw: Fields = entries
            .into_iter()
            .map(|(k, _)| k.clone())
            .zip(values)
            .collect();

        let fields = transform_pass(type_name, &overrides, raw)?;
        descriptor.instantiate(&fields)
    }

    fn lock_seen(&self) -> std::sync::MutexGuard<'_, HashMap<String, ObjectRef>> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner())
    }
}

enum Reserved {
    /// Filled, or vacant because it is an ancestor of the current node.
    Ready(ObjectRef),
    /// Claimed by this branch, which builds the record into the cell.
    Build(ObjectRef),
    /// Claimed and still being built by a concurrent branch; this one builds it as well.
    Share(ObjectRef),
}

/// Drops ignored properties and applies inbound transforms.
fn transform_pass(type_name: &str, overrides: &Overrides, raw: Fields) -> Result<Fields> {
    raw.into_iter()
        .filter_map(|(key, value)| match overrides.get(&key) {
            Some(o) if o.ignored => None,
            Some(o) => Some(o.inbound(type_name, &key, value).map(|value| (key, value))),
            None => Some(Ok((key, value))),
        })
        .collect()
}

fn primitive(json: &JsonValue) -> Value {
    match json {
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => Value::Int(i),
            (None, Some(u)) => Value::UInt(u),
            (None, None) => n.as_f64().map_or(Value::Null, Value::Float),
        },
        JsonValue::String(s) => Value::String(s.clone()),
        _ => Value::Null,
    }
}
