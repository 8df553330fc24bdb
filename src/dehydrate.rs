//! Graph → flat JSON.
//!
//! The dehydrator walks a [`Value`] graph once. Primitives become JSON scalars, sequences and
//! keyed structures recurse element-wise, and typed objects become [`FlatRecord`]s:
//!
//! * **Externalizable** objects (types with an identity) are claimed by id. The first visit
//!   walks the object and stores `{ $type, $value }` in the externals map; every visit returns
//!   the `{ $type, $ref }` placeholder. A cycle through externalizable objects therefore
//!   terminates at the second visit.
//! * **Inline** objects are emitted as `{ $type, $value }` in place. A completed inline result
//!   is reused when the same object is reached again. An inline object that is reachable from
//!   its own properties cannot be written as a tree and fails with [`RehydrateError::Cycle`].
//!
//! Property overrides are applied to each object's flattened fields before they are walked:
//! ignored properties are dropped and transformed ones are passed through `transform.out`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use serde_json::{Map, Number, Value as JsonValue};
use tracing::{debug, trace};

use crate::error::{RehydrateError, Result};
use crate::executor::Executor;
use crate::format::{FlatRecord, is_record};
use crate::registry::{Registry, TypeDescriptor};
use crate::value::{ObjectRef, Value};

/// Output of one dehydration.
#[derive(Debug, Clone, PartialEq)]
pub struct Dehydrated {
    /// JSON of the root value. For an object root this is a [`FlatRecord`].
    pub root: JsonValue,
    /// Every externalizable object reached, keyed by identity.
    pub externals: BTreeMap<String, FlatRecord>,
}

impl Dehydrated {
    /// The root as a typed record.
    ///
    /// # Errors
    /// [`RehydrateError::Format`] if the root was not an object.
    pub fn record(&self) -> Result<FlatRecord> {
        FlatRecord::from_json(&self.root)
    }
}

/// Walks object graphs against a registry.
#[derive(Debug, Clone, Copy)]
pub struct Dehydrator<'r> {
    registry: &'r Registry,
    parallel: bool,
}

impl<'r> Dehydrator<'r> {
    /// Creates a dehydrator that resolves types through `registry`.
    pub fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            parallel: true,
        }
    }

    /// Enables or disables concurrent walking of independent branches.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Dehydrates `root`.
    ///
    /// # Errors
    /// The first failure of any branch: unregistered types, transform failures, inline cycles
    /// or non-finite floats. No externals are returned on failure.
    pub fn dehydrate(&self, root: &Value) -> Result<Dehydrated> {
        let ctx = Context {
            registry: self.registry,
            executor: Executor::new(self.parallel),
            claimed: Mutex::new(HashSet::new()),
            inline_done: Mutex::new(HashMap::new()),
            externals: Mutex::new(BTreeMap::new()),
        };

        let result = ctx.walk(root, None);
        let root = ctx.executor.finish(result)?;
        let externals = ctx.externals.into_inner().unwrap_or_else(|p| p.into_inner());

        debug!(
            externals = externals.len(),
            parallel = self.parallel,
            "dehydrated object graph"
        );
        Ok(Dehydrated { root, externals })
    }
}

/// Inline objects on the path from the root to the current node.
#[derive(Clone, Copy)]
struct Trail<'t> {
    addr: usize,
    parent: Option<&'t Trail<'t>>,
}

fn on_trail(mut trail: Option<&Trail<'_>>, addr: usize) -> bool {
    while let Some(step) = trail {
        if step.addr == addr {
            return true;
        }
        trail = step.parent;
    }
    false
}

struct Context<'r> {
    registry: &'r Registry,
    executor: Executor,
    claimed: Mutex<HashSet<String>>,
    /// Finished inline objects. The cell is kept alive so its address is not reused.
    inline_done: Mutex<HashMap<usize, (ObjectRef, JsonValue)>>,
    externals: Mutex<BTreeMap<String, FlatRecord>>,
}

impl Context<'_> {
    fn walk(&self, value: &Value, trail: Option<&Trail<'_>>) -> Result<JsonValue> {
        self.executor.checkpoint()?;
        match value {
            Value::Null => Ok(JsonValue::Null),
            Value::Bool(b) => Ok(JsonValue::Bool(*b)),
            Value::Int(n) => Ok(JsonValue::from(*n)),
            Value::UInt(n) => Ok(JsonValue::from(*n)),
            Value::Float(f) => Number::from_f64(*f).map(JsonValue::Number).ok_or_else(|| {
                RehydrateError::Format(format!("cannot store non-finite float {f}"))
            }),
            Value::String(s) => Ok(JsonValue::String(s.clone())),
            Value::Sequence(items) => self
                .executor
                .map(items, |item| self.walk(item, trail))
                .map(JsonValue::Array),
            Value::Keyed(map) => {
                let entries: Vec<(&String, &Value)> = map.iter().collect();
                let values = self.executor.map(&entries, |(_, v)| self.walk(v, trail))?;
                let out: Map<String, JsonValue> = entries
                    .into_iter()
                    .map(|(k, _)| k.clone())
                    .zip(values)
                    .collect();
                if is_record(&out) {
                    return Err(RehydrateError::Format(
                        "keyed structure would read back as a record; its keys collide with `$type`"
                            .into(),
                    ));
                }
                Ok(JsonValue::Object(out))
            }
            Value::Ref(placeholder) => {
                Ok(FlatRecord::placeholder(&placeholder.type_name, &placeholder.id).to_json())
            }
            Value::Object(object) => self.object(object, trail),
        }
    }

    fn object(&self, object: &ObjectRef, trail: Option<&Trail<'_>>) -> Result<JsonValue> {
        let descriptor =
            self.registry
                .identify(object.type_id())
                .ok_or_else(|| RehydrateError::UnknownType {
                    name: object.type_name().to_owned(),
                })?;

        if let Some(id) = descriptor.identity(object)? {
            let placeholder = FlatRecord::placeholder(descriptor.name(), &id).to_json();
            if !self.claim(&id) {
                return Ok(placeholder);
            }
            trace!(type_name = descriptor.name(), %id, "claimed external record");
            // An external record starts a new tree, so the inline trail restarts here.
            let value = self.properties(&descriptor, object, None)?;
            let mut externals = self.externals.lock().unwrap_or_else(|p| p.into_inner());
            externals.insert(id, FlatRecord::inline(descriptor.name(), value));
            return Ok(placeholder);
        }

        let addr = object.addr();
        if let Some((_, done)) = self.lock_inline().get(&addr) {
            return Ok(done.clone());
        }
        if on_trail(trail, addr) {
            return Err(RehydrateError::Cycle {
                type_name: descriptor.name().to_owned(),
            });
        }

        let step = Trail {
            addr,
            parent: trail,
        };
        let value = self.properties(&descriptor, object, Some(&step))?;
        let json = FlatRecord::inline(descriptor.name(), value).to_json();
        self.lock_inline().insert(addr, (object.clone(), json.clone()));
        Ok(json)
    }

    /// Flattens `object`, applies its overrides and walks the remaining properties.
    fn properties(
        &self,
        descriptor: &TypeDescriptor,
        object: &ObjectRef,
        trail: Option<&Trail<'_>>,
    ) -> Result<JsonValue> {
        let type_name = descriptor.name();
        let fields = descriptor.flatten(object)?;
        let overrides = self.registry.overrides_for(type_name);

        let mut prepared = Vec::with_capacity(fields.len());
        for (key, value) in fields {
            match overrides.get(&key) {
                Some(o) if o.ignored => {}
                Some(o) => {
                    let value = o.outbound(type_name, &key, value)?;
                    prepared.push((key, value));
                }
                None => prepared.push((key, value)),
            }
        }

        let values = self.executor.map(&prepared, |(_, v)| self.walk(v, trail))?;
        let out: Map<String, JsonValue> = prepared
            .into_iter()
            .map(|(k, _)| k)
            .zip(values)
            .collect();
        Ok(JsonValue::Object(out))
    }

    /// Claims `id` for this call. Returns false if it was already claimed.
    fn claim(&self, id: &str) -> bool {
        let mut claimed = self.claimed.lock().unwrap_or_else(|p| p.into_inner());
        claimed.insert(id.to_owned())
    }

    fn lock_inline(&self) -> std::sync::MutexGuard<'_, HashMap<usize, (ObjectRef, JsonValue)>> {
        self.inline_done.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Handle, Serializable};
    use serde_json::json;

    #[derive(Debug, Clone, Default, Serializable)]
    struct Tag {
        label: String,
    }

    #[derive(Debug, Default, Serializable)]
    #[serializable(no_inline)]
    struct Chain {
        next: Option<Handle<Chain>>,
    }

    fn registry() -> Registry {
        let registry = Registry::new();
        registry.register::<Tag>().register::<Chain>();
        registry
    }

    #[test]
    fn shared_inline_object_is_written_twice() -> Result<()> {
        let registry = registry();
        let tag = Value::object(Tag { label: "x".into() });
        let out = Dehydrator::new(&registry)
            .parallel(false)
            .dehydrate(&Value::Sequence(vec![tag.clone(), tag]))?;

        let record = json!({"$type": "Tag", "$value": {"label": "x"}});
        assert_eq!(out.root, json!([record.clone(), record]));
        assert!(out.externals.is_empty());
        Ok(())
    }

    #[test]
    fn inline_cycle_is_rejected() -> Result<()> {
        let registry = registry();
        let a = Handle::new(Chain::default());
        let b = Handle::new(Chain {
            next: Some(a.clone()),
        });
        a.write(|c| c.next = Some(b.clone()))?;

        let err = Dehydrator::new(&registry).dehydrate(&Value::Object(a.object().clone()));
        assert!(matches!(err, Err(RehydrateError::Cycle { type_name }) if type_name == "Chain"));

        // Break the cycle so the cells are freed.
        a.write(|c| c.next = None)?;
        Ok(())
    }

    #[test]
    fn unregistered_and_non_finite_values_fail() {
        let registry = Registry::new();
        let dehydrator = Dehydrator::new(&registry);
        assert!(matches!(
            dehydrator.dehydrate(&Value::object(Tag::default())),
            Err(RehydrateError::UnknownType { .. })
        ));
        assert!(matches!(
            dehydrator.dehydrate(&Value::Float(f64::NAN)),
            Err(RehydrateError::Format(_))
        ));
    }

    #[test]
    fn colliding_keyed_structure_is_rejected() {
        let registry = Registry::new();
        let keyed = Value::Keyed(BTreeMap::from([(
            "$type".to_owned(),
            Value::String("Tag".into()),
        )]));
        assert!(Dehydrator::new(&registry).dehydrate(&keyed).is_err());
    }
}
