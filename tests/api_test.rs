#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use rehydrate::{
    DataProvider, FlatRecord, Handle, MemoryProvider, RehydrateError, Registry, Result,
    Serializable, Store, Transform, TypeDescriptor, Value,
};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Default, Serializable)]
struct Point {
    x: i64,
    y: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serializable)]
#[serializable(identity = "id")]
struct Node {
    id: String,
    label: String,
}

#[derive(Debug, Default, Serializable)]
#[serializable(identity = "id", no_inline)]
struct Chain {
    id: String,
    next: Option<Handle<Chain>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serializable)]
#[serializable(identity = "id")]
struct Mod {
    id: String,
    name: String,
    tags: Vec<String>,
    #[serializable(ignore)]
    download_cache: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Default, Serializable)]
#[serializable(identity = "id")]
struct Plan {
    id: String,
    mods: Vec<Mod>,
    primary: Option<Mod>,
    origin: Point,
}

fn strict_size() -> Transform {
    Transform::typed(
        |n: i64| {
            if n < 0 {
                Err("negative size".into())
            } else {
                Ok(n)
            }
        },
        |n: i64| Ok(n),
    )
}

#[derive(Debug, Clone, PartialEq, Default, Serializable)]
#[serializable(identity = "id")]
struct Archive {
    id: String,
    #[serializable(transform = "strict_size")]
    size: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serializable)]
#[serializable(identity = "id")]
struct Shelf {
    id: String,
    archives: Vec<Archive>,
}

#[derive(Debug, Clone, PartialEq, Default, Serializable)]
struct Group {
    title: String,
    mods: Vec<Mod>,
}

#[derive(Debug, Clone, PartialEq, Default, Serializable)]
#[serializable(identity = "id")]
struct Collection {
    id: String,
    groups: Vec<Group>,
}

#[derive(Debug, Default, Serializable)]
#[serializable(identity = "id", no_inline)]
struct Ring {
    id: String,
    members: Vec<Handle<Chain>>,
}

#[derive(Debug, Default, Serializable)]
#[serializable(no_inline)]
struct Pair {
    left: Option<Handle<Chain>>,
    right: Option<Handle<Chain>>,
}

/// Memory provider with a fixed read latency, so parallel branches overlap.
#[derive(Debug)]
struct SlowProvider {
    inner: MemoryProvider,
    latency: Duration,
}

impl DataProvider for SlowProvider {
    fn has(&self, id: &str) -> Result<bool> {
        self.inner.has(id)
    }

    fn get(&self, id: &str) -> Result<FlatRecord> {
        thread::sleep(self.latency);
        self.inner.get(id)
    }

    fn put(&self, id: &str, record: &FlatRecord) -> Result<()> {
        self.inner.put(id, record)
    }
}

fn registry() -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    registry
        .register::<Point>()
        .register::<Node>()
        .register::<Chain>()
        .register::<Mod>()
        .register::<Plan>()
        .register::<Archive>()
        .register::<Shelf>()
        .register::<Group>()
        .register::<Collection>()
        .register::<Ring>()
        .register::<Pair>();
    registry
}

fn slow_store() -> Store {
    Store::builder()
        .registry(registry())
        .provider(SlowProvider {
            inner: MemoryProvider::new(),
            latency: Duration::from_millis(20),
        })
        .parallel(true)
        .build()
}

fn wide_pool() -> rayon::ThreadPool {
    rayon::ThreadPoolBuilder::new()
        .num_threads(8)
        .build()
        .expect("thread pool")
}

fn store() -> Store {
    Store::builder().registry(registry()).build()
}

fn sample_mod(id: &str) -> Mod {
    Mod {
        id: id.into(),
        name: format!("Mod {id}"),
        tags: vec!["graphics".into(), "trees".into()],
        download_cache: vec![1, 2, 3],
    }
}

// --- TESTS ---

/// Inline type
/// Validate the exact flat form of a non-externalizable object and its reconstruction.
#[test]
fn test_point_scenario() -> Result<()> {
    let store = store();
    let dehydrated = store.dehydrate(&Point { x: 1, y: 2 })?;

    assert_eq!(
        dehydrated.root,
        json!({"$type": "Point", "$value": {"x": 1, "y": 2}})
    );
    assert!(dehydrated.externals.is_empty());

    let point: Point = store.load(&dehydrated.record()?)?;
    assert_eq!(point, Point { x: 1, y: 2 });
    Ok(())
}

/// Externalizable type
/// Validate that the root becomes a placeholder and the value moves to `externals`.
#[test]
fn test_node_scenario() -> Result<()> {
    let store = store();
    let node = Node {
        id: "n1".into(),
        label: "root".into(),
    };
    let dehydrated = store.dehydrate(&node)?;

    assert_eq!(dehydrated.root, json!({"$type": "Node", "$ref": "n1"}));
    assert_eq!(dehydrated.externals.len(), 1);
    assert_eq!(
        dehydrated.externals.get("n1"),
        Some(&FlatRecord::inline(
            "Node",
            json!({"id": "n1", "label": "root"})
        ))
    );
    Ok(())
}

/// Cycle safety
/// A.next = B, B.next = A: two external records, identity restored on the way back.
#[test]
fn test_cycle_round_trip() -> Result<()> {
    let store = store();
    let a = Handle::new(Chain {
        id: "a".into(),
        next: None,
    });
    let b = Handle::new(Chain {
        id: "b".into(),
        next: Some(a.clone()),
    });
    a.write(|c| c.next = Some(b.clone()))?;

    let dehydrated = store.dehydrate(&a)?;
    assert_eq!(
        dehydrated.externals.keys().collect::<Vec<_>>(),
        vec!["a", "b"]
    );
    assert_eq!(
        dehydrated.externals["b"].value,
        Some(json!({"id": "b", "next": {"$type": "Chain", "$ref": "a"}}))
    );

    let record = store.save(&a)?;
    let a2: Handle<Chain> = store.load(&record)?;
    let b2 = a2.read(|c| c.next.clone())?.expect("a.next");
    let back = b2.read(|c| c.next.clone())?.expect("b.next");

    assert!(back.ptr_eq(&a2));
    assert!(!a2.ptr_eq(&b2));
    assert_eq!(b2.read(|c| c.id.clone())?, "b");

    // Break both cycles so the cells are freed.
    a.write(|c| c.next = None)?;
    a2.write(|c| c.next = None)?;
    Ok(())
}

/// At most one record per identity
/// The same mod reached through `mods` and `primary` is written once.
#[test]
fn test_shared_identity_written_once() -> Result<()> {
    let store = store();
    let shared = sample_mod("m1");
    let plan = Plan {
        id: "p1".into(),
        mods: vec![shared.clone(), sample_mod("m2"), shared.clone()],
        primary: Some(shared),
        origin: Point { x: 3, y: 4 },
    };

    let dehydrated = store.dehydrate(&plan)?;
    assert_eq!(
        dehydrated.externals.keys().collect::<Vec<_>>(),
        vec!["m1", "m2", "p1"]
    );
    let plan_value = dehydrated.externals["p1"].value.clone().unwrap_or_default();
    assert_eq!(plan_value["primary"], json!({"$type": "Mod", "$ref": "m1"}));
    assert_eq!(plan_value["origin"]["$type"], json!("Point"));
    Ok(())
}

/// Round trip
/// A graph of externalizable and inline objects comes back structurally equal.
#[test]
fn test_plan_round_trip() -> Result<()> {
    let store = store();
    let plan = Plan {
        id: "p1".into(),
        mods: vec![sample_mod("m1"), sample_mod("m2")],
        primary: None,
        origin: Point { x: -7, y: 9 },
    };

    store.save(&plan)?;
    let loaded: Plan = store.load_id("p1")?;

    let expected = Plan {
        mods: plan
            .mods
            .iter()
            .map(|m| Mod {
                download_cache: Vec::new(),
                ..m.clone()
            })
            .collect(),
        ..plan
    };
    assert_eq!(loaded, expected);
    Ok(())
}

/// Ignored properties
/// Declared through the derive and at runtime; neither reaches the record.
#[test]
fn test_ignored_properties_are_excluded() -> Result<()> {
    let registry = registry();
    registry.override_property("Mod", "tags", rehydrate::PropertyOverride::ignore());
    let store = Store::builder().registry(registry).build();

    let dehydrated = store.dehydrate(&sample_mod("m1"))?;
    let value = dehydrated.externals["m1"].value.clone().unwrap_or_default();
    assert_eq!(value, json!({"id": "m1", "name": "Mod m1"}));

    store.save(&sample_mod("m1"))?;
    let loaded: Mod = store.load_id("m1")?;
    assert!(loaded.download_cache.is_empty());
    assert!(loaded.tags.is_empty());
    Ok(())
}

/// Unknown types
/// A `$type` that was never registered is fatal, also when nested.
#[test]
fn test_unknown_type_rejected() {
    let store = store();

    let top = store.hydrate(&FlatRecord::inline("Ghost", json!({})));
    assert!(matches!(top, Err(RehydrateError::UnknownType { name }) if name == "Ghost"));

    let nested = store.hydrate(&FlatRecord::inline(
        "Point",
        json!({"x": {"$type": "Ghost", "$value": {}}, "y": 1}),
    ));
    assert!(matches!(nested, Err(RehydrateError::UnknownType { .. })));

    #[derive(Debug, Clone, Default, Serializable)]
    struct Unregistered {
        n: u8,
    }
    assert!(matches!(
        store.dehydrate(&Unregistered { n: 1 }),
        Err(RehydrateError::UnknownType { .. })
    ));
}

/// Custom construction
/// A custom constructor runs first, the derived `assign` finishes the instance, and the
/// derived constructor takes over when the custom one fails.
#[test]
fn test_constructor_fallback() -> Result<()> {
    let registry = Arc::new(Registry::new());
    registry.register_descriptor(
        TypeDescriptor::builder::<Point>()
            .construct_with(|fields| {
                if fields.contains_key("legacy") {
                    return Err(RehydrateError::construction("Point", "legacy layout"));
                }
                Ok(Point::default())
            })
            .build(),
    );
    let store = Store::builder().registry(registry).build();

    let fresh: Point = store.load(&FlatRecord::inline("Point", json!({"x": 5, "y": 6})))?;
    assert_eq!(fresh, Point { x: 5, y: 6 });

    let legacy: Point = store.load(&FlatRecord::inline(
        "Point",
        json!({"x": 1, "y": 2, "legacy": true}),
    ))?;
    assert_eq!(legacy, Point { x: 1, y: 2 });

    let broken = store.load::<Point>(&FlatRecord::inline("Point", json!({"x": 1, "legacy": 1})));
    assert!(matches!(broken, Err(RehydrateError::Construction { .. })));
    Ok(())
}

/// Finish hook
/// Re-derives a property the record does not carry.
#[test]
fn test_finish_hook_rederives_ignored_state() -> Result<()> {
    let registry = Arc::new(Registry::new());
    registry.register_descriptor(
        TypeDescriptor::builder::<Mod>()
            .identified()
            .finish_with(|m, _| {
                m.download_cache = m.name.as_bytes().to_vec();
                Ok(())
            })
            .build(),
    );
    let store = Store::builder().registry(registry).build();

    store.save(&sample_mod("m9"))?;
    let loaded: Mod = store.load_id("m9")?;
    assert_eq!(loaded.download_cache, b"Mod m9".to_vec());
    Ok(())
}

/// Parallel traversal
/// The rayon fan-out and the sequential walk produce the same output.
#[test]
fn test_parallel_matches_sequential() -> Result<()> {
    let registry = registry();
    let plan = Plan {
        id: "big".into(),
        mods: (0..200).map(|i| sample_mod(&format!("m{i}"))).collect(),
        primary: Some(sample_mod("m7")),
        origin: Point { x: 0, y: 0 },
    };

    let parallel = Store::builder()
        .registry(Arc::clone(&registry))
        .parallel(true)
        .build();
    let sequential = Store::builder()
        .registry(registry)
        .parallel(false)
        .build();

    let a = parallel.dehydrate(&plan)?;
    let b = sequential.dehydrate(&plan)?;
    assert_eq!(a, b);
    assert_eq!(a.externals.len(), 201);

    parallel.save(&plan)?;
    let loaded: Plan = parallel.load_id("big")?;
    assert_eq!(loaded.mods.len(), 200);
    assert_eq!(loaded.mods[42].name, "Mod m42");
    Ok(())
}

/// Overwrite policy
/// Default saves rewrite existing records; `overwrite(false)` leaves them alone.
#[test]
fn test_overwrite_and_skip() -> Result<()> {
    let registry = registry();
    let provider = Arc::new(MemoryProvider::new());
    let node = |label: &str| Node {
        id: "n1".into(),
        label: label.into(),
    };

    let skipping = Store::builder()
        .registry(Arc::clone(&registry))
        .provider(Arc::clone(&provider))
        .overwrite(false)
        .build();
    skipping.save(&node("first"))?;
    skipping.save(&node("second"))?;
    assert_eq!(skipping.load_id::<Node>("n1")?.label, "first");

    let overwriting = Store::builder()
        .registry(registry)
        .provider(Arc::clone(&provider))
        .build();
    overwriting.save(&node("third"))?;
    assert_eq!(overwriting.load_id::<Node>("n1")?.label, "third");
    assert_eq!(provider.len(), 1);
    Ok(())
}

/// Failure atomicity
/// A failing transform aborts the save before anything is written.
#[test]
fn test_transform_failure_writes_nothing() {
    let provider = Arc::new(MemoryProvider::new());
    let store = Store::builder()
        .registry(registry())
        .provider(Arc::clone(&provider))
        .build();
    let shelf = Shelf {
        id: "s1".into(),
        archives: vec![
            Archive {
                id: "ok".into(),
                size: 10,
            },
            Archive {
                id: "bad".into(),
                size: -1,
            },
        ],
    };

    match store.save(&shelf) {
        Err(RehydrateError::Transform {
            type_name,
            property,
            ..
        }) => {
            assert_eq!(type_name, "Archive");
            assert_eq!(property, "size");
        }
        other => panic!("expected a transform error, got {other:?}"),
    }
    assert!(provider.is_empty());
}

/// Root shape
/// Only typed objects can be saved.
#[test]
fn test_save_requires_object_root() {
    let store = store();
    assert!(matches!(
        store.save(&vec![1_u8, 2]),
        Err(RehydrateError::Format(_))
    ));
}

/// Parallel hydration of shared identities
/// A mod held by value in several sibling groups is complete in every one of them.
#[test]
fn test_parallel_shared_identity_by_value() -> Result<()> {
    let store = slow_store();
    let shared = sample_mod("m1");
    let collection = Collection {
        id: "c1".into(),
        groups: (0..8)
            .map(|i| Group {
                title: format!("group {i}"),
                mods: vec![shared.clone(), sample_mod(&format!("m{}", i + 2))],
            })
            .collect(),
    };
    store.save(&collection)?;

    let loaded: Collection = wide_pool().install(|| store.load_id("c1"))?;
    assert_eq!(loaded.groups.len(), 8);
    for (i, group) in loaded.groups.iter().enumerate() {
        assert_eq!(group.title, format!("group {i}"));
        assert_eq!(group.mods[0].name, "Mod m1");
        assert_eq!(group.mods[0].tags, shared.tags);
        assert_eq!(group.mods[1].id, format!("m{}", i + 2));
    }
    Ok(())
}

/// Parallel cycle restoration
/// A ring reached from every member at once still closes on the same cells.
#[test]
fn test_parallel_ring_restores_identity() -> Result<()> {
    let store = slow_store();
    let members: Vec<Handle<Chain>> = (0..4)
        .map(|i| {
            Handle::new(Chain {
                id: format!("r{i}"),
                next: None,
            })
        })
        .collect();
    for (i, member) in members.iter().enumerate() {
        let next = members[(i + 1) % members.len()].clone();
        member.write(|c| c.next = Some(next))?;
    }
    store.save(&Handle::new(Ring {
        id: "ring".into(),
        members: members.clone(),
    }))?;

    let ring: Handle<Ring> = wide_pool().install(|| store.load_id("ring"))?;
    let loaded = ring.read(|r| r.members.clone())?;
    assert_eq!(loaded.len(), 4);
    for (i, member) in loaded.iter().enumerate() {
        let next = member.read(|c| c.next.clone())?.expect("ring member has a next");
        assert!(next.ptr_eq(&loaded[(i + 1) % loaded.len()]));
        assert_eq!(member.read(|c| c.id.clone())?, format!("r{i}"));
    }

    for member in members.iter().chain(loaded.iter()) {
        member.write(|c| c.next = None)?;
    }
    Ok(())
}

/// Inline value with identity
/// A record carrying both `$ref` and `$value` is built in place and shared by later
/// references to the same identity.
#[test]
fn test_inline_value_with_identity_is_shared() -> Result<()> {
    let store = Store::builder()
        .registry(registry())
        .parallel(false)
        .build();
    let record = FlatRecord::inline(
        "Pair",
        json!({
            "left": {"$type": "Chain", "$ref": "c1", "$value": {"id": "c1", "next": null}},
            "right": {"$type": "Chain", "$ref": "c1"}
        }),
    );

    let pair: Handle<Pair> = store.load(&record)?;
    let (left, right) = pair.read(|p| (p.left.clone(), p.right.clone()))?;
    let left = left.expect("left");
    let right = right.expect("right");
    assert!(left.ptr_eq(&right));
    assert_eq!(left.read(|c| c.id.clone())?, "c1");
    Ok(())
}

proptest! {
    #[test]
    fn strict_size_round_trips(size in 0_i64..=i64::MAX) {
        let transform = strict_size();
        let stored = transform.apply_out(Value::Int(size)).unwrap();
        prop_assert_eq!(transform.apply_into(stored).unwrap(), Value::Int(size));

        let store = store();
        let archive = Archive { id: "a1".into(), size };
        store.save(&archive).unwrap();
        prop_assert_eq!(store.load_id::<Archive>("a1").unwrap(), archive);
    }

    #[test]
    fn strict_size_rejects_negative(size in i64::MIN..0_i64) {
        prop_assert!(strict_size().apply_out(Value::Int(size)).is_err());
    }
}
