#![allow(missing_docs)]

use std::sync::Arc;

use proptest::prelude::*;
use rehydrate::{
    BoxError, FlatRecord, RehydrateError, Registry, Serializable, Store, Transform,
};
use serde_json::json;

fn to_hex(bytes: Vec<u8>) -> Result<String, BoxError> {
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

fn from_hex(text: String) -> Result<Vec<u8>, BoxError> {
    if !text.is_ascii() || text.len() % 2 != 0 {
        return Err(format!("`{text}` is not a hex string").into());
    }
    let bytes = (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()?;
    Ok(bytes)
}

fn hex() -> Transform {
    Transform::typed(to_hex, from_hex)
}

#[derive(Debug, Clone, PartialEq, Default, Serializable)]
#[serializable(identity = "id")]
struct Checksum {
    id: String,
    #[serializable(transform = "hex")]
    digest: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Default, Serializable)]
#[serializable(identity = "id")]
struct Entry {
    id: String,
    weight: u32,
    labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serializable)]
#[serializable(identity = "id")]
struct Catalog {
    id: String,
    entries: Vec<Entry>,
}

fn store(parallel: bool) -> Store {
    let registry = Arc::new(Registry::new());
    registry
        .register::<Checksum>()
        .register::<Entry>()
        .register::<Catalog>();
    Store::builder()
        .registry(registry)
        .parallel(parallel)
        .build()
}

// --- TESTS ---

/// Stored form
/// Validate that the outbound converter shapes the record.
#[test]
fn test_transform_shapes_record() -> rehydrate::Result<()> {
    let store = store(false);
    let dehydrated = store.dehydrate(&Checksum {
        id: "c1".into(),
        digest: vec![0xde, 0xad, 0xbe, 0xef],
    })?;
    assert_eq!(
        dehydrated.externals["c1"].value,
        Some(json!({"id": "c1", "digest": "deadbeef"}))
    );
    Ok(())
}

/// Inbound failure
/// A stored value the inbound converter rejects fails the load with the property named.
#[test]
fn test_inbound_failure_names_property() {
    let store = store(false);
    let record = FlatRecord::inline("Checksum", json!({"id": "c1", "digest": "xyz"}));
    match store.load::<Checksum>(&record) {
        Err(RehydrateError::Transform { property, .. }) => assert_eq!(property, "digest"),
        other => panic!("expected a transform error, got {other:?}"),
    }
}

proptest! {
    #[test]
    fn transform_round_trips_arbitrary_bytes(digest in proptest::collection::vec(any::<u8>(), 0..256)) {
        let store = store(true);
        let checksum = Checksum { id: "c1".into(), digest };

        store.save(&checksum).unwrap();
        let loaded: Checksum = store.load_id("c1").unwrap();
        prop_assert_eq!(loaded, checksum);
    }

    #[test]
    fn parallel_output_matches_sequential(
        entries in proptest::collection::vec(
            (0_u32..1000, proptest::collection::vec("[a-z]{1,8}", 0..4)),
            0..64,
        )
    ) {
        let catalog = Catalog {
            id: "catalog".into(),
            entries: entries
                .into_iter()
                .enumerate()
                .map(|(i, (weight, labels))| Entry { id: format!("e{i}"), weight, labels })
                .collect(),
        };

        let parallel = store(true).dehydrate(&catalog).unwrap();
        let sequential = store(false).dehydrate(&catalog).unwrap();
        prop_assert_eq!(parallel.externals.len(), catalog.entries.len() + 1);
        prop_assert_eq!(parallel, sequential);
    }
}
