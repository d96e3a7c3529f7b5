use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use gradnet::error::PersistenceError;
use gradnet::io::tensor_archive::TensorArchive;
use gradnet::params::{LoadOptions, ParamSpec, ParameterStore};
use gradnet::tensor::{Shape, Tensor};

fn temp_path(tag: &str) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("gradnet_{tag}_{timestamp}.params"))
}

fn seeded_store(names: &[(&str, &[usize])]) -> ParameterStore {
    store_with_seed(11, names)
}

fn store_with_seed(seed: u64, names: &[(&str, &[usize])]) -> ParameterStore {
    let store = ParameterStore::new("").with_seed(seed);
    for (name, dims) in names {
        store
            .get(
                name,
                ParamSpec {
                    shape: Some(Shape::new(dims.to_vec())),
                    ..Default::default()
                },
            )
            .unwrap();
    }
    store
}

#[test]
fn save_load_round_trip_is_exact() {
    let store = seeded_store(&[("dense1_weight", &[4, 3]), ("dense1_bias", &[4])]);
    store.initialize(None, None, false, false).unwrap();
    let path = temp_path("roundtrip");
    store.save(&path, "").unwrap();

    // A different seed proves the values come from the file, not the RNG.
    let restored = store_with_seed(99, &[("dense1_weight", &[4, 3]), ("dense1_bias", &[4])]);
    restored.load(&path, None, LoadOptions::default()).unwrap();
    fs::remove_file(&path).unwrap();

    for name in store.keys() {
        let original = store.get(&name, ParamSpec::default()).unwrap();
        let loaded = restored.get(&name, ParamSpec::default()).unwrap();
        assert_eq!(
            original.read().value().unwrap().data(),
            loaded.read().value().unwrap().data(),
            "parameter '{name}' did not round trip"
        );
    }
}

#[test]
fn load_rejects_missing_parameter_unless_allowed() {
    let store = seeded_store(&[("w", &[2, 2])]);
    store.initialize(None, None, false, false).unwrap();
    let path = temp_path("missing");
    store.save(&path, "").unwrap();

    let bigger = seeded_store(&[("w", &[2, 2]), ("extra", &[3])]);
    let err = bigger
        .load(&path, None, LoadOptions::default())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PersistenceError>(),
        Some(PersistenceError::MissingParameter { name, .. }) if name == "extra"
    ));
    // Validation happens before mutation: the failed load touched nothing.
    assert!(!bigger
        .get("w", ParamSpec::default())
        .unwrap()
        .read()
        .is_materialized());

    bigger
        .load(
            &path,
            None,
            LoadOptions {
                allow_missing: true,
                ..Default::default()
            },
        )
        .unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn load_rejects_extra_file_entries_unless_ignored() {
    let store = seeded_store(&[("w", &[2, 2]), ("b", &[2])]);
    store.initialize(None, None, false, false).unwrap();
    let path = temp_path("extra");
    store.save(&path, "").unwrap();

    let smaller = seeded_store(&[("w", &[2, 2])]);
    let err = smaller
        .load(&path, None, LoadOptions::default())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PersistenceError>(),
        Some(PersistenceError::UnexpectedParameter { name, .. }) if name == "b"
    ));

    smaller
        .load(
            &path,
            None,
            LoadOptions {
                ignore_extra: true,
                ..Default::default()
            },
        )
        .unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn save_rejects_out_of_prefix_parameters() {
    let store = ParameterStore::new("net_");
    store
        .get(
            "w",
            ParamSpec {
                shape: Some(Shape::new([2])),
                ..Default::default()
            },
        )
        .unwrap();
    // Merge in a parameter scoped to some other component.
    let other = ParameterStore::new("other_");
    other
        .get(
            "w",
            ParamSpec {
                shape: Some(Shape::new([2])),
                ..Default::default()
            },
        )
        .unwrap();
    store.update(&other).unwrap();
    store.initialize(None, None, false, false).unwrap();

    let path = temp_path("prefix");
    let err = store.save(&path, "net_").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PersistenceError>(),
        Some(PersistenceError::StripPrefixMismatch { name, .. }) if name == "other_w"
    ));
}

#[test]
fn strip_and_restore_prefix_round_trip() {
    let store = ParameterStore::new("net_");
    store
        .get(
            "w",
            ParamSpec {
                shape: Some(Shape::new([3])),
                ..Default::default()
            },
        )
        .unwrap();
    store.initialize(None, None, false, false).unwrap();
    let path = temp_path("restore");
    store.save(&path, "net_").unwrap();

    // The archive now holds bare "w"; restore_prefix maps it back.
    let reloaded = ParameterStore::new("net_");
    reloaded
        .get(
            "w",
            ParamSpec {
                shape: Some(Shape::new([3])),
                ..Default::default()
            },
        )
        .unwrap();
    reloaded
        .load(
            &path,
            None,
            LoadOptions {
                restore_prefix: "net_".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
    fs::remove_file(&path).unwrap();

    let original = store.get("w", ParamSpec::default()).unwrap();
    let restored = reloaded.get("w", ParamSpec::default()).unwrap();
    assert_eq!(
        original.read().value().unwrap().data(),
        restored.read().value().unwrap().data()
    );
}

#[test]
fn conventional_arg_tags_are_stripped_on_load() {
    // Write an archive whose keys carry the arg:/aux: tags some exporters use.
    let mut tensors = BTreeMap::new();
    tensors.insert(
        "arg:w".to_string(),
        Tensor::from_vec(Shape::new([2]), vec![1.0, 2.0]).unwrap(),
    );
    tensors.insert(
        "aux:running_mean".to_string(),
        Tensor::from_vec(Shape::new([2]), vec![3.0, 4.0]).unwrap(),
    );
    let path = temp_path("tags");
    TensorArchive::save(&path, &tensors).unwrap();

    let store = seeded_store(&[("w", &[2]), ("running_mean", &[2])]);
    store.load(&path, None, LoadOptions::default()).unwrap();
    fs::remove_file(&path).unwrap();

    let w = store.get("w", ParamSpec::default()).unwrap();
    assert_eq!(w.read().value().unwrap().data(), &[1.0, 2.0]);
}
