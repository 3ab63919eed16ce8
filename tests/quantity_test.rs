//! Quantity parsing and semantic comparison.

use std::collections::BTreeMap;

use ssvirt_reconciler::helpers::{parse_quantity, quantity_maps_equal, quantity_to_mb};

fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn suffix_families() {
    assert_eq!(parse_quantity("1"), Some(1000));
    assert_eq!(parse_quantity("500m"), Some(500));
    assert_eq!(parse_quantity("1.5"), Some(1500));
    assert_eq!(parse_quantity("1k"), Some(1_000_000));
    assert_eq!(parse_quantity("1Ki"), Some(1_024_000));
    assert_eq!(parse_quantity("1e3"), parse_quantity("1k"));
    assert_eq!(parse_quantity("2Gi"), parse_quantity("2048Mi"));
}

#[test]
fn garbage_is_rejected() {
    for raw in ["", "abc", "Gi", "1Zi", "1.2.3", "12 Mi"] {
        assert_eq!(parse_quantity(raw), None, "{raw}");
    }
}

#[test]
fn memory_converts_to_whole_mebibytes() {
    assert_eq!(quantity_to_mb("4Gi"), Some(4096));
    assert_eq!(quantity_to_mb("1536Mi"), Some(1536));
    assert_eq!(quantity_to_mb("1G"), Some(953));
    assert_eq!(quantity_to_mb("-1Gi"), None);
}

#[test]
fn quota_maps_compare_by_value() {
    let desired = map(&[("limits.cpu", "4"), ("limits.memory", "4096Mi")]);
    assert!(quantity_maps_equal(
        &desired,
        &map(&[("limits.cpu", "4000m"), ("limits.memory", "4Gi")])
    ));
    assert!(!quantity_maps_equal(
        &desired,
        &map(&[("limits.cpu", "8"), ("limits.memory", "4Gi")])
    ));
    assert!(!quantity_maps_equal(&desired, &map(&[("limits.cpu", "4")])));
}
