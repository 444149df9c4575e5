//! Schema validation and option resolution.

use crate::schema::{ColumnFamilySchema, LocalityGroup, Schema, SchemaError};

#[test]
fn single_group_schema_validates() {
    let schema = Schema::single_group("lg0", &["cf0", "cf1"]);
    schema.validate().unwrap();
    assert!(schema.group("lg0").is_some());
    assert_eq!(schema.group_of_family("cf1").unwrap().name, "lg0");
    assert!(schema.group_of_family("absent").is_none());
}

#[test]
fn empty_schema_is_rejected() {
    let schema = Schema::default();
    assert!(matches!(
        schema.validate(),
        Err(SchemaError::NoLocalityGroups)
    ));
}

#[test]
fn duplicate_group_names_rejected() {
    let schema = Schema {
        table: "t".into(),
        groups: vec![
            LocalityGroup::new("lg", vec![ColumnFamilySchema::new("a")]),
            LocalityGroup::new("lg", vec![ColumnFamilySchema::new("b")]),
        ],
    };
    assert!(matches!(
        schema.validate(),
        Err(SchemaError::DuplicateGroup(_))
    ));
}

#[test]
fn family_in_two_groups_rejected() {
    let schema = Schema {
        table: "t".into(),
        groups: vec![
            LocalityGroup::new("lg0", vec![ColumnFamilySchema::new("cf")]),
            LocalityGroup::new("lg1", vec![ColumnFamilySchema::new("cf")]),
        ],
    };
    assert!(matches!(
        schema.validate(),
        Err(SchemaError::DuplicateFamily(_))
    ));
}

#[test]
fn group_without_families_rejected() {
    let schema = Schema {
        table: "t".into(),
        groups: vec![LocalityGroup::new("lg0", vec![])],
    };
    assert!(matches!(schema.validate(), Err(SchemaError::EmptyGroup(_))));
}

#[test]
fn effective_ttl_is_smallest_nonzero() {
    let mut group = LocalityGroup::new(
        "lg",
        vec![
            ColumnFamilySchema::new("a"),
            ColumnFamilySchema::new("b"),
            ColumnFamilySchema::new("c"),
        ],
    );
    group.families[0].ttl_micros = 0;
    group.families[1].ttl_micros = 5_000_000;
    group.families[2].ttl_micros = 1_000_000;
    assert_eq!(group.effective_ttl_micros(), 1_000_000);

    group.families[1].ttl_micros = 0;
    group.families[2].ttl_micros = 0;
    assert_eq!(group.effective_ttl_micros(), 0);
}

#[test]
fn effective_max_versions_unlimited_dominates() {
    let mut group = LocalityGroup::new(
        "lg",
        vec![ColumnFamilySchema::new("a"), ColumnFamilySchema::new("b")],
    );
    group.families[0].max_versions = 3;
    group.families[1].max_versions = 0;
    assert_eq!(group.effective_max_versions(), 0);

    group.families[1].max_versions = 7;
    assert_eq!(group.effective_max_versions(), 7);
}
