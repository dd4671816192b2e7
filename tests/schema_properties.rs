//! Property tests for the column schema model.

use std::collections::BTreeSet;

use proptest::prelude::*;

use dataframe_schema_checker::schema::{ColumnDescriptor, ColumnSchema, MergePolicy, TypeRef};

const TYPES: &[&str] = &["Int", "Long", "Double", "String", "Boolean"];

/// Strategy for schemas with distinct column names.
fn schema() -> impl Strategy<Value = ColumnSchema> {
    prop::collection::btree_set("[a-z]{1,6}", 0..8)
        .prop_flat_map(|names: BTreeSet<String>| {
            let len = names.len();
            (
                Just(names.into_iter().collect::<Vec<_>>()),
                prop::collection::vec((0..TYPES.len(), any::<bool>()), len),
            )
        })
        .prop_map(|(names, types)| {
            let columns = names
                .into_iter()
                .zip(types)
                .map(|(name, (ty, nullable))| {
                    let ty = TypeRef::simple(TYPES[ty]).with_nullable(nullable);
                    ColumnDescriptor::value(name, ty)
                })
                .collect();
            ColumnSchema::new(columns).expect("distinct names")
        })
}

fn names(schema: &ColumnSchema) -> Vec<String> {
    schema.names().map(str::to_string).collect()
}

proptest! {
    #[test]
    fn select_keeps_schema_order(
        schema in schema(),
        picks in prop::collection::vec(any::<prop::sample::Index>(), 0..6)
    ) {
        let all = names(&schema);
        prop_assume!(!all.is_empty());
        let requested: Vec<&str> =
            picks.iter().rev().map(|i| all[i.index(all.len())].as_str()).collect();

        let selected = schema.select(&requested).unwrap();

        let expected: Vec<String> =
            all.iter().filter(|n| requested.contains(&n.as_str())).cloned().collect();
        prop_assert_eq!(names(&selected), expected);
    }

    #[test]
    fn rename_roundtrip_restores_schema(schema in schema(), index in any::<prop::sample::Index>()) {
        let all = names(&schema);
        prop_assume!(!all.is_empty());
        let old = &all[index.index(all.len())];
        let new = format!("{old}_renamed");
        prop_assume!(!schema.contains(&new));

        let back = schema.rename(old, &new).unwrap().rename(&new, old).unwrap();

        prop_assert_eq!(back, schema);
    }

    #[test]
    fn merge_with_itself_is_identity_unless_strict(schema in schema()) {
        prop_assert_eq!(&schema.merge(&schema, MergePolicy::Keep).unwrap(), &schema);
        prop_assert_eq!(&schema.merge(&schema, MergePolicy::Overwrite).unwrap(), &schema);
        prop_assert_eq!(schema.merge(&schema, MergePolicy::Error).is_ok(), schema.is_empty());
    }

    #[test]
    fn merge_keeps_left_columns_first(left in schema(), right in schema()) {
        let merged = left.merge(&right, MergePolicy::Keep).unwrap();

        let merged_names = names(&merged);
        let left_names = names(&left);
        prop_assert_eq!(&merged_names[..left.len()], left_names.as_slice());
        for name in right.names() {
            prop_assert!(merged.contains(name));
        }
        let unique: BTreeSet<&String> = merged_names.iter().collect();
        prop_assert_eq!(unique.len(), merged_names.len());
    }

    #[test]
    fn without_column_removes_only_that_column(
        schema in schema(),
        index in any::<prop::sample::Index>()
    ) {
        let all = names(&schema);
        prop_assume!(!all.is_empty());
        let removed = &all[index.index(all.len())];

        let rest = schema.without_column(removed);

        prop_assert!(!rest.contains(removed));
        prop_assert_eq!(rest.len(), schema.len() - 1);
        prop_assert!(schema.require(removed).is_ok());
    }

    #[test]
    fn duplicate_names_are_rejected(schema in schema()) {
        prop_assume!(!schema.is_empty());
        let mut columns = schema.columns().to_vec();
        columns.push(columns[0].clone());

        prop_assert!(ColumnSchema::new(columns).is_err());
    }
}
