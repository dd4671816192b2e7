use std::path::{Path, PathBuf};

use dataframe_schema_checker::harness::{assert_all_files_present, discover_fixtures, run_fixture};

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("testData/diagnostics")
}

fn check_fixture(relative: &str) {
    let path = fixture_dir().join(relative);
    let report = run_fixture(&path).unwrap_or_else(|error| panic!("{error}"));
    assert!(report.is_success(), "{report}");
}

macro_rules! fixture_tests {
    ($($name:ident => $path:literal,)*) => {
        $(
            #[test]
            fn $name() {
                check_fixture($path);
            }
        )*

        const REGISTERED: &[&str] = &[$(stringify!($name)),*];
    };
}

fixture_tests! {
    test_add_dsl => "add_dsl.kt",
    test_add_update => "add_update.kt",
    test_casts => "casts.kt",
    test_column_groups => "column_groups.kt",
    test_conditional => "conditional.kt",
    test_data_frame_of => "data_frame_of.kt",
    test_group_by => "group_by.kt",
    test_join => "join.kt",
    test_kotlin_constructs => "kotlin_constructs.kt",
    test_member_access => "member_access.kt",
    test_nested_extension_functions => "nested/extension-functions.kt",
    test_reserved_names => "reserved_names.kt",
    test_row_lambdas => "row_lambdas.kt",
    test_select_rename => "select_rename.kt",
    test_simple => "simple.kt",
    test_suppression => "suppression.kt",
    test_type_mismatch => "type_mismatch.kt",
    test_unknown_sources => "unknown_sources.kt",
}

#[test]
fn test_all_files_present_in_diagnostics() {
    if let Err(error) = assert_all_files_present(&fixture_dir(), REGISTERED) {
        panic!("{error}");
    }
}

#[test]
fn test_every_fixture_on_disk_matches_expectations() {
    // arrange
    let fixtures = discover_fixtures(&fixture_dir());

    // act
    let failures: Vec<String> = fixtures
        .iter()
        .filter_map(|fixture| match run_fixture(&fixture.path) {
            Ok(report) if report.is_success() => None,
            Ok(report) => Some(report.to_string()),
            Err(error) => Some(error.to_string()),
        })
        .collect();

    // assert
    assert!(!fixtures.is_empty());
    assert!(failures.is_empty(), "{}", failures.join("\n"));
}
