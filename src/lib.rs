pub mod checker;
pub mod diagnostics;
pub mod error;
pub mod harness;
pub mod host;
pub mod inference;
pub mod registry;
pub mod schema;
pub mod syntax;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::checker::{Checker, CheckerOptions};
use crate::diagnostics::Diagnostic;
use crate::host::KotlinHost;
use crate::registry::OperationRegistry;

pub const CONFIG_FILE: &str = "dataframe-checker.toml";
const PROJECT_MARKERS: &[&str] = &[CONFIG_FILE, "settings.gradle.kts", "build.gradle.kts"];

#[derive(Deserialize)]
struct Config {
    checker: Option<CheckerConfig>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckerConfig {
    pub enabled: Option<bool>,
    pub warnings: Option<bool>,
    pub max_suggestion_distance: Option<usize>,
    pub report_untracked: Option<bool>,
}

impl CheckerConfig {
    pub fn options(&self) -> CheckerOptions {
        let defaults = CheckerOptions::default();
        CheckerOptions {
            warnings: self.warnings.unwrap_or(defaults.warnings),
            max_suggestion_distance: self
                .max_suggestion_distance
                .unwrap_or(defaults.max_suggestion_distance),
            report_untracked: self.report_untracked.unwrap_or(defaults.report_untracked),
        }
    }
}

/// `[checker]` table of the project's config file; defaults when the file is
/// missing or unreadable.
pub fn load_checker_config(project_root: &Path) -> CheckerConfig {
    let config_path = project_root.join(CONFIG_FILE);
    let Ok(content) = fs::read_to_string(&config_path) else {
        return CheckerConfig::default();
    };
    match toml::from_str::<Config>(&content) {
        Ok(config) => config.checker.unwrap_or_default(),
        Err(error) => {
            debug!(path = %config_path.display(), %error, "ignoring malformed config");
            CheckerConfig::default()
        }
    }
}

pub fn is_enabled(project_root: &Path) -> bool {
    load_checker_config(project_root).enabled.unwrap_or(true)
}

pub fn find_project_root(start_path: &Path) -> PathBuf {
    let mut current = start_path.to_path_buf();
    if current.is_file() {
        current.pop();
    }
    loop {
        if PROJECT_MARKERS.iter().any(|marker| current.join(marker).exists()) {
            return current;
        }
        if !current.pop() {
            return start_path.to_path_buf();
        }
    }
}

/// The standard operation table, built once per process.
pub fn standard_registry() -> &'static OperationRegistry {
    static REGISTRY: OnceLock<OperationRegistry> = OnceLock::new();
    REGISTRY.get_or_init(OperationRegistry::standard)
}

/// Parses and checks one source unit.
pub fn analyze_source(source: &str, options: &CheckerOptions) -> Result<Vec<Diagnostic>> {
    let unit = syntax::parse_source(source)?;
    let host = KotlinHost::new(&unit);
    let checker = Checker::new(&host, standard_registry(), options.clone());
    Ok(checker.check(&unit, source))
}

/// Checks a file with the configuration of its project.
pub fn check_file(path: &Path) -> Result<Vec<Diagnostic>> {
    let project_root = find_project_root(path);
    let config = load_checker_config(&project_root);
    if !config.enabled.unwrap_or(true) {
        debug!(path = %path.display(), "checker disabled for project");
        return Ok(Vec::new());
    }
    let source = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    analyze_source(&source, &config.options())
        .with_context(|| format!("Failed to check {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{DiagnosticKind, Severity};

    const SHADOWING: &str = r#"
@DataSchema
interface Stats {
    val size: Int
}

fun main() {
    val df: DataFrame<Stats> = load()
    df["sizes"]
}
"#;

    #[test]
    fn test_find_project_root() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        let sub = root.join("a/b/c");
        fs::create_dir_all(&sub).unwrap();
        fs::write(root.join("settings.gradle.kts"), "").unwrap();

        assert_eq!(find_project_root(&sub), root);
        assert_eq!(find_project_root(root), root);
    }

    #[test]
    fn test_find_project_root_prefers_nearest_marker() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        let module = root.join("app");
        fs::create_dir_all(module.join("src")).unwrap();
        fs::write(root.join("settings.gradle.kts"), "").unwrap();
        fs::write(module.join("build.gradle.kts"), "").unwrap();
        let file = module.join("src/Main.kt");
        fs::write(&file, "").unwrap();

        assert_eq!(find_project_root(&file), module);
    }

    #[test]
    fn test_is_enabled() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();

        // Case 1: no config file -> enabled by default
        assert!(is_enabled(root));

        // Case 2: config without checker table -> enabled by default
        fs::write(root.join(CONFIG_FILE), "[other]\nenabled = false").unwrap();
        assert!(is_enabled(root));

        // Case 3: checker.enabled = false
        fs::write(root.join(CONFIG_FILE), "[checker]\nenabled = false").unwrap();
        assert!(!is_enabled(root));

        // Case 4: malformed file -> defaults
        fs::write(root.join(CONFIG_FILE), "[checker\nenabled = ").unwrap();
        assert!(is_enabled(root));
    }

    #[test]
    fn test_should_map_config_to_options() {
        // arrange
        let temp = tempfile::tempdir().unwrap();
        fs::write(
            temp.path().join(CONFIG_FILE),
            "[checker]\nwarnings = false\nmax_suggestion_distance = 4\nreport_untracked = true\n",
        )
        .unwrap();

        // act
        let options = load_checker_config(temp.path()).options();

        // assert
        assert_eq!(
            options,
            CheckerOptions {
                warnings: false,
                max_suggestion_distance: 4,
                report_untracked: true,
            }
        );
        assert_eq!(CheckerConfig::default().options(), CheckerOptions::default());
    }

    #[test]
    fn test_should_check_file_with_project_config() {
        // arrange
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        let file = root.join("Main.kt");
        fs::write(&file, SHADOWING).unwrap();

        // act
        let with_warnings = check_file(&file).unwrap();
        fs::write(root.join(CONFIG_FILE), "[checker]\nwarnings = false").unwrap();
        let errors_only = check_file(&file).unwrap();
        fs::write(root.join(CONFIG_FILE), "[checker]\nenabled = false").unwrap();
        let disabled = check_file(&file).unwrap();

        // assert
        assert!(with_warnings
            .iter()
            .any(|d| d.code == DiagnosticKind::ColumnNameShadowsMember));
        assert!(errors_only.iter().all(|d| d.severity == Severity::Error));
        assert!(errors_only
            .iter()
            .any(|d| d.message == "Column 'sizes' does not exist in Stats (did you mean 'size'?)"));
        assert!(disabled.is_empty());
    }

    #[test]
    fn test_should_fail_on_unreadable_file() {
        let result = check_file(Path::new("/definitely/not/here/Main.kt"));
        assert!(result.is_err());
    }

    #[test]
    fn test_should_produce_identical_output_across_runs() {
        let options = CheckerOptions::default();
        let first = serde_json::to_string(&analyze_source(SHADOWING, &options).unwrap()).unwrap();
        let second = serde_json::to_string(&analyze_source(SHADOWING, &options).unwrap()).unwrap();
        assert_eq!(first, second);
    }
}
