use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use dataframe_schema_checker::diagnostics::{Diagnostic, Severity};
use dataframe_schema_checker::{check_file, harness};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Parser)]
#[command(
    name = "dataframe_schema_checker",
    version,
    about = "Statically check column usage of Kotlin DataFrame code."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check Kotlin source files and report schema diagnostics.
    Check {
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,

        #[arg(long, value_enum, default_value = "text")]
        format: Format,
    },
    /// Run every `.kt` fixture below a directory against its inline expectations.
    Verify {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Check { files, format } => run_check(&files, format),
        Command::Verify { dir } => run_verify(&dir),
    };
    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every file is free of errors.
fn run_check(files: &[PathBuf], format: Format) -> Result<bool> {
    let mut clean = true;
    let mut report: Vec<serde_json::Value> = Vec::new();
    for path in files {
        let diagnostics = check_file(path)?;
        clean &= !diagnostics.iter().any(|d| d.severity == Severity::Error);
        match format {
            Format::Text => print_text(path, &diagnostics),
            Format::Json => report.push(serde_json::json!({
                "file": path.display().to_string(),
                "diagnostics": diagnostics,
            })),
        }
    }
    if format == Format::Json {
        let json =
            serde_json::to_string_pretty(&report).context("Failed to serialize diagnostics")?;
        println!("{json}");
    }
    Ok(clean)
}

fn print_text(path: &Path, diagnostics: &[Diagnostic]) {
    for diagnostic in diagnostics {
        println!("{}:{diagnostic}", path.display());
    }
}

fn run_verify(dir: &Path) -> Result<bool> {
    let reports = harness::verify_directory(dir)
        .with_context(|| format!("Failed to verify fixtures in {}", dir.display()))?;
    let failed = reports.iter().filter(|report| !report.is_success()).count();
    for report in &reports {
        println!("{report}");
    }
    println!("{} fixtures, {failed} failed", reports.len());
    Ok(failed == 0)
}
