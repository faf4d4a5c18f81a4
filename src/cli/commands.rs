//! Command execution.
//!
//! Loads the deployment config and the bundle catalog, runs the
//! orchestrator, and reports the aggregate result on the console. The exit
//! code is zero only when every bundle produced its artifacts.

use std::path::Path;

use log::info;

use crate::bundler::{BuildReport, BundleOrchestrator, DeployConfig, SettingsBuilder};
use crate::catalog::read_bundle_catalog;
use crate::cli::args::{Args, BuildArgs, Command};
use crate::cli::output::Console;
use crate::error::Result;

/// File name of the machine-readable run report, written to the output
/// directory.
pub const BUILD_REPORT_FILE: &str = "build_report.json";

/// Executes the parsed command, returning the process exit code.
pub async fn execute_command(args: Args) -> Result<i32> {
    match args.command {
        Command::Build(build) => run_build(build).await,
    }
}

async fn run_build(args: BuildArgs) -> Result<i32> {
    let console = Console::new(args.quiet);

    let config = DeployConfig::load(&args.config)?;
    let mut builder = SettingsBuilder::new()
        .deploy_config(config)
        .output_dir(&args.output_dir)
        .fragments_dir(&args.fragments_dir)
        .official(args.official)
        .file_prefix(&args.prefix)
        .jobs(args.jobs);
    if let Some(work_dir) = &args.work_dir {
        builder = builder.work_dir(work_dir);
    }
    let settings = builder.build()?;

    let bundles = read_bundle_catalog(&args.catalog)?;
    info!(
        "assembling {} bundle(s) from {}",
        bundles.len(),
        args.catalog.display()
    );
    let _ = console.section(&format!(
        "Assembling {} bundle(s) ({})",
        bundles.len(),
        if args.official { "official" } else { "unofficial" }
    ));

    let orchestrator = BundleOrchestrator::from_settings(settings)?;
    let report = orchestrator.run(bundles).await?;

    print_report(&console, &report);
    write_report(&args.output_dir, &report)?;

    Ok(if report.all_succeeded() { 0 } else { 1 })
}

fn print_report(console: &Console, report: &BuildReport) {
    for artifact in &report.artifacts {
        let _ = console.success(&format!(
            "{}: {} ({} bytes)",
            artifact.bundle,
            artifact.installer.display(),
            artifact.size
        ));
        let _ = console.indent(&format!("manifest: {}", artifact.manifest.display()));
        let _ = console.indent(&format!("sha256: {}", artifact.checksum));
        if let Some(msi) = &artifact.msi {
            let _ = console.indent(&format!("enterprise msi: {}", msi.display()));
        }
        if !artifact.tagged.is_empty() {
            let _ = console.indent(&format!("tagged variants: {}", artifact.tagged.len()));
        }
    }
    for failure in &report.failures {
        console.error(&format!(
            "{} failed after {:?}: {}",
            failure.bundle, failure.phase, failure.error
        ));
    }

    let _ = console.println("");
    if report.all_succeeded() {
        let _ = console.success(&format!("{} bundle(s) assembled", report.artifacts.len()));
    } else {
        let _ = console.warn(&format!(
            "{} bundle(s) assembled, {} failed",
            report.artifacts.len(),
            report.failures.len()
        ));
    }
}

fn write_report(output_dir: &Path, report: &BuildReport) -> Result<()> {
    let path = output_dir.join(BUILD_REPORT_FILE);
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(&path, json)?;
    Ok(())
}
